//! WebSocket обработка клиентских подключений

pub mod fsm;
pub mod protocol;
pub mod session;

use std::collections::HashMap;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::mcp::McpBridge;
use crate::server::AppState;
use crate::websocket::protocol::{ClientMessage, ServerMessage};
use crate::websocket::session::Session;
use crate::xiaozhi;

/// Реестр открытых сессий: uid -> канал исходящих сообщений.
/// Нужен для доставки group-update другим участникам группы.
pub struct SessionRegistry {
    senders: RwLock<HashMap<String, mpsc::UnboundedSender<ServerMessage>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, client_uid: &str, sender: mpsc::UnboundedSender<ServerMessage>) {
        self.senders
            .write()
            .await
            .insert(client_uid.to_string(), sender);
    }

    pub async fn unregister(&self, client_uid: &str) {
        self.senders.write().await.remove(client_uid);
    }

    pub async fn send_to(&self, client_uid: &str, message: ServerMessage) -> bool {
        match self.senders.read().await.get(client_uid) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Рассылает group-update каждому из перечисленных участников.
pub(crate) async fn broadcast_group_update(state: &AppState, members: &[String]) {
    for member in members {
        let group_members = state.groups.get_group_members(member).await;
        let is_owner = state.groups.is_owner(member).await;
        state
            .registry
            .send_to(
                member,
                ServerMessage::GroupUpdate {
                    members: group_members,
                    is_owner,
                },
            )
            .await;
    }
}

pub async fn handle_connection(socket: WebSocket, state: AppState) {
    info!("New WebSocket connection");

    let client_uid = format!("{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    let device_id = fallback_id(
        &state.config.xiaozhi.device_id,
        &format!("vtuber-device-{}", client_uid),
    );
    let client_id = fallback_id(
        &state.config.xiaozhi.client_id,
        &format!("vtuber-client-{}", client_uid),
    );

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<xiaozhi::Event>();

    let xz_cfg = xiaozhi::Config {
        backend_url: state.config.xiaozhi.backend_url.clone(),
        protocol_version: state.config.xiaozhi.protocol_version,
        audio_params: xiaozhi::AudioParams {
            format: state.config.xiaozhi.audio_format.clone(),
            output_format: String::new(),
            sample_rate: state.config.xiaozhi.sample_rate,
            channels: state.config.xiaozhi.channels,
            frame_duration: state.config.xiaozhi.frame_duration,
        },
        listen_mode: state.config.xiaozhi.listen_mode.clone(),
        device_id: device_id.clone(),
        client_id: client_id.clone(),
        access_token: state.config.xiaozhi.access_token.clone(),
        feature_aec: state.config.xiaozhi.feature_aec,
    };

    let upstream = xiaozhi::Client::new(xz_cfg, event_tx);
    let mcp = McpBridge::new(
        device_id.clone(),
        client_id.clone(),
        outbound_tx.clone(),
        upstream.clone(),
    );
    let mut session = Session::new(
        state.clone(),
        outbound_tx.clone(),
        upstream.clone(),
        mcp,
        client_uid.clone(),
    );

    info!(
        session_id = %client_uid,
        device_id = %device_id,
        client_id = %client_id,
        audio_format = %state.config.xiaozhi.audio_format,
        sample_rate = state.config.xiaozhi.sample_rate,
        channels = state.config.xiaozhi.channels,
        frame_duration = state.config.xiaozhi.frame_duration,
        "ws session opened"
    );

    state.registry.register(&client_uid, outbound_tx).await;
    state.groups.register_client(&client_uid).await;
    session.send_model_and_conf();
    upstream.connect();

    let (mut ws_sink, mut ws_read) = socket.split();

    // Запись в сокет сериализуется одним таском, читающим канал сессии
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "ws serialize failed");
                    continue;
                }
            };
            if let Err(e) = ws_sink.send(WsMessage::Text(text)).await {
                debug!(error = %e, "ws send failed");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            incoming = ws_read.next() => {
                let message = match incoming {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!(error = %e, "ws connection closed");
                        break;
                    }
                    None => break,
                };
                match message {
                    WsMessage::Text(text) => {
                        let parsed: ClientMessage = match serde_json::from_str(&text) {
                            Ok(parsed) => parsed,
                            Err(_) => {
                                session_error(&state, &client_uid, "invalid json").await;
                                continue;
                            }
                        };
                        if !matches!(parsed, ClientMessage::Heartbeat) {
                            debug!(session_id = %client_uid, "ws incoming message");
                        }
                        session.handle_incoming(parsed).await;
                    }
                    WsMessage::Close(_) => {
                        info!("WebSocket connection closed");
                        break;
                    }
                    _ => {}
                }
            }
            event = event_rx.recv() => {
                match event {
                    Some(event) => session.handle_event(event).await,
                    None => break,
                }
            }
        }
    }

    upstream.close().await;
    session.release_audio();
    writer.abort();

    state.registry.unregister(&client_uid).await;
    let affected = state.groups.remove_client(&client_uid).await;
    broadcast_group_update(&state, &affected).await;

    info!(session_id = %client_uid, "ws session closed");
}

async fn session_error(state: &AppState, client_uid: &str, message: &str) {
    state
        .registry
        .send_to(client_uid, ServerMessage::error(message))
        .await;
}

fn fallback_id(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
