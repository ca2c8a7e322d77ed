//! Клиент XiaoZhi: подключение, hello-рукопожатие, цикл чтения, reconnect

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::audio::OpusDecoder;
use crate::xiaozhi::codec::{self, PayloadKind};
use crate::xiaozhi::{
    initial_downstream_audio, normalize_listen_mode, AudioFrame, AudioParams, Config,
};

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const HELLO_POLL_INTERVAL: Duration = Duration::from_millis(10);
const PONG_DEADLINE: Duration = Duration::from_secs(5);
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// События клиента, доставляются сессии через канал вместо колбеков.
#[derive(Debug)]
pub enum Event {
    Stt { text: String },
    Llm { text: String, state: String },
    Text { text: String },
    Tts { state: String, text: String },
    Mcp { payload: Value },
    Goodbye,
    Audio(AudioFrame),
    Connected,
    Disconnected { error: String },
    Error { message: String },
}

struct State {
    session_id: String,
    protocol_version: u32,
    listen_mode: String,
    downstream: AudioParams,
}

struct Inner {
    cfg: Config,
    events: mpsc::UnboundedSender<Event>,
    // Запись сериализуется отдельным мьютексом, состояние отдельным
    writer: tokio::sync::Mutex<Option<WsSink>>,
    state: Mutex<State>,
    hello_ready: AtomicBool,
    closed: AtomicBool,
}

/// Клиент протокола XiaoZhi. Один фоновый таск ведет
/// dial -> hello -> read -> backoff -> retry до вызова close().
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(mut cfg: Config, events: mpsc::UnboundedSender<Event>) -> Self {
        cfg.protocol_version = codec::normalize_version(cfg.protocol_version);
        cfg.audio_params = crate::xiaozhi::normalize_audio_params(cfg.audio_params.clone());
        cfg.listen_mode = normalize_listen_mode(&cfg.listen_mode);

        let downstream = initial_downstream_audio(&cfg.audio_params);
        let state = State {
            session_id: String::new(),
            protocol_version: cfg.protocol_version,
            listen_mode: cfg.listen_mode.clone(),
            downstream,
        };

        Self {
            inner: Arc::new(Inner {
                cfg,
                events,
                writer: tokio::sync::Mutex::new(None),
                state: Mutex::new(state),
                hello_ready: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Запускает фоновый таск подключения.
    pub fn connect(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            client.run().await;
        });
    }

    /// Помечает клиента закрытым и разрывает текущее соединение.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.hello_ready.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    pub fn set_listen_mode(&self, mode: &str) {
        let mode = normalize_listen_mode(mode);
        self.lock_state().listen_mode = mode;
    }

    pub fn session_id(&self) -> String {
        self.lock_state().session_id.clone()
    }

    pub fn protocol_version(&self) -> u32 {
        self.lock_state().protocol_version
    }

    fn listen_mode(&self) -> String {
        self.lock_state().listen_mode.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().expect("xiaozhi state poisoned")
    }

    pub async fn send_text_input(&self, text: &str) -> Result<()> {
        self.wait_hello_ready().await?;
        let mut payload = json!({
            "type": "listen",
            "state": "detect",
            "mode": self.listen_mode(),
            "text": text,
            "device_id": self.inner.cfg.device_id,
        });
        self.attach_session_id(&mut payload);
        self.send_json(&payload).await
    }

    pub async fn send_listen_state(&self, state: &str) -> Result<()> {
        self.wait_hello_ready().await?;
        let mut payload = json!({
            "type": "listen",
            "state": state,
            "mode": self.listen_mode(),
            "device_id": self.inner.cfg.device_id,
        });
        self.attach_session_id(&mut payload);
        self.send_json(&payload).await
    }

    pub async fn abort(&self) -> Result<()> {
        self.wait_hello_ready().await?;
        let mut payload = json!({
            "type": "abort",
            "reason": "user_interrupt",
        });
        self.attach_session_id(&mut payload);
        self.send_json(&payload).await
    }

    pub async fn send_mcp(&self, payload: Value) -> Result<()> {
        self.wait_hello_ready().await?;
        let mut wrapper = json!({
            "type": "mcp",
            "payload": payload,
        });
        self.attach_session_id(&mut wrapper);
        self.send_json(&wrapper).await
    }

    /// Отправляет аудио бинарным кадром по согласованной версии фрейминга.
    pub async fn send_audio(&self, audio: &[u8]) -> Result<()> {
        self.wait_hello_ready().await?;
        let frame = codec::pack(self.protocol_version(), audio);
        let mut writer = self.inner.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("xiaozhi connection not ready"))?;
        sink.send(Message::Binary(frame)).await?;
        Ok(())
    }

    async fn send_json(&self, payload: &Value) -> Result<()> {
        let text = serde_json::to_string(payload).context("serialize xiaozhi payload")?;
        let mut writer = self.inner.writer.lock().await;
        let sink = writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("xiaozhi connection not ready"))?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    fn attach_session_id(&self, payload: &mut Value) {
        let session_id = self.session_id();
        if session_id.is_empty() {
            return;
        }
        if let Some(map) = payload.as_object_mut() {
            map.insert("session_id".to_string(), Value::String(session_id));
        }
    }

    /// Барьер hello-ready: все отправки кроме hello ждут подтверждения рукопожатия.
    async fn wait_hello_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + HELLO_TIMEOUT;
        loop {
            if self.inner.writer.lock().await.is_none() {
                anyhow::bail!("xiaozhi connection not ready");
            }
            if self.inner.hello_ready.load(Ordering::SeqCst) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("xiaozhi hello not acknowledged");
            }
            sleep(HELLO_POLL_INTERVAL).await;
        }
    }

    async fn run(self) {
        let mut delay = BACKOFF_START;
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }
            info!(
                backend_url = %self.inner.cfg.backend_url,
                device_id = %self.inner.cfg.device_id,
                client_id = %self.inner.cfg.client_id,
                "xiaozhi connecting"
            );
            let read = match self.connect_once().await {
                Ok(read) => read,
                Err(e) => {
                    self.report_error(&e.to_string());
                    warn!(error = %e, "xiaozhi connect failed");
                    sleep(delay).await;
                    delay = next_backoff(delay);
                    continue;
                }
            };
            info!(
                backend_url = %self.inner.cfg.backend_url,
                protocol_version = self.protocol_version(),
                "xiaozhi connected"
            );
            delay = BACKOFF_START;

            let err = self.read_loop(read).await;
            self.drop_connection().await;
            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }
            let _ = self.inner.events.send(Event::Disconnected {
                error: err.to_string(),
            });
            self.report_error(&err.to_string());
            warn!(error = %err, "xiaozhi connection lost");
            sleep(delay).await;
            delay = next_backoff(delay);
        }
    }

    async fn connect_once(&self) -> Result<WsRead> {
        let url = self.inner.cfg.backend_url.clone();
        anyhow::ensure!(!url.is_empty(), "xiaozhi backend url is empty");

        let version = self.protocol_version();
        let mut request = Request::builder()
            .uri(url.as_str())
            .header("Protocol-Version", version.to_string())
            .header("Client-Id", self.inner.cfg.client_id.as_str())
            .header("Device-Id", self.inner.cfg.device_id.as_str())
            .header("Host", extract_host(&url))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            );
        if !self.inner.cfg.access_token.is_empty() {
            request = request.header(
                "Authorization",
                format!("Bearer {}", self.inner.cfg.access_token),
            );
        }
        let request = request.body(()).context("build xiaozhi request")?;

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("xiaozhi dial")?;
        let (sink, read) = stream.split();

        if self.inner.closed.load(Ordering::SeqCst) {
            anyhow::bail!("client closed");
        }

        {
            let mut writer = self.inner.writer.lock().await;
            if let Some(mut old) = writer.replace(sink) {
                let _ = old.close().await;
            }
        }
        self.inner.hello_ready.store(false, Ordering::SeqCst);
        {
            let mut state = self.lock_state();
            state.session_id.clear();
            state.downstream = initial_downstream_audio(&self.inner.cfg.audio_params);
        }

        self.send_hello().await?;
        Ok(read)
    }

    async fn send_hello(&self) -> Result<()> {
        let params = &self.inner.cfg.audio_params;
        let mut audio_params = json!({
            "format": params.format,
            "sample_rate": params.sample_rate,
            "channels": params.channels,
            "frame_duration": params.frame_duration,
        });
        if !params.output_format.is_empty() {
            audio_params["output_format"] = Value::String(params.output_format.clone());
        }

        let payload = json!({
            "type": "hello",
            "device_id": self.inner.cfg.device_id,
            "version": self.protocol_version(),
            "features": {
                "mcp": true,
                "aec": self.inner.cfg.feature_aec,
            },
            "transport": "websocket",
            "audio_params": audio_params,
        });
        self.send_json(&payload).await
    }

    async fn drop_connection(&self) {
        self.inner.hello_ready.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    async fn read_loop(&self, mut read: WsRead) -> anyhow::Error {
        let mut decoder = DecoderState::default();
        loop {
            let message = match read.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return e.into(),
                None => return anyhow::anyhow!("xiaozhi stream ended"),
            };
            match message {
                Message::Text(text) => self.handle_text(text.as_bytes()),
                Message::Binary(data) => {
                    let version = self.protocol_version();
                    let (payload, kind) = match codec::decode(version, &data) {
                        Ok(decoded) => decoded,
                        Err(e) => {
                            self.report_error(&e.to_string());
                            continue;
                        }
                    };
                    if payload.is_empty() {
                        continue;
                    }
                    if kind == PayloadKind::Command {
                        self.handle_text(payload);
                        continue;
                    }
                    self.handle_binary_frame(payload, &mut decoder);
                }
                Message::Ping(data) => {
                    self.send_pong(data).await;
                }
                Message::Close(_) => {
                    return anyhow::anyhow!("xiaozhi connection closed");
                }
                _ => {}
            }
        }
    }

    async fn send_pong(&self, data: Vec<u8>) {
        let mut writer = self.inner.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            if timeout(PONG_DEADLINE, sink.send(Message::Pong(data)))
                .await
                .is_err()
            {
                debug!("xiaozhi pong write deadline exceeded");
            }
        }
    }

    fn handle_text(&self, data: &[u8]) {
        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "type", default)]
            kind: String,
            #[serde(default)]
            session_id: String,
            #[serde(default)]
            text: String,
            #[serde(default)]
            state: String,
            #[serde(default)]
            payload: Value,
        }

        let envelope: Envelope = match serde_json::from_slice(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.report_error(&format!("xiaozhi message parse: {}", e));
                return;
            }
        };
        if !envelope.session_id.trim().is_empty() {
            self.lock_state().session_id = envelope.session_id.trim().to_string();
        }

        match envelope.kind.as_str() {
            "hello" => self.handle_hello(data),
            "stt" => {
                if !envelope.text.is_empty() {
                    let _ = self.inner.events.send(Event::Stt {
                        text: envelope.text,
                    });
                }
            }
            "llm" => {
                if !envelope.text.is_empty() {
                    let _ = self.inner.events.send(Event::Llm {
                        text: envelope.text,
                        state: envelope.state,
                    });
                }
            }
            "text" => {
                if !envelope.text.is_empty() {
                    let _ = self.inner.events.send(Event::Text {
                        text: envelope.text,
                    });
                }
            }
            "tts" => {
                let _ = self.inner.events.send(Event::Tts {
                    state: envelope.state,
                    text: envelope.text,
                });
            }
            "mcp" => {
                let _ = self.inner.events.send(Event::Mcp {
                    payload: envelope.payload,
                });
            }
            "goodbye" => {
                let _ = self.inner.events.send(Event::Goodbye);
            }
            _ => {}
        }
    }

    fn handle_hello(&self, data: &[u8]) {
        #[derive(Deserialize, Default)]
        struct HelloAudio {
            #[serde(default)]
            format: String,
            #[serde(default)]
            output_format: String,
            #[serde(default)]
            sample_rate: u32,
            #[serde(default)]
            channels: u32,
            #[serde(default)]
            frame_duration: u32,
        }
        #[derive(Deserialize)]
        struct Hello {
            #[serde(default)]
            version: u32,
            #[serde(default)]
            audio_params: HelloAudio,
        }

        let hello: Hello = match serde_json::from_slice(data) {
            Ok(hello) => hello,
            Err(e) => {
                self.report_error(&format!("xiaozhi hello parse: {}", e));
                return;
            }
        };

        if hello.version > 0 {
            let normalized = codec::normalize_version(hello.version);
            let mut state = self.lock_state();
            if state.protocol_version != normalized {
                state.protocol_version = normalized;
                drop(state);
                info!(
                    protocol_version = normalized,
                    "xiaozhi negotiated protocol version updated"
                );
            }
        }

        let audio = hello.audio_params;
        if !audio.format.is_empty()
            || !audio.output_format.is_empty()
            || audio.sample_rate > 0
            || audio.channels > 0
            || audio.frame_duration > 0
        {
            self.update_downstream_audio(&audio.format, &audio.output_format, audio.sample_rate, audio.channels, audio.frame_duration);
        }

        let downstream = self.downstream_snapshot();
        info!(
            session_id = %self.session_id(),
            protocol_version = self.protocol_version(),
            downstream_format = %downstream.format,
            downstream_sample_rate = downstream.sample_rate,
            downstream_channels = downstream.channels,
            downstream_frame_duration = downstream.frame_duration,
            "xiaozhi hello acknowledged"
        );

        // hello-ready взводится ровно один раз за время жизни соединения
        if !self.inner.hello_ready.swap(true, Ordering::SeqCst) {
            let _ = self.inner.events.send(Event::Connected);
        }
    }

    fn update_downstream_audio(
        &self,
        format: &str,
        output_format: &str,
        sample_rate: u32,
        channels: u32,
        frame_duration: u32,
    ) {
        let mut state = self.lock_state();

        let mut resolved = crate::xiaozhi::normalize_audio_format(output_format);
        if resolved.is_empty() {
            resolved = crate::xiaozhi::normalize_audio_format(format);
        }
        if resolved.is_empty() {
            resolved = state.downstream.format.clone();
        }
        if resolved.is_empty() {
            resolved = "opus".to_string();
        }

        let sample_rate = first_positive(sample_rate, state.downstream.sample_rate, 16000);
        let channels = first_positive(channels, state.downstream.channels, 1);
        let frame_duration = first_positive(frame_duration, state.downstream.frame_duration, 20);

        state.downstream.format = resolved;
        state.downstream.sample_rate = sample_rate;
        state.downstream.channels = channels;
        state.downstream.frame_duration = frame_duration;
    }

    fn downstream_snapshot(&self) -> AudioParams {
        let state = self.lock_state();
        let mut downstream = state.downstream.clone();
        drop(state);
        if downstream.format.is_empty() {
            downstream.format = "opus".to_string();
        }
        downstream.sample_rate = first_positive(downstream.sample_rate, 0, 16000);
        downstream.channels = first_positive(downstream.channels, 0, 1);
        downstream.frame_duration = first_positive(downstream.frame_duration, 0, 20);
        downstream
    }

    fn handle_binary_frame(&self, frame: &[u8], decoder: &mut DecoderState) {
        let downstream = self.downstream_snapshot();
        match downstream.format.as_str() {
            "opus" => {
                let pcm = match decoder.decode(frame, downstream.sample_rate, downstream.channels)
                {
                    Ok(pcm) => pcm,
                    Err(e) => {
                        self.report_error(&e.to_string());
                        return;
                    }
                };
                if pcm.is_empty() {
                    return;
                }
                let _ = self.inner.events.send(Event::Audio(AudioFrame {
                    pcm,
                    sample_rate: downstream.sample_rate,
                    channels: downstream.channels,
                }));
            }
            "pcm_s16le" | "pcm16" | "pcm" => {
                let _ = self.inner.events.send(Event::Audio(AudioFrame {
                    pcm: frame.to_vec(),
                    sample_rate: downstream.sample_rate,
                    channels: downstream.channels,
                }));
            }
            "wav" => {
                match decode_wav_frame(frame, downstream.sample_rate, downstream.channels) {
                    Ok((pcm, sample_rate, channels)) => {
                        let _ = self.inner.events.send(Event::Audio(AudioFrame {
                            pcm,
                            sample_rate,
                            channels,
                        }));
                    }
                    Err(e) => self.report_error(&e.to_string()),
                }
            }
            other => {
                self.report_error(&format!("unsupported xiaozhi audio format: {}", other));
            }
        }
    }

    fn report_error(&self, message: &str) {
        let _ = self.inner.events.send(Event::Error {
            message: message.to_string(),
        });
    }
}

/// Декодер нисходящего Opus, пересоздается лениво при смене rate/channels.
#[derive(Default)]
struct DecoderState {
    decoder: Option<OpusDecoder>,
    sample_rate: u32,
    channels: u32,
}

impl DecoderState {
    fn decode(&mut self, frame: &[u8], sample_rate: u32, channels: u32) -> Result<Vec<u8>> {
        let sample_rate = if sample_rate > 0 { sample_rate } else { 16000 };
        let channels = if channels > 0 { channels } else { 1 };

        if self.decoder.is_none() || self.sample_rate != sample_rate || self.channels != channels
        {
            self.decoder = Some(OpusDecoder::new(sample_rate, channels)?);
            self.sample_rate = sample_rate;
            self.channels = channels;
        }
        let decoder = self.decoder.as_mut().expect("decoder just initialized");
        let samples = decoder.decode(frame)?;

        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            pcm.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(pcm)
    }
}

/// Разбирает WAV кадр по чанкам: fmt задает rate/channels/bits, data несет PCM.
fn decode_wav_frame(
    frame: &[u8],
    fallback_sample_rate: u32,
    fallback_channels: u32,
) -> Result<(Vec<u8>, u32, u32)> {
    if frame.len() < 12 || &frame[0..4] != b"RIFF" || &frame[8..12] != b"WAVE" {
        anyhow::bail!("invalid wav frame");
    }

    let mut sample_rate = first_positive(fallback_sample_rate, 0, 16000);
    let mut channels = first_positive(fallback_channels, 0, 1);
    let mut bits_per_sample = 16u32;

    let mut offset = 12usize;
    let mut data_range: Option<(usize, usize)> = None;
    while offset + 8 <= frame.len() {
        let chunk_id = &frame[offset..offset + 4];
        let mut chunk_size = u32::from_le_bytes([
            frame[offset + 4],
            frame[offset + 5],
            frame[offset + 6],
            frame[offset + 7],
        ]) as usize;
        offset += 8;
        if offset + chunk_size > frame.len() {
            chunk_size = frame.len() - offset;
        }

        match chunk_id {
            b"fmt " => {
                if chunk_size >= 16 {
                    channels =
                        u16::from_le_bytes([frame[offset + 2], frame[offset + 3]]) as u32;
                    sample_rate = u32::from_le_bytes([
                        frame[offset + 4],
                        frame[offset + 5],
                        frame[offset + 6],
                        frame[offset + 7],
                    ]);
                    bits_per_sample =
                        u16::from_le_bytes([frame[offset + 14], frame[offset + 15]]) as u32;
                }
            }
            b"data" => {
                data_range = Some((offset, chunk_size));
            }
            _ => {}
        }

        offset += chunk_size;
        if chunk_size % 2 == 1 {
            offset += 1;
        }
    }

    let (data_offset, data_size) = match data_range {
        Some(range) if range.1 > 0 && range.0 + range.1 <= frame.len() => range,
        _ => anyhow::bail!("wav data chunk not found"),
    };
    if bits_per_sample != 16 {
        anyhow::bail!("unsupported wav bits per sample");
    }
    Ok((
        frame[data_offset..data_offset + data_size].to_vec(),
        sample_rate,
        channels,
    ))
}

fn first_positive(value: u32, fallback: u32, default: u32) -> u32 {
    if value > 0 {
        return value;
    }
    if fallback > 0 {
        return fallback;
    }
    default
}

fn next_backoff(delay: Duration) -> Duration {
    if delay >= BACKOFF_MAX {
        return BACKOFF_MAX;
    }
    (delay * 2).min(BACKOFF_MAX)
}

fn extract_host(url: &str) -> &str {
    url.strip_prefix("wss://")
        .or_else(|| url.strip_prefix("ws://"))
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("localhost")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> (Client, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client::new(
            Config {
                backend_url: "ws://127.0.0.1:9/xiaozhi".to_string(),
                protocol_version: 2,
                ..Config::default()
            },
            tx,
        );
        (client, rx)
    }

    #[tokio::test]
    async fn test_hello_marks_ready_once_and_updates_downstream() {
        let (client, mut rx) = test_client();

        let hello = br#"{"type":"hello","session_id":"abc","version":3,
            "audio_params":{"output_format":"pcm16","sample_rate":24000,"channels":2,"frame_duration":60}}"#;
        client.handle_text(hello);
        client.handle_text(hello);

        assert_eq!(client.session_id(), "abc");
        assert_eq!(client.protocol_version(), 3);
        let downstream = client.downstream_snapshot();
        assert_eq!(downstream.format, "pcm_s16le");
        assert_eq!(downstream.sample_rate, 24000);
        assert_eq!(downstream.channels, 2);
        assert_eq!(downstream.frame_duration, 60);

        // Connected приходит ровно один раз
        let mut connected = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::Connected) {
                connected += 1;
            }
        }
        assert_eq!(connected, 1);
    }

    #[tokio::test]
    async fn test_text_dispatch_skips_empty_text() {
        let (client, mut rx) = test_client();
        client.handle_text(br#"{"type":"stt","text":""}"#);
        client.handle_text(br#"{"type":"stt","text":"hello there"}"#);
        client.handle_text(br#"{"type":"tts","state":"start","text":""}"#);

        let event = rx.try_recv().expect("stt event");
        match event {
            Event::Stt { text } => assert_eq!(text, "hello there"),
            other => panic!("unexpected event: {:?}", other),
        }
        let event = rx.try_recv().expect("tts event");
        assert!(matches!(event, Event::Tts { ref state, .. } if state == "start"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pcm_binary_frame_passthrough() {
        let (client, mut rx) = test_client();
        client.handle_text(
            br#"{"type":"hello","audio_params":{"format":"pcm_s16le","sample_rate":16000,"channels":1}}"#,
        );
        while rx.try_recv().is_ok() {}

        let mut decoder = DecoderState::default();
        client.handle_binary_frame(&[1, 2, 3, 4], &mut decoder);
        let event = rx.try_recv().expect("audio event");
        match event {
            Event::Audio(frame) => {
                assert_eq!(frame.pcm, vec![1, 2, 3, 4]);
                assert_eq!(frame.sample_rate, 16000);
                assert_eq!(frame.channels, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsupported_downstream_format_reports_error() {
        let (client, mut rx) = test_client();
        client.handle_text(br#"{"type":"hello","audio_params":{"format":"mp3"}}"#);
        while rx.try_recv().is_ok() {}

        let mut decoder = DecoderState::default();
        client.handle_binary_frame(&[0u8; 8], &mut decoder);
        match rx.try_recv().expect("error event") {
            Event::Error { message } => {
                assert!(message.contains("unsupported xiaozhi audio format"))
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_wav_frame() {
        let pcm: Vec<u8> = vec![0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00];
        let mut frame = Vec::new();
        frame.extend_from_slice(b"RIFF");
        frame.extend_from_slice(&((36 + pcm.len()) as u32).to_le_bytes());
        frame.extend_from_slice(b"WAVE");
        frame.extend_from_slice(b"fmt ");
        frame.extend_from_slice(&16u32.to_le_bytes());
        frame.extend_from_slice(&1u16.to_le_bytes()); // PCM
        frame.extend_from_slice(&1u16.to_le_bytes()); // channels
        frame.extend_from_slice(&22050u32.to_le_bytes());
        frame.extend_from_slice(&44100u32.to_le_bytes()); // byte rate
        frame.extend_from_slice(&2u16.to_le_bytes()); // block align
        frame.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
        frame.extend_from_slice(b"data");
        frame.extend_from_slice(&(pcm.len() as u32).to_le_bytes());
        frame.extend_from_slice(&pcm);

        let (data, sample_rate, channels) = decode_wav_frame(&frame, 16000, 1).expect("wav");
        assert_eq!(data, pcm);
        assert_eq!(sample_rate, 22050);
        assert_eq!(channels, 1);
    }

    #[test]
    fn test_decode_wav_rejects_non_16_bit() {
        let mut frame = Vec::new();
        frame.extend_from_slice(b"RIFF");
        frame.extend_from_slice(&36u32.to_le_bytes());
        frame.extend_from_slice(b"WAVE");
        frame.extend_from_slice(b"fmt ");
        frame.extend_from_slice(&16u32.to_le_bytes());
        frame.extend_from_slice(&1u16.to_le_bytes());
        frame.extend_from_slice(&1u16.to_le_bytes());
        frame.extend_from_slice(&16000u32.to_le_bytes());
        frame.extend_from_slice(&16000u32.to_le_bytes());
        frame.extend_from_slice(&1u16.to_le_bytes());
        frame.extend_from_slice(&8u16.to_le_bytes()); // 8 бит
        frame.extend_from_slice(b"data");
        frame.extend_from_slice(&2u32.to_le_bytes());
        frame.extend_from_slice(&[0x01, 0x02]);

        assert!(decode_wav_frame(&frame, 16000, 1).is_err());
    }

    #[test]
    fn test_decode_wav_rejects_bad_magic() {
        assert!(decode_wav_frame(b"RIFFxxxxELSE", 16000, 1).is_err());
        assert!(decode_wav_frame(b"short", 16000, 1).is_err());
    }

    #[test]
    fn test_next_backoff_doubles_and_caps() {
        let mut delay = Duration::from_secs(1);
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_secs(2));
        delay = next_backoff(Duration::from_secs(16));
        assert_eq!(delay, Duration::from_secs(30));
        assert_eq!(next_backoff(Duration::from_secs(30)), Duration::from_secs(30));
    }
}
