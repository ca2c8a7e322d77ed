//! HTTP и WebSocket сервер

use std::sync::Arc;

use axum::{
    extract::ws::WebSocketUpgrade,
    extract::State as AxumState,
    response::Response,
    routing::get,
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::config::Config;
use crate::group::GroupManager;
use crate::storage::HistoryStore;
use crate::websocket::{self, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub groups: Arc<GroupManager>,
    pub registry: Arc<SessionRegistry>,
    pub history: Arc<HistoryStore>,
}

pub async fn start(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = create_router(config);

    info!("Server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}/client-ws", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn create_router(config: Config) -> Router {
    let history = Arc::new(HistoryStore::new(&config.storage.chat_history_dir));
    let state = AppState {
        config,
        groups: Arc::new(GroupManager::new()),
        registry: Arc::new(SessionRegistry::new()),
        history,
    };

    Router::new()
        .route("/client-ws", get(websocket_handler))
        .route("/health", get(|| async { "OK" }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    AxumState(state): AxumState<AppState>,
) -> Response {
    ws.on_upgrade(|socket| websocket::handle_connection(socket, state))
}
