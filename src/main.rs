//! VTuber Gateway
//!
//! Шлюз между браузерным VTuber фронтендом и диалоговым бэкендом XiaoZhi

mod audio;
mod config;
mod group;
mod mcp;
mod server;
mod storage;
mod websocket;
mod xiaozhi;

use anyhow::Result;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vtuber_gateway=info,tower_http=debug".into()),
        )
        .init();

    info!("Starting VTuber Gateway...");

    let config = config::Config::load()?;
    info!(
        "Configuration loaded: backend_url={:?}, protocol_version={}, audio_format={}, sample_rate={}, listen_mode={}",
        config.xiaozhi.backend_url,
        config.xiaozhi.protocol_version,
        config.xiaozhi.audio_format,
        config.xiaozhi.sample_rate,
        config.xiaozhi.listen_mode,
    );

    if let Err(e) = server::start(config).await {
        error!("Server error: {}", e);
        return Err(e);
    }

    Ok(())
}
