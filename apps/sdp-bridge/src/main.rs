use std::net::SocketAddr;
use std::sync::Arc;

use rtc_engine::{MemoryEngine, TransportEngine, WebRtcEngine};
use sdp_bridge::config::{AppConfig, EngineKind};
use sdp_bridge::registry::ConnectionRegistry;
use sdp_bridge::routes;
use sdp_bridge::signaling::SignalingHandler;
use sdp_bridge::state::AppState;
use sdp_bridge::telemetry::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env();
    init_tracing(&cfg.log_filter);

    let engine: Arc<dyn TransportEngine> = match cfg.engine {
        EngineKind::WebRtc => Arc::new(WebRtcEngine::new(cfg.engine_config())),
        EngineKind::Memory => {
            warn!("using in-memory transport engine; browsers will not connect");
            MemoryEngine::new()
        }
    };

    let shutdown = CancellationToken::new();
    let registry = ConnectionRegistry::new();
    let signaling = Arc::new(SignalingHandler::new(
        engine,
        cfg.signaling_config(),
        registry.clone(),
        shutdown.clone(),
    ));
    let app = routes::router(AppState::new(signaling, cfg.index_path.clone()));

    let addr: SocketAddr = cfg.bind_addr.parse()?;
    info!(
        addr = %addr,
        engine = ?cfg.engine,
        ice_servers = ?cfg.ice_servers,
        heartbeat_ms = cfg.heartbeat_interval.as_millis() as u64,
        gathering_timeout_ms = cfg.gathering_timeout.as_millis() as u64,
        index = %cfg.index_path.display(),
        "starting sdp-bridge"
    );
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await?;

    registry.close_all().await;
    info!("sdp-bridge stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; shutting down");
    }
    info!("shutdown requested");
    shutdown.cancel();
}
