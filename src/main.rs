use anyhow::Result;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slidegate::{
    config::Settings,
    http::{router, AppState},
    metrics::Metrics,
    redis::RedisClient,
    service::RateLimitService,
    store::CounterStore,
    utils::SystemClock,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slidegate=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("CONFIG_PATH").ok();
    if let Some(path) = &config_path {
        info!("Loading configuration from: {}", path);
    }
    let settings = Settings::load(config_path.as_deref())?;

    info!(node_id = %settings.node.id, "Starting slidegate");

    let metrics = Arc::new(Metrics::new()?);
    let store: Arc<dyn CounterStore> = Arc::new(RedisClient::new(settings.redis_config())?);
    let service = Arc::new(RateLimitService::new(
        &settings,
        store,
        Arc::new(SystemClock),
        metrics,
    ));

    let app = router(
        AppState::new(Arc::clone(&service))
            .trust_forwarded_for(settings.server.trust_forwarded_for),
    );
    let listener = TcpListener::bind(settings.server.http_addr).await?;
    info!("HTTP server listening on {}", settings.server.http_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    service.shutdown().await;
    info!("Service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
