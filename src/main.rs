use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use relay_proxy::agent_link::AgentLink;
use relay_proxy::config::{Args, RelayConfig};
use relay_proxy::http::{router, AppState};
use relay_proxy::lifecycle::LifecycleCoordinator;
use relay_proxy::model_registry::ModelRegistry;
use relay_proxy::registry::RequestRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = RelayConfig::from_args(&args);

    let registry = Arc::new(RequestRegistry::new(
        config.max_concurrent_requests,
        config.backpressure_queue_size,
    ));
    let models = Arc::new(ModelRegistry::new());
    let link = Arc::new(AgentLink::new(registry.clone(), models.clone(), config.clone()));
    let coordinator = Arc::new(LifecycleCoordinator::new(
        registry,
        link,
        models,
        config,
    ));

    let app = router(AppState { coordinator: coordinator.clone() });

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    tracing::info!(addr = %args.addr, "relay proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator))
        .await?;

    Ok(())
}

async fn shutdown_signal(coordinator: Arc<LifecycleCoordinator>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, failing all live requests");
    coordinator.shutdown().await;
}
