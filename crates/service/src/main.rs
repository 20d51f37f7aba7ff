//! Service entry point.

use service::config::LogFormat;
use service::{Config, StartupError, Workers};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env()?;
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Connect the broker and idempotency stores, then wire the role
    let broker = service::connect_broker(&config)?;
    let result = run(&config, broker.clone(), metrics_handle).await;

    // 4. Release the broker connection whatever happened
    if let Err(e) = broker.close().await {
        tracing::warn!(error = %e, "failed to close broker");
    }
    tracing::info!("service shut down gracefully");
    result
}

async fn run(
    config: &Config,
    broker: std::sync::Arc<dyn broker::Broker>,
    metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
) -> Result<(), StartupError> {
    let stores = service::open_stores(config).await?;
    let participants = service::assemble(config, broker, &stores);

    // Start one dispatcher per consumer group
    let workers = Workers::spawn(participants.dispatchers, participants.publisher);

    // Serve HTTP for the gateway, otherwise just wait for a signal
    let served = if config.role.runs_gateway() {
        let app = service::create_app(participants.state, metrics_handle);
        serve(config, app).await
    } else {
        tracing::info!(role = config.role.as_str(), "running consumers");
        shutdown_signal().await;
        Ok(())
    };

    // Drain dispatchers and flush outstanding publishes even if serving failed
    workers.shutdown().await;
    served
}

async fn serve(config: &Config, app: axum::Router) -> Result<(), StartupError> {
    let addr = config.addr();
    tracing::info!(%addr, role = config.role.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
