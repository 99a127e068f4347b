use anyhow::Context;
use sondenotify_daemon::config::LoggingConfig;
use sondenotify_daemon::{Daemon, DaemonConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = DaemonConfig::from_env().context("Failed to load configuration")?;
    init_tracing(&config.logging);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting sondenotify");

    let backends = sondenotify_events::build_backends(&config.backends)
        .context("Failed to set up notification backends")?;
    let grace = config.shutdown_grace();

    let daemon = Daemon::start(config, backends)
        .await
        .context("Failed to start daemon")?;

    shutdown_signal().await;

    let summary = daemon.shutdown(grace).await;
    if !summary.drained {
        tracing::warn!("Some notifications were abandoned during shutdown");
    }
    Ok(())
}

/// `RUST_LOG` wins over the configured filter.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
