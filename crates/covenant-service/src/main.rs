//! covenantd - contract signing and termination service
//!
//! Serves provider webhooks, customer portal links and staff actions, and
//! runs the envelope poll and lifecycle sweep in the background.

use clap::Parser;
use covenant_service::config::ServiceConfig;
use covenant_service::scheduler::Scheduler;
use covenant_service::{build_router, ServiceState};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "covenantd", version, about = "Covenant contract lifecycle service")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "COVENANT_CONFIG")]
    config: Option<String>,

    /// Listen address, overrides server.listen_addr
    #[arg(short, long, env = "COVENANT_LISTEN_ADDR")]
    listen: Option<String>,

    /// Log level, used when RUST_LOG is unset
    #[arg(long, env = "COVENANT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "COVENANT_LOG_JSON")]
    json: bool,

    /// Serve requests without the background poller
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address '{listen}': {e}"))?;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.logging.json |= cli.json;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let addr = config.server.listen_addr;
    let scheduler_config = config.scheduler.clone();
    let state = ServiceState::bootstrap(config).await?;

    let scheduler = (scheduler_config.enabled && !cli.no_scheduler)
        .then(|| Scheduler::new(scheduler_config, state.engine.clone()));
    if let Some(scheduler) = &scheduler {
        tokio::spawn(scheduler.clone().start());
    }

    let app = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("covenant-service listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("covenant-service shutting down");
    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("received terminate signal, initiating graceful shutdown");
        }
    }
}
