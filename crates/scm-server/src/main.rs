use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use scm::{Registry, watch};
use scm_config::Settings;
use scm_server::{AppState, router};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scm-server", version)]
#[command(about = "Distribute declared configuration sources to every node")]
struct Cli {
    /// Listen address (overrides SCM_BIND).
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Master config file (overrides SCM_MASTER_CONFIG_FILE).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(bind) = cli.bind {
        settings.bind = bind;
    }
    if let Some(config) = cli.config {
        settings.master_config_file = config;
    }
    let settings = Arc::new(settings);

    let bus = scm_broadcast::connect(settings.redis_url.as_deref()).await?;
    let registry = Registry::new(Arc::clone(&settings), bus);
    let config_from_file = registry.init().await.context("bootstrap failed")?;

    let mut watchers = Vec::new();
    if settings.is_master() {
        watchers.push(watch::spawn_drift_detector(Arc::clone(&registry)));
        if config_from_file {
            watchers.push(watch::spawn_config_watcher(
                Arc::clone(&registry),
                settings.master_config_file.clone(),
            ));
        }
    }

    let app = router(AppState {
        registry,
        settings: Arc::clone(&settings),
    });
    let listener = tokio::net::TcpListener::bind(settings.bind)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind))?;
    info!(
        "listening on {} ({})",
        settings.bind,
        if settings.is_slave { "slave" } else { "master" }
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    for watcher in watchers {
        watcher.abort();
    }
    info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("got a termination signal, stopping");
}
