//! Manager entrypoint: load the config, start every enabled Trader, serve
//! until SIGINT/SIGTERM, then shut down gracefully. Exit code 0 on a clean
//! stop, nonzero on startup failure.

use std::path::PathBuf;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use qt_manager::Manager;
use qt_types::AppConfig;

fn config_path() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    PathBuf::from("config.yaml")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let path = config_path();
    let config = AppConfig::load(&path)
        .with_context(|| format!("loading config {}", path.display()))?;
    info!(accounts = config.accounts.len(), config = %path.display(), "manager starting");

    let manager = Manager::new(config, &path)?;
    manager.start().await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    manager.shutdown().await;
    Ok(())
}
