//! Trader entrypoint. Spawned by the Manager with `--config <file>
//! --account <id>`; binds its Unix socket and serves until SIGTERM/SIGINT.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use qt_gateway::SimGateway;
use qt_trader::Trader;
use qt_types::AppConfig;

fn parse_args() -> anyhow::Result<(PathBuf, String)> {
    let mut config_path = None;
    let mut account_id = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next().map(PathBuf::from),
            "--account" => account_id = args.next(),
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok((
        config_path.context("--config <file> is required")?,
        account_id.context("--account <id> is required")?,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let (config_path, account_id) = parse_args()?;
    let config = AppConfig::load(&config_path)?;
    let account = config
        .account(&account_id)
        .with_context(|| format!("account {account_id} not in config"))?
        .clone();

    let gateway = Arc::new(SimGateway::new(&account.account_id));
    let trader = Trader::build(account, gateway)?;
    trader.start().await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
    }

    trader.stop().await;
    Ok(())
}
