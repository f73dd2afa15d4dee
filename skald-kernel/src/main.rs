/**
 * SKALD KERNEL - Job resource monitoring daemon
 *
 * ROLE : Loads the config, builds the daemon (tree resolver, collectors,
 * store, sockets) and runs it until SIGINT/SIGTERM.
 *
 * ARCHITECTURE : tokio tasks connected by bounded channels, one shared
 * cancellation token for a draining shutdown.
 * USAGE : SKALD_CONFIG=/etc/skald.yaml skald-kernel  (log level via SKALD_LOG)
 */

mod collectors;
mod config;
mod daemon;
mod metrics;
mod procs;
mod socket;
mod state;
mod store;
mod tree;

use crate::config::{config_path, load_config};
use crate::daemon::Daemon;
use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("SKALD_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = config_path();
    let cfg = load_config(&path)
        .await
        .with_context(|| format!("failed to load {}", path.display()))?;
    info!(
        config = %path.display(),
        collectors = ?cfg.collectors.keys().collect::<Vec<_>>(),
        "skald-kernel starting (version {})",
        env!("CARGO_PKG_VERSION")
    );

    let daemon = Daemon::new(cfg).context("failed to start daemon")?;

    let cancel = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to setup SIGINT handler")?;
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        trigger.cancel();
    });

    daemon.run(cancel).await;
    Ok(())
}
