use std::path::PathBuf;

use clap::Args;
use sandbox_kv::Reconciler;
use sandbox_kv::store;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::info;

use crate::config;
use crate::error::RunnerResult;

#[derive(Args)]
pub struct ReconcileArgs {
    /// Path to the runner YAML config
    #[arg(long, env = "SANDBOX_CONFIG")]
    pub config: PathBuf,
    /// Name of the kv resource whose store to reconcile (required when several are configured)
    #[arg(long)]
    pub resource: Option<String>,
}

/// Run the key count reconciler until SIGINT or SIGTERM.
pub async fn run_reconcile(args: ReconcileArgs) -> RunnerResult<()> {
    let config = config::load(&args.config).await?;
    let (resource, kv) = config.kv_config(args.resource.as_deref())?;
    let reconcile = kv.reconcile_config()?;

    let store = store::connect(&kv.store).await?;
    info!(resource = %resource, period = ?reconcile.period, "reconciler started");
    let handle = Reconciler::new(store, reconcile).start();

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();
    tokio::select! {
        _ = recv_signal(&mut sigterm) => info!("received SIGTERM, stopping"),
        _ = recv_signal(&mut sigint) => info!("received SIGINT, stopping"),
    }

    handle.stop().await;
    info!("reconciler stopped");
    Ok(())
}

/// Wait on `sig`, or forever if it could not be installed.
async fn recv_signal(sig: &mut Option<Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
