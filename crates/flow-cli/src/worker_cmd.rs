//! `flowctl worker start` command: run a worker until Ctrl+C, draining in
//! place. Periodic sweeps (timeout/orphan/stale-worker/retention) run
//! alongside it on the same process — flowctl does not implement leader
//! election, so running more than one `worker start` against the same
//! database will duplicate sweep work harmlessly (each sweep pass is
//! idempotent) but is not the intended deployment shape for more than one
//! replica.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use flow_core::definition::registry::DefinitionRegistry;
use flow_core::sweep::{self, SweepConfig};
use flow_core::worker::handler::HandlerRegistry;
use flow_core::worker::{Worker, WorkerConfig};

pub async fn run_worker(
    pool: PgPool,
    hostname: &str,
    definitions: Arc<DefinitionRegistry>,
    handlers: Arc<HandlerRegistry>,
) -> Result<()> {
    let worker_config = WorkerConfig::from_env();
    let sweep_config = SweepConfig::from_env();
    let shutdown = CancellationToken::new();

    let worker = Worker::new(pool.clone(), hostname, worker_config, definitions.clone(), handlers);

    let sweep_shutdown = shutdown.clone();
    let sweep_pool = pool.clone();
    let sweep_definitions = definitions.clone();
    let sweep_handle = tokio::spawn(async move {
        sweep::run(sweep_pool, sweep_definitions, sweep_config, sweep_shutdown).await;
    });

    let worker_shutdown = shutdown.clone();
    let signal_shutdown = shutdown.clone();
    let ctrl_c = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining worker");
        signal_shutdown.cancel();
    });

    tracing::info!(worker_id = worker.worker_id(), "worker starting");
    worker.run(worker_shutdown, None).await?;

    shutdown.cancel();
    let _ = sweep_handle.await;
    ctrl_c.abort();

    Ok(())
}
