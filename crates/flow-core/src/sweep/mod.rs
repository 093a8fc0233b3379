//! Periodic maintenance sweeps: timeout checking, orphan reclamation,
//! stale-worker detection, and retention cleanup.
//!
//! Leader election for "exactly one process runs these on a schedule" is
//! an external collaborator (e.g. a `pg_advisory_lock` held by the caller,
//! or a Kubernetes `CronJob`/leader-elected Deployment) — this module only
//! implements the sweep bodies themselves, safe to call from any process
//! that currently holds leadership.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use flow_db::queries::executions as exec_db;

use crate::definition::registry::DefinitionRegistry;
use crate::error::FlowError;
use crate::state::ExecutionStateMachine;
use crate::worker;

/// Tunables for the periodic sweeps.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub timeout_check_interval_ms: u64,
    pub orphan_check_interval_ms: u64,
    pub stale_worker_check_interval_ms: u64,
    pub stale_worker_threshold_secs: i64,
    pub retention_check_interval_ms: u64,
    pub retain_completed_for: chrono::Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            timeout_check_interval_ms: 5_000,
            orphan_check_interval_ms: 30_000,
            stale_worker_check_interval_ms: 15_000,
            stale_worker_threshold_secs: 60,
            retention_check_interval_ms: 3_600_000,
            retain_completed_for: chrono::Duration::days(30),
        }
    }
}

/// Transition every RUNNING execution whose deadline has passed to
/// TIMED_OUT. In-flight tasks are left alone; their eventual completion is
/// ignored because the execution is already terminal.
pub async fn check_timeouts(pool: &PgPool) -> Result<usize, FlowError> {
    let candidates = exec_db::find_timed_out_executions(pool).await?;
    let mut timed_out = 0;
    for execution in candidates {
        match ExecutionStateMachine::timeout(pool, execution.id, execution.version).await {
            Ok(()) => timed_out += 1,
            // Another sweep pass (or a concurrent completion) already
            // moved this execution; not this sweep's problem.
            Err(e) => tracing::warn!(execution_id = %execution.id, error = %e, "timeout transition skipped"),
        }
    }
    Ok(timed_out)
}

/// Delete terminal executions (cascading to their tasks and dead letters)
/// older than `retain_for`.
pub async fn run_retention(pool: &PgPool, retain_for: chrono::Duration) -> Result<u64, FlowError> {
    let cutoff: DateTime<Utc> = Utc::now() - retain_for;
    exec_db::delete_completed_before(pool, cutoff).await.map_err(Into::into)
}

/// Run all sweeps forever on their own schedules, until `shutdown` fires.
/// Intended to be spawned by whichever process currently holds leadership.
pub async fn run(
    pool: PgPool,
    _definitions: Arc<DefinitionRegistry>,
    config: SweepConfig,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut timeout_tick = tokio::time::interval(Duration::from_millis(config.timeout_check_interval_ms));
    let mut orphan_tick = tokio::time::interval(Duration::from_millis(config.orphan_check_interval_ms));
    let mut stale_tick = tokio::time::interval(Duration::from_millis(config.stale_worker_check_interval_ms));
    let mut retention_tick = tokio::time::interval(Duration::from_millis(config.retention_check_interval_ms));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = timeout_tick.tick() => {
                if let Err(e) = check_timeouts(&pool).await {
                    tracing::error!(error = %e, "timeout sweep failed");
                }
            }
            _ = orphan_tick.tick() => {
                if let Err(e) = worker::reclaim_orphans(&pool).await {
                    tracing::error!(error = %e, "orphan reclamation sweep failed");
                }
            }
            _ = stale_tick.tick() => {
                if let Err(e) = worker::sweep_stale_workers(&pool, config.stale_worker_threshold_secs).await {
                    tracing::error!(error = %e, "stale-worker sweep failed");
                }
            }
            _ = retention_tick.tick() => {
                if let Err(e) = run_retention(&pool, config.retain_completed_for).await {
                    tracing::error!(error = %e, "retention sweep failed");
                }
            }
        }
    }
}
