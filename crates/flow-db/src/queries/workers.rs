//! Database query functions for the `workers` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{WorkerRecord, WorkerStatus};

/// Register a worker row at startup. `worker_id` is the caller-assembled
/// `hostname-shortrandom` string, unique per live instance.
pub async fn register_worker(
    pool: &PgPool,
    worker_id: &str,
    hostname: &str,
    concurrency: i32,
) -> Result<WorkerRecord> {
    sqlx::query_as::<_, WorkerRecord>(
        "INSERT INTO workers (worker_id, hostname, status, concurrency, active_tasks, \
         last_heartbeat, started_at) \
         VALUES ($1, $2, 'active', $3, 0, NOW(), NOW()) \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(hostname)
    .bind(concurrency)
    .fetch_one(pool)
    .await
    .context("failed to register worker")
}

/// Update a worker's heartbeat timestamp and active-task count.
pub async fn heartbeat(pool: &PgPool, worker_id: &str, active_tasks: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workers SET last_heartbeat = NOW(), active_tasks = $1, updated_at = NOW() \
         WHERE worker_id = $2 AND status = 'active'",
    )
    .bind(active_tasks)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to record heartbeat")?;
    Ok(result.rows_affected())
}

/// Transition a worker to DRAINING (graceful shutdown has begun).
pub async fn mark_draining(pool: &PgPool, worker_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workers SET status = 'draining', updated_at = NOW() \
         WHERE worker_id = $1 AND status = 'active'",
    )
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to mark worker draining")?;
    Ok(result.rows_affected())
}

/// Deregister a worker at the end of graceful shutdown.
pub async fn mark_stopped(pool: &PgPool, worker_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workers SET status = 'stopped', stopped_at = NOW(), active_tasks = 0, \
         updated_at = NOW() \
         WHERE worker_id = $1",
    )
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to mark worker stopped")?;
    Ok(result.rows_affected())
}

/// Find active workers whose heartbeat is older than the stale threshold.
pub async fn find_stale_workers(pool: &PgPool, stale_after_secs: i64) -> Result<Vec<WorkerRecord>> {
    sqlx::query_as::<_, WorkerRecord>(
        "SELECT * FROM workers \
         WHERE status = 'active' \
           AND last_heartbeat <= NOW() - ($1 || ' seconds')::interval",
    )
    .bind(stale_after_secs.to_string())
    .fetch_all(pool)
    .await
    .context("failed to find stale workers")
}

/// Mark a worker STOPPED as part of the stale-worker sweep (distinct from
/// `mark_stopped`, which is the worker's own self-deregistration).
pub async fn mark_stale_stopped(pool: &PgPool, worker_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workers SET status = 'stopped', stopped_at = NOW(), updated_at = NOW() \
         WHERE worker_id = $1 AND status = 'active'",
    )
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to mark stale worker stopped")?;
    Ok(result.rows_affected())
}

/// List live worker records, most recently started first.
pub async fn list_workers(pool: &PgPool, status: Option<WorkerStatus>) -> Result<Vec<WorkerRecord>> {
    match status {
        Some(status) => sqlx::query_as::<_, WorkerRecord>(
            "SELECT * FROM workers WHERE status = $1 ORDER BY started_at DESC",
        )
        .bind(status)
        .fetch_all(pool)
        .await
        .context("failed to list workers by status"),
        None => sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers ORDER BY started_at DESC")
            .fetch_all(pool)
            .await
            .context("failed to list workers"),
    }
}

/// Fetch a single worker record by its business key.
pub async fn get_worker(pool: &PgPool, worker_id: &str) -> Result<Option<WorkerRecord>> {
    sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers WHERE worker_id = $1")
        .bind(worker_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch worker")
}
