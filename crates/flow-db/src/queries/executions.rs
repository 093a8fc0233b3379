//! Database query functions for the `executions` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{Execution, ExecutionStatus};

/// Parameters for triggering a new execution.
pub struct NewExecution<'a> {
    pub workflow_name: &'a str,
    pub workflow_version: i32,
    pub input: Value,
    pub idempotency_key: Option<&'a str>,
    pub timeout_at: Option<DateTime<Utc>>,
}

/// Insert a new execution in PENDING status.
pub async fn insert_execution(pool: &PgPool, new: NewExecution<'_>) -> Result<Execution> {
    sqlx::query_as::<_, Execution>(
        "INSERT INTO executions (workflow_name, workflow_version, status, input, \
         idempotency_key, timeout_at) \
         VALUES ($1, $2, 'pending', $3, $4, $5) \
         RETURNING *",
    )
    .bind(new.workflow_name)
    .bind(new.workflow_version)
    .bind(new.input)
    .bind(new.idempotency_key)
    .bind(new.timeout_at)
    .fetch_one(pool)
    .await
    .context("failed to insert execution")
}

/// Fetch an execution by id.
pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<Option<Execution>> {
    sqlx::query_as::<_, Execution>("SELECT * FROM executions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch execution")
}

/// Fetch an execution by its idempotency key, if one was supplied at trigger.
pub async fn get_execution_by_idempotency_key(
    pool: &PgPool,
    key: &str,
) -> Result<Option<Execution>> {
    sqlx::query_as::<_, Execution>("SELECT * FROM executions WHERE idempotency_key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("failed to fetch execution by idempotency key")
}

/// List executions, optionally filtered by status, newest first.
pub async fn list_executions(
    pool: &PgPool,
    status: Option<ExecutionStatus>,
) -> Result<Vec<Execution>> {
    match status {
        Some(status) => sqlx::query_as::<_, Execution>(
            "SELECT * FROM executions WHERE status = $1 ORDER BY created_at DESC",
        )
        .bind(status)
        .fetch_all(pool)
        .await
        .context("failed to list executions by status"),
        None => sqlx::query_as::<_, Execution>("SELECT * FROM executions ORDER BY created_at DESC")
            .fetch_all(pool)
            .await
            .context("failed to list executions"),
    }
}

/// Lock an execution row for the duration of a transaction.
///
/// Fan-in dispatch must serialize on this so exactly one concurrent
/// completer observes "all siblings terminal" and performs the post-block
/// advance.
pub async fn lock_execution_for_update(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<Execution>> {
    sqlx::query_as::<_, Execution>("SELECT * FROM executions WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to lock execution for update")
}

/// PENDING -> RUNNING. Stamps `started_at` on first entry.
pub async fn start_execution(pool: &PgPool, id: Uuid, expected_version: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions SET status = 'running', started_at = NOW(), version = version + 1 \
         WHERE id = $1 AND version = $2 AND status = 'pending'",
    )
    .bind(id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to start execution")?;
    Ok(result.rows_affected())
}

/// Transaction-scoped variant of [`complete_execution`], used by the
/// completion service.
pub async fn complete_execution_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    expected_version: i64,
    output: Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions SET status = 'completed', output = $1, completed_at = NOW(), \
         version = version + 1 \
         WHERE id = $2 AND version = $3 AND status = 'running'",
    )
    .bind(output)
    .bind(id)
    .bind(expected_version)
    .execute(&mut **tx)
    .await
    .context("failed to complete execution in transaction")?;
    Ok(result.rows_affected())
}

/// RUNNING -> COMPLETED.
pub async fn complete_execution(
    pool: &PgPool,
    id: Uuid,
    expected_version: i64,
    output: Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions SET status = 'completed', output = $1, completed_at = NOW(), \
         version = version + 1 \
         WHERE id = $2 AND version = $3 AND status = 'running'",
    )
    .bind(output)
    .bind(id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to complete execution")?;
    Ok(result.rows_affected())
}

/// RUNNING -> FAILED.
pub async fn fail_execution(
    pool: &PgPool,
    id: Uuid,
    expected_version: i64,
    error: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions SET status = 'failed', error = $1, completed_at = NOW(), \
         version = version + 1 \
         WHERE id = $2 AND version = $3 AND status = 'running'",
    )
    .bind(error)
    .bind(id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to fail execution")?;
    Ok(result.rows_affected())
}

/// Transaction-scoped variant of [`fail_execution`], used by the
/// completion service (all-siblings-dead-lettered fan-in path).
pub async fn fail_execution_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    expected_version: i64,
    error: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions SET status = 'failed', error = $1, completed_at = NOW(), \
         version = version + 1 \
         WHERE id = $2 AND version = $3 AND status = 'running'",
    )
    .bind(error)
    .bind(id)
    .bind(expected_version)
    .execute(&mut **tx)
    .await
    .context("failed to fail execution in transaction")?;
    Ok(result.rows_affected())
}

/// PENDING or RUNNING -> CANCELLED.
pub async fn cancel_execution(pool: &PgPool, id: Uuid, expected_version: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions SET status = 'cancelled', completed_at = NOW(), version = version + 1 \
         WHERE id = $1 AND version = $2 AND status IN ('pending', 'running')",
    )
    .bind(id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to cancel execution")?;
    Ok(result.rows_affected())
}

/// RUNNING -> TIMED_OUT. Used by the leader-gated timeout checker sweep.
pub async fn timeout_execution(pool: &PgPool, id: Uuid, expected_version: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE executions SET status = 'timed_out', completed_at = NOW(), version = version + 1 \
         WHERE id = $1 AND version = $2 AND status = 'running'",
    )
    .bind(id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to time out execution")?;
    Ok(result.rows_affected())
}

/// Find every RUNNING execution whose deadline has passed.
pub async fn find_timed_out_executions(pool: &PgPool) -> Result<Vec<Execution>> {
    sqlx::query_as::<_, Execution>(
        "SELECT * FROM executions WHERE status = 'running' AND timeout_at IS NOT NULL \
         AND timeout_at <= NOW()",
    )
    .fetch_all(pool)
    .await
    .context("failed to find timed-out executions")
}

/// Update the current-step hint (used for observability, not correctness).
pub async fn update_current_step(pool: &PgPool, id: Uuid, step_name: &str) -> Result<()> {
    sqlx::query("UPDATE executions SET current_step = $1 WHERE id = $2")
        .bind(step_name)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update current step")?;
    Ok(())
}

/// Record a webhook delivery attempt's outcome.
pub async fn update_callback_status(pool: &PgPool, id: Uuid, status: &str) -> Result<()> {
    sqlx::query("UPDATE executions SET callback_status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update callback status")?;
    Ok(())
}

/// Delete terminal executions (and their cascaded tasks/dead-letters) older
/// than `older_than`, for the leader-gated retention sweep.
pub async fn delete_completed_before(pool: &PgPool, older_than: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM executions \
         WHERE status IN ('completed', 'failed', 'cancelled', 'timed_out') \
           AND completed_at IS NOT NULL AND completed_at <= $1",
    )
    .bind(older_than)
    .execute(pool)
    .await
    .context("failed to delete retired executions")?;
    Ok(result.rows_affected())
}
