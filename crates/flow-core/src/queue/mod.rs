//! Task queue: thin translation layer over `flow_db::queries::tasks`,
//! adding retry-policy evaluation and typed errors.

use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use flow_db::models::Task;
use flow_db::queries::{dead_letters, tasks as db};

use crate::error::FlowError;
use crate::retry::{self, RetryPolicy};

/// Atomically acquire up to `limit` acquirable tasks for `worker_id`.
pub async fn acquire(
    pool: &PgPool,
    worker_id: &str,
    limit: i64,
    lock_timeout_ms: i64,
) -> Result<Vec<Task>, FlowError> {
    db::acquire_tasks(pool, worker_id, limit, lock_timeout_ms)
        .await
        .map_err(Into::into)
}

/// Complete a task. Idempotent: re-completing an already-terminal task is
/// a benign no-op, not an error.
pub async fn complete(
    pool: &PgPool,
    task: &Task,
    output: Value,
) -> Result<(), FlowError> {
    db::complete_task(pool, task.id, task.version, output).await?;
    Ok(())
}

/// Fail a task. Looks at the retry policy to decide retry vs. dead-letter.
/// Returns `true` if the task moved to DEAD_LETTER (caller must then run
/// [`dead_letter`]).
pub async fn fail(pool: &PgPool, task: &Task, error: &str) -> Result<bool, FlowError> {
    let policy = RetryPolicy {
        max_attempts: task.max_attempts,
        strategy: task.backoff_strategy,
        base_delay_ms: task.backoff_base_ms,
        ..RetryPolicy::default()
    };

    if retry::should_retry(&policy, task.attempt + 1) {
        let delay_ms = retry::delay(&policy, task.attempt + 1);
        let next_retry_at = Utc::now() + Duration::milliseconds(delay_ms);
        db::retry_task(pool, task.id, task.version, error, next_retry_at).await?;
        Ok(false)
    } else {
        db::dead_letter_task(pool, task.id, task.version, error).await?;
        Ok(true)
    }
}

/// Persist the dead-letter record for a task that just exhausted its
/// retry budget. Must be called after [`fail`] returns `true`.
pub async fn dead_letter(pool: &PgPool, task: &Task, workflow_name: &str, error: &str) -> Result<(), FlowError> {
    let attempt_record = serde_json::json!([{
        "attempt": task.attempt + 1,
        "error": error,
        "timestamp": Utc::now(),
    }]);
    dead_letters::insert_dead_letter(
        pool,
        task.id,
        task.execution_id,
        workflow_name,
        &task.step_name,
        task.input.clone(),
        attempt_record,
        Some(error),
    )
    .await?;
    Ok(())
}

/// Release a single locked task back to PENDING (buffer-drain path).
pub async fn release(pool: &PgPool, task_id: Uuid) -> Result<(), FlowError> {
    db::release_task(pool, task_id).await?;
    Ok(())
}

/// Release every task locked by a worker (shutdown / stale-worker sweep).
pub async fn release_all_for_worker(pool: &PgPool, worker_id: &str) -> Result<Vec<Task>, FlowError> {
    db::release_tasks_by_worker(pool, worker_id).await.map_err(Into::into)
}

/// Reset every orphaned (lock-timed-out) task to PENDING without
/// incrementing its attempt counter.
pub async fn reclaim_orphaned(pool: &PgPool) -> Result<Vec<Task>, FlowError> {
    db::reclaim_orphaned_tasks(pool).await.map_err(Into::into)
}

/// Mark a locked task RUNNING just before handler invocation.
pub async fn start(pool: &PgPool, task: &Task) -> Result<(), FlowError> {
    let rows = db::start_task(pool, task.id, task.version).await?;
    if rows == 0 {
        return Err(FlowError::Conflict(format!(
            "task {} could not transition to running (version changed)",
            task.id
        )));
    }
    Ok(())
}
