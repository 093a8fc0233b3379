//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{BackoffStrategy, StepType, Task, TaskStatus};

/// Parameters for inserting a single task row. Grouped because the
/// dispatcher always has every field in hand at once (no partial inserts).
#[allow(clippy::too_many_arguments)]
pub struct NewTask<'a> {
    pub execution_id: Uuid,
    pub step_name: &'a str,
    pub step_type: StepType,
    pub step_order: i32,
    pub input: Value,
    pub max_attempts: i32,
    pub backoff_strategy: BackoffStrategy,
    pub backoff_base_ms: i64,
    pub priority: i32,
    pub parallel_group: Option<&'a str>,
    pub branch_key: Option<&'a str>,
    pub parent_task_id: Option<Uuid>,
}

/// Insert a single PENDING task. Used for sequential and branch dispatch.
pub async fn insert_task(pool: &PgPool, new: NewTask<'_>) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (execution_id, step_name, step_type, step_order, status, input, \
         max_attempts, backoff_strategy, backoff_base_ms, priority, parallel_group, branch_key, \
         parent_task_id, metadata) \
         VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10, $11, $12, '{}'::jsonb) \
         RETURNING *",
    )
    .bind(new.execution_id)
    .bind(new.step_name)
    .bind(new.step_type)
    .bind(new.step_order)
    .bind(new.input)
    .bind(new.max_attempts)
    .bind(new.backoff_strategy)
    .bind(new.backoff_base_ms)
    .bind(new.priority)
    .bind(new.parallel_group)
    .bind(new.branch_key)
    .bind(new.parent_task_id)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Insert every sibling of a parallel fan-out in one round trip.
///
/// All rows share `parallel_group` and `step_order`; the engine relies on
/// this being a single transaction so fan-in detection never observes a
/// partially-created group.
pub async fn insert_tasks_batch(pool: &PgPool, news: Vec<NewTask<'_>>) -> Result<Vec<Task>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;
    let mut tasks = Vec::with_capacity(news.len());
    for new in news {
        let task = sqlx::query_as::<_, Task>(
            "INSERT INTO tasks (execution_id, step_name, step_type, step_order, status, input, \
             max_attempts, backoff_strategy, backoff_base_ms, priority, parallel_group, branch_key, \
             parent_task_id, metadata) \
             VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10, $11, $12, '{}'::jsonb) \
             RETURNING *",
        )
        .bind(new.execution_id)
        .bind(new.step_name)
        .bind(new.step_type)
        .bind(new.step_order)
        .bind(new.input)
        .bind(new.max_attempts)
        .bind(new.backoff_strategy)
        .bind(new.backoff_base_ms)
        .bind(new.priority)
        .bind(new.parallel_group)
        .bind(new.branch_key)
        .bind(new.parent_task_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert task in batch")?;
        tasks.push(task);
    }
    tx.commit().await.context("failed to commit task batch")?;
    Ok(tasks)
}

/// Fetch a single task by id.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")
}

/// Transaction-scoped variant of [`get_task`], for the completion service's
/// single-transaction complete-and-advance boundary.
pub async fn get_task_tx(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to fetch task in transaction")
}

/// List all tasks belonging to an execution, in dispatch order.
pub async fn list_tasks_for_execution(pool: &PgPool, execution_id: Uuid) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE execution_id = $1 ORDER BY step_order ASC, created_at ASC",
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for execution")
}

/// Every sibling created under one parallel-block fan-out.
pub async fn list_parallel_group(
    pool: &PgPool,
    execution_id: Uuid,
    parallel_group: &str,
) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE execution_id = $1 AND parallel_group = $2 ORDER BY created_at ASC",
    )
    .bind(execution_id)
    .bind(parallel_group)
    .fetch_all(pool)
    .await
    .context("failed to list parallel group")
}

/// Transaction-scoped variant of [`list_parallel_group`]. Must be read
/// after the execution row is locked for update, so fan-in observes a
/// consistent snapshot of sibling statuses.
pub async fn list_parallel_group_tx(
    tx: &mut Transaction<'_, Postgres>,
    execution_id: Uuid,
    parallel_group: &str,
) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE execution_id = $1 AND parallel_group = $2 ORDER BY created_at ASC",
    )
    .bind(execution_id)
    .bind(parallel_group)
    .fetch_all(&mut **tx)
    .await
    .context("failed to list parallel group in transaction")
}

/// Atomically acquire up to `limit` acquirable tasks for `worker_id`.
///
/// A single statement: a `FOR UPDATE SKIP LOCKED` candidate selection feeds
/// an `UPDATE ... FROM` so concurrent callers never receive the same row.
/// Ordering is higher `priority` first, then older `created_at` first.
pub async fn acquire_tasks(
    pool: &PgPool,
    worker_id: &str,
    limit: i64,
    lock_timeout_ms: i64,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "WITH acquirable AS ( \
            SELECT id FROM tasks \
            WHERE status = 'pending' \
              AND (next_retry_at IS NULL OR next_retry_at <= NOW()) \
            ORDER BY priority DESC, created_at ASC \
            LIMIT $1 \
            FOR UPDATE SKIP LOCKED \
         ) \
         UPDATE tasks \
         SET status = 'locked', \
             locked_by = $2, \
             locked_at = NOW(), \
             lock_timeout_at = NOW() + ($3 || ' milliseconds')::interval, \
             version = version + 1 \
         FROM acquirable \
         WHERE tasks.id = acquirable.id \
         RETURNING tasks.*",
    )
    .bind(limit)
    .bind(worker_id)
    .bind(lock_timeout_ms.to_string())
    .fetch_all(pool)
    .await
    .context("failed to acquire tasks")?;

    Ok(tasks)
}

/// Transaction-scoped variant of [`insert_task`], for dispatching the next
/// step inside the completion service's single transaction.
pub async fn insert_task_tx(
    tx: &mut Transaction<'_, Postgres>,
    new: NewTask<'_>,
) -> Result<Task> {
    sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (execution_id, step_name, step_type, step_order, status, input, \
         max_attempts, backoff_strategy, backoff_base_ms, priority, parallel_group, branch_key, \
         parent_task_id, metadata) \
         VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10, $11, $12, '{}'::jsonb) \
         RETURNING *",
    )
    .bind(new.execution_id)
    .bind(new.step_name)
    .bind(new.step_type)
    .bind(new.step_order)
    .bind(new.input)
    .bind(new.max_attempts)
    .bind(new.backoff_strategy)
    .bind(new.backoff_base_ms)
    .bind(new.priority)
    .bind(new.parallel_group)
    .bind(new.branch_key)
    .bind(new.parent_task_id)
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert task in transaction")
}

/// Transaction-scoped variant of [`insert_tasks_batch`] that joins an
/// already-open transaction instead of opening its own.
pub async fn insert_tasks_tx(
    tx: &mut Transaction<'_, Postgres>,
    news: Vec<NewTask<'_>>,
) -> Result<Vec<Task>> {
    let mut tasks = Vec::with_capacity(news.len());
    for new in news {
        tasks.push(insert_task_tx(tx, new).await?);
    }
    Ok(tasks)
}

/// Mark a locked task RUNNING just before handler invocation.
pub async fn start_task(pool: &PgPool, task_id: Uuid, expected_version: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'running', started_at = NOW(), version = version + 1 \
         WHERE id = $1 AND version = $2 AND status = 'locked'",
    )
    .bind(task_id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to start task")?;

    Ok(result.rows_affected())
}

/// Complete a task. Refuses to re-complete a task already in a terminal
/// status (double-complete is a benign no-op, not an error). Version check
/// on write; zero rows affected means another path already completed it.
pub async fn complete_task(
    pool: &PgPool,
    task_id: Uuid,
    expected_version: i64,
    output: Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', \
             output = $1, \
             completed_at = NOW(), \
             locked_by = NULL, \
             locked_at = NULL, \
             lock_timeout_at = NULL, \
             version = version + 1 \
         WHERE id = $2 AND version = $3 \
           AND status NOT IN ('completed', 'failed', 'dead_letter', 'cancelled')",
    )
    .bind(output)
    .bind(task_id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    Ok(result.rows_affected())
}

/// Transaction-scoped variant of [`complete_task`], used by the completion
/// service so "task completed" and "workflow advanced" commit atomically.
pub async fn complete_task_tx(
    tx: &mut Transaction<'_, Postgres>,
    task_id: Uuid,
    expected_version: i64,
    output: Value,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', \
             output = $1, \
             completed_at = NOW(), \
             locked_by = NULL, \
             locked_at = NULL, \
             lock_timeout_at = NULL, \
             version = version + 1 \
         WHERE id = $2 AND version = $3 \
           AND status NOT IN ('completed', 'failed', 'dead_letter', 'cancelled')",
    )
    .bind(output)
    .bind(task_id)
    .bind(expected_version)
    .execute(&mut **tx)
    .await
    .context("failed to complete task in transaction")?;

    Ok(result.rows_affected())
}

/// Fail a task whose retry budget is not yet exhausted: attempt increments,
/// status returns to PENDING with a future `next_retry_at`.
pub async fn retry_task(
    pool: &PgPool,
    task_id: Uuid,
    expected_version: i64,
    error: &str,
    next_retry_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             attempt = attempt + 1, \
             error = $1, \
             next_retry_at = $2, \
             locked_by = NULL, \
             locked_at = NULL, \
             lock_timeout_at = NULL, \
             version = version + 1 \
         WHERE id = $3 AND version = $4 AND status = 'running'",
    )
    .bind(error)
    .bind(next_retry_at)
    .bind(task_id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to retry task")?;

    Ok(result.rows_affected())
}

/// Fail a task whose retry budget is exhausted: status becomes DEAD_LETTER.
/// Caller is responsible for writing the corresponding dead-letter row in
/// the same transaction-adjacent step.
pub async fn dead_letter_task(
    pool: &PgPool,
    task_id: Uuid,
    expected_version: i64,
    error: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'dead_letter', \
             attempt = attempt + 1, \
             error = $1, \
             completed_at = NOW(), \
             locked_by = NULL, \
             locked_at = NULL, \
             lock_timeout_at = NULL, \
             version = version + 1 \
         WHERE id = $2 AND version = $3 AND status = 'running'",
    )
    .bind(error)
    .bind(task_id)
    .bind(expected_version)
    .execute(pool)
    .await
    .context("failed to dead-letter task")?;

    Ok(result.rows_affected())
}

/// Release a single locked task back to PENDING (used by the worker's
/// prefetch-buffer drain on graceful shutdown).
pub async fn release_task(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', locked_by = NULL, locked_at = NULL, lock_timeout_at = NULL, \
             version = version + 1 \
         WHERE id = $1 AND status = 'locked'",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to release task")?;

    Ok(result.rows_affected())
}

/// Release every task still locked by a worker (shutdown sweep / stale
/// worker reclamation). Returns the released rows.
pub async fn release_tasks_by_worker(pool: &PgPool, worker_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'pending', locked_by = NULL, locked_at = NULL, lock_timeout_at = NULL, \
             version = version + 1 \
         WHERE locked_by = $1 AND status IN ('locked', 'running') \
         RETURNING *",
    )
    .bind(worker_id)
    .fetch_all(pool)
    .await
    .context("failed to release tasks by worker")?;

    Ok(tasks)
}

/// Atomically reset every orphaned (lock-timed-out) task to PENDING.
/// Attempt counter is deliberately untouched: a lock timeout is not a
/// handler failure.
pub async fn reclaim_orphaned_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'pending', locked_by = NULL, locked_at = NULL, lock_timeout_at = NULL, \
             version = version + 1 \
         WHERE status = 'locked' AND lock_timeout_at <= NOW() \
         RETURNING *",
    )
    .fetch_all(pool)
    .await
    .context("failed to reclaim orphaned tasks")?;

    Ok(tasks)
}

/// Persist handler-written metadata back onto the task row.
pub async fn update_task_metadata(pool: &PgPool, task_id: Uuid, metadata: Value) -> Result<()> {
    sqlx::query("UPDATE tasks SET metadata = $1 WHERE id = $2")
        .bind(metadata)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to update task metadata")?;
    Ok(())
}

/// True iff every task in the group has reached a terminal status
/// (COMPLETED or DEAD_LETTER) and at least one exists.
pub fn is_group_complete(tasks: &[Task]) -> bool {
    !tasks.is_empty()
        && tasks
            .iter()
            .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::DeadLetter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task_with_status(status: TaskStatus) -> Task {
        Task {
            id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            step_name: "a".into(),
            step_type: StepType::Parallel,
            step_order: 1,
            status,
            input: Value::Null,
            output: None,
            error: None,
            attempt: 0,
            max_attempts: 1,
            backoff_strategy: BackoffStrategy::Fixed,
            backoff_base_ms: 1000,
            next_retry_at: None,
            locked_by: None,
            locked_at: None,
            lock_timeout_at: None,
            started_at: None,
            completed_at: None,
            parallel_group: Some("g".into()),
            branch_key: None,
            priority: 0,
            parent_task_id: None,
            metadata: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            version: 0,
        }
    }

    #[test]
    fn group_complete_requires_all_terminal() {
        let tasks = vec![
            task_with_status(TaskStatus::Completed),
            task_with_status(TaskStatus::Running),
        ];
        assert!(!is_group_complete(&tasks));
    }

    #[test]
    fn group_complete_true_when_all_terminal() {
        let tasks = vec![
            task_with_status(TaskStatus::Completed),
            task_with_status(TaskStatus::DeadLetter),
        ];
        assert!(is_group_complete(&tasks));
    }

    #[test]
    fn group_complete_false_when_empty() {
        assert!(!is_group_complete(&[]));
    }
}
