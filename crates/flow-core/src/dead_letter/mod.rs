//! Dead-letter reprocessing: mint a fresh PENDING task from a dead-lettered
//! one, leaving the original task row untouched as historical record.

use sqlx::PgPool;
use uuid::Uuid;

use flow_db::models::Task;
use flow_db::queries::dead_letters::{self, DeadLetterFilter};
use flow_db::queries::tasks::{self, NewTask};

use crate::error::FlowError;

/// Reprocess a single dead-letter: create a fresh PENDING task at attempt
/// zero, copying step metadata from the original task, then mark the
/// dead-letter row `reprocessed = true`. Idempotent: refuses (conflict) if
/// the row was already reprocessed.
pub async fn reprocess(pool: &PgPool, dead_letter_id: Uuid) -> Result<Task, FlowError> {
    let dead_letter = dead_letters::get_dead_letter(pool, dead_letter_id)
        .await?
        .ok_or_else(|| FlowError::NotFound(format!("dead letter {dead_letter_id} not found")))?;

    let original = tasks::get_task(pool, dead_letter.task_id)
        .await?
        .ok_or_else(|| FlowError::NotFound(format!("original task {} not found", dead_letter.task_id)))?;

    let fresh = tasks::insert_task(
        pool,
        NewTask {
            execution_id: dead_letter.execution_id,
            step_name: &dead_letter.step_name,
            step_type: original.step_type,
            step_order: original.step_order,
            input: dead_letter.input.clone(),
            max_attempts: original.max_attempts,
            backoff_strategy: original.backoff_strategy,
            backoff_base_ms: original.backoff_base_ms,
            priority: original.priority,
            parallel_group: original.parallel_group.as_deref(),
            branch_key: original.branch_key.as_deref(),
            parent_task_id: Some(original.id),
        },
    )
    .await?;

    let rows = dead_letters::mark_reprocessed(pool, dead_letter_id).await?;
    if rows == 0 {
        return Err(FlowError::Conflict(format!(
            "dead letter {dead_letter_id} was already reprocessed"
        )));
    }

    Ok(fresh)
}

/// Reprocess every dead-letter matching `filter`. Individual failures
/// (e.g. a concurrent reprocess of the same row) do not abort the batch;
/// they are collected alongside successes.
pub async fn reprocess_batch(
    pool: &PgPool,
    filter: &DeadLetterFilter<'_>,
) -> Result<Vec<Result<Task, FlowError>>, FlowError> {
    let matches = dead_letters::list_dead_letters(pool, filter).await?;
    let mut results = Vec::with_capacity(matches.len());
    for dl in matches {
        results.push(reprocess(pool, dl.id).await);
    }
    Ok(results)
}

pub use flow_db::queries::dead_letters::DeadLetterFilter as ReprocessFilter;
