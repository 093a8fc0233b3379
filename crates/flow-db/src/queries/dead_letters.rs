//! Database query functions for the `dead_letters` table.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::DeadLetter;

/// Insert a dead-letter row for a task that exhausted its retry budget.
/// Unique on `task_id`: a task can only ever be dead-lettered once, since
/// `Reprocess` mints a fresh task rather than resurrecting this one.
pub async fn insert_dead_letter(
    pool: &PgPool,
    task_id: Uuid,
    execution_id: Uuid,
    workflow_name: &str,
    step_name: &str,
    input: Value,
    error_history: Value,
    error: Option<&str>,
) -> Result<DeadLetter> {
    sqlx::query_as::<_, DeadLetter>(
        "INSERT INTO dead_letters (task_id, execution_id, workflow_name, step_name, input, \
         error_history, error) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(execution_id)
    .bind(workflow_name)
    .bind(step_name)
    .bind(input)
    .bind(error_history)
    .bind(error)
    .fetch_one(pool)
    .await
    .context("failed to insert dead letter")
}

/// Fetch a dead-letter row by id.
pub async fn get_dead_letter(pool: &PgPool, id: Uuid) -> Result<Option<DeadLetter>> {
    sqlx::query_as::<_, DeadLetter>("SELECT * FROM dead_letters WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch dead letter")
}

/// Filter used by `list_dead_letters` / batch reprocessing.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter<'a> {
    pub workflow_name: Option<&'a str>,
    pub execution_id: Option<Uuid>,
    pub step_name: Option<&'a str>,
}

/// List dead-letters matching an optional filter tuple, newest first.
pub async fn list_dead_letters(
    pool: &PgPool,
    filter: &DeadLetterFilter<'_>,
) -> Result<Vec<DeadLetter>> {
    sqlx::query_as::<_, DeadLetter>(
        "SELECT * FROM dead_letters \
         WHERE ($1::text IS NULL OR workflow_name = $1) \
           AND ($2::uuid IS NULL OR execution_id = $2) \
           AND ($3::text IS NULL OR step_name = $3) \
         ORDER BY created_at DESC",
    )
    .bind(filter.workflow_name)
    .bind(filter.execution_id)
    .bind(filter.step_name)
    .fetch_all(pool)
    .await
    .context("failed to list dead letters")
}

/// Mark a dead-letter as reprocessed. Idempotent guard: refuses (zero rows
/// affected) if `reprocessed` is already true.
pub async fn mark_reprocessed(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE dead_letters SET reprocessed = true, reprocessed_at = NOW() \
         WHERE id = $1 AND reprocessed = false",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark dead letter reprocessed")?;
    Ok(result.rows_affected())
}
