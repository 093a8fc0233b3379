//! Database query functions for the `workflows` audit table.
//!
//! The in-memory definition registry (`flow-core::definition::registry`) is
//! the source of truth for dispatch. This table is a durable record of what
//! was registered, for operator visibility across restarts.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;

use crate::models::WorkflowRow;

/// Upsert the audit row for a `(name, version)` workflow definition.
/// Called once per registered definition at process start.
pub async fn upsert_workflow(
    pool: &PgPool,
    name: &str,
    version: i32,
    description: Option<&str>,
    definition: Value,
) -> Result<WorkflowRow> {
    sqlx::query_as::<_, WorkflowRow>(
        "INSERT INTO workflows (name, version, description, definition) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (name, version) DO UPDATE \
         SET description = $3, definition = $4, updated_at = NOW() \
         RETURNING *",
    )
    .bind(name)
    .bind(version)
    .bind(description)
    .bind(definition)
    .fetch_one(pool)
    .await
    .context("failed to upsert workflow audit row")
}

/// List every registered workflow definition, most recent first.
pub async fn list_workflows(pool: &PgPool) -> Result<Vec<WorkflowRow>> {
    sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows ORDER BY name ASC, version DESC")
        .fetch_all(pool)
        .await
        .context("failed to list workflows")
}

/// Fetch a single workflow audit row.
pub async fn get_workflow(pool: &PgPool, name: &str, version: i32) -> Result<Option<WorkflowRow>> {
    sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE name = $1 AND version = $2")
        .bind(name)
        .bind(version)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow audit row")
}

/// Fetch the highest registered version for a workflow name, for callers
/// that trigger without pinning an explicit version.
pub async fn get_latest_version(pool: &PgPool, name: &str) -> Result<Option<i32>> {
    let row: Option<(i32,)> = sqlx::query_as(
        "SELECT version FROM workflows WHERE name = $1 ORDER BY version DESC LIMIT 1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest workflow version")?;
    Ok(row.map(|(v,)| v))
}
