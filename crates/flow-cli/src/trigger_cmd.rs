//! `flowctl trigger` command: start a new workflow execution.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;

use flow_core::definition::registry::DefinitionRegistry;
use flow_core::Engine;

pub async fn run_trigger(
    pool: PgPool,
    definitions: Arc<DefinitionRegistry>,
    workflow_name: &str,
    workflow_version: i32,
    input_json: &str,
    idempotency_key: Option<&str>,
) -> Result<()> {
    let input: serde_json::Value =
        serde_json::from_str(input_json).context("--input must be valid JSON")?;

    let engine = Engine::new(pool, definitions);
    let execution = engine
        .trigger(workflow_name, workflow_version, input, idempotency_key)
        .await
        .context("failed to trigger execution")?;

    println!("Execution {} ({} v{})", execution.id, execution.workflow_name, execution.workflow_version);
    println!("Status: {}", execution.status);

    Ok(())
}
