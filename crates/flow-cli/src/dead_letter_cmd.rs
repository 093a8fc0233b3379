//! `flowctl dead-letter` commands: list and reprocess dead-lettered tasks.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use flow_core::dead_letter;
use flow_db::queries::dead_letters::{self, DeadLetterFilter};

pub async fn run_list(pool: &PgPool, workflow_name: Option<&str>) -> Result<()> {
    let filter = DeadLetterFilter {
        workflow_name,
        ..Default::default()
    };
    let rows = dead_letters::list_dead_letters(pool, &filter).await?;

    if rows.is_empty() {
        println!("No dead letters found.");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<20} {:<10}", "ID", "WORKFLOW", "STEP", "REPROCESSED");
    println!("{}", "-".repeat(96));
    for row in &rows {
        println!(
            "{:<38} {:<24} {:<20} {:<10}",
            row.id, row.workflow_name, row.step_name, row.reprocessed
        );
    }

    Ok(())
}

pub async fn run_reprocess(pool: &PgPool, dead_letter_id_str: &str) -> Result<()> {
    let dead_letter_id = Uuid::parse_str(dead_letter_id_str)
        .with_context(|| format!("invalid dead letter ID: {dead_letter_id_str}"))?;

    let task = dead_letter::reprocess(pool, dead_letter_id)
        .await
        .context("failed to reprocess dead letter")?;

    println!("Reprocessed into task {} (step {:?}), now pending.", task.id, task.step_name);
    Ok(())
}
