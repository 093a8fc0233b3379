//! `flowctl status` command: show execution detail or list all executions.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use flow_db::queries::{executions as exec_db, tasks as task_db};

/// When `execution_id_str` is `Some`, shows detailed status for that
/// execution. When `None`, lists every execution with its status.
pub async fn run_status(pool: &PgPool, execution_id_str: Option<&str>) -> Result<()> {
    match execution_id_str {
        Some(id_str) => run_execution_status(pool, id_str).await,
        None => run_fleet_status(pool).await,
    }
}

async fn run_execution_status(pool: &PgPool, execution_id_str: &str) -> Result<()> {
    let execution_id = Uuid::parse_str(execution_id_str)
        .with_context(|| format!("invalid execution ID: {execution_id_str}"))?;

    let execution = exec_db::get_execution(pool, execution_id)
        .await?
        .with_context(|| format!("execution {execution_id} not found"))?;

    println!("Execution: {} ({} v{})", execution.id, execution.workflow_name, execution.workflow_version);
    println!("Status: {}", execution.status);
    if let Some(step) = &execution.current_step {
        println!("Current step: {step}");
    }
    if let Some(started_at) = execution.started_at {
        println!("Started: {}", started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(completed_at) = execution.completed_at {
        println!("Completed: {}", completed_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(error) = &execution.error {
        println!("Error: {error}");
    }
    println!();

    let tasks = task_db::list_tasks_for_execution(pool, execution_id).await?;
    println!("Tasks:");
    for task in &tasks {
        let status_icon = match task.status.to_string().as_str() {
            "pending" => ".",
            "locked" => ">",
            "running" => "*",
            "completed" => "+",
            "failed" => "!",
            "dead_letter" => "X",
            "cancelled" => "c",
            _ => " ",
        };
        println!(
            "  [{}] {} (attempt {}, {})",
            status_icon, task.step_name, task.attempt, task.status
        );
    }

    Ok(())
}

async fn run_fleet_status(pool: &PgPool) -> Result<()> {
    let executions = exec_db::list_executions(pool, None).await?;

    if executions.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    println!("{:<38} {:<24} {:<12}", "ID", "WORKFLOW", "STATUS");
    println!("{}", "-".repeat(76));

    for execution in &executions {
        println!(
            "{:<38} {:<24} {:<12}",
            execution.id, execution.workflow_name, execution.status
        );
    }

    Ok(())
}
