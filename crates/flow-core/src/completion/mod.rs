//! Completion service: the single transactional boundary that composes
//! "complete the task" with "advance the workflow". Either both commit or
//! neither, which rules out the "task marked COMPLETED but workflow never
//! advanced" failure mode after a crash between the two steps.

use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;

use flow_db::models::{StepType, Task};
use flow_db::queries::{executions, tasks};

use crate::definition::registry::DefinitionRegistry;
use crate::dispatch::{self, DispatchOutcome, NewStepDispatch};
use crate::error::FlowError;

/// Holds the registry behind an `Arc` so it can be cloned into spawned
/// worker tasks alongside the pool.
#[derive(Clone)]
pub struct CompletionService {
    pool: PgPool,
    registry: Arc<DefinitionRegistry>,
}

impl CompletionService {
    pub fn new(pool: PgPool, registry: Arc<DefinitionRegistry>) -> Self {
        Self { pool, registry }
    }

    /// Complete `task` with `output` and advance the owning execution, in
    /// one transaction. Benign no-ops (double-complete, terminal
    /// execution, incomplete fan-in group) commit cleanly without error.
    pub async fn complete_and_advance(&self, task: &Task, output: Value) -> Result<(), FlowError> {
        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;

        let rows = tasks::complete_task_tx(&mut tx, task.id, task.version, output.clone()).await?;
        if rows == 0 {
            // Already completed by another path: benign race.
            tx.commit().await.map_err(anyhow::Error::from)?;
            return Ok(());
        }

        let execution = executions::lock_execution_for_update(&mut tx, task.execution_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("execution {} not found", task.execution_id)))?;

        if execution.status.is_terminal() {
            tx.commit().await.map_err(anyhow::Error::from)?;
            return Ok(());
        }

        let definition = self
            .registry
            .get(&execution.workflow_name, execution.workflow_version)?;

        let outcome = match task.step_type {
            StepType::Branch => {
                let group = task.parallel_group.as_deref().ok_or_else(|| {
                    FlowError::Fatal(format!("branch task {} missing parallel_group", task.id))
                })?;
                let branch_key = task.branch_key.as_deref().ok_or_else(|| {
                    FlowError::Fatal(format!("branch task {} missing branch_key", task.id))
                })?;
                dispatch::dispatch_after_branch_step(definition, group, branch_key, &task.step_name, output)
            }
            StepType::Sequential => dispatch::dispatch_next(definition, &task.step_name, output),
            StepType::Parallel => {
                let group = task.parallel_group.as_deref().ok_or_else(|| {
                    FlowError::Fatal(format!("parallel task {} missing parallel_group", task.id))
                })?;
                let siblings = tasks::list_parallel_group_tx(&mut tx, execution.id, group).await?;
                if !tasks::is_group_complete(&siblings) {
                    tx.commit().await.map_err(anyhow::Error::from)?;
                    return Ok(());
                }
                dispatch::dispatch_after_parallel_block(definition, group, &siblings)
            }
        };

        match outcome {
            Ok(DispatchOutcome::Done(final_output)) => {
                executions::complete_execution_tx(&mut tx, execution.id, execution.version, final_output)
                    .await?;
            }
            Ok(DispatchOutcome::Sequential(d)) | Ok(DispatchOutcome::Branch(d)) => {
                insert_one_tx(&mut tx, execution.id, d).await?;
            }
            Ok(DispatchOutcome::Parallel(ds)) => {
                insert_batch_tx(&mut tx, execution.id, ds).await?;
            }
            Err(FlowError::Invalid(msg)) => {
                // All parallel siblings dead-lettered: no successful
                // output to advance on, execution fails.
                executions::fail_execution_tx(&mut tx, execution.id, execution.version, &msg).await?;
            }
            Err(other) => return Err(other),
        }

        tx.commit().await.map_err(anyhow::Error::from)?;
        Ok(())
    }
}

async fn insert_one_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    execution_id: uuid::Uuid,
    d: NewStepDispatch,
) -> Result<Task, FlowError> {
    tasks::insert_task_tx(
        tx,
        tasks::NewTask {
            execution_id,
            step_name: &d.step_name,
            step_type: d.step_type,
            step_order: d.step_order,
            input: d.input,
            max_attempts: d.max_attempts,
            backoff_strategy: d.backoff_strategy,
            backoff_base_ms: d.backoff_base_ms,
            priority: d.priority,
            parallel_group: d.parallel_group.as_deref(),
            branch_key: d.branch_key.as_deref(),
            parent_task_id: None,
        },
    )
    .await
    .map_err(Into::into)
}

async fn insert_batch_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    execution_id: uuid::Uuid,
    ds: Vec<NewStepDispatch>,
) -> Result<Vec<Task>, FlowError> {
    let news = ds
        .iter()
        .map(|d| tasks::NewTask {
            execution_id,
            step_name: &d.step_name,
            step_type: d.step_type,
            step_order: d.step_order,
            input: d.input.clone(),
            max_attempts: d.max_attempts,
            backoff_strategy: d.backoff_strategy,
            backoff_base_ms: d.backoff_base_ms,
            priority: d.priority,
            parallel_group: d.parallel_group.as_deref(),
            branch_key: d.branch_key.as_deref(),
            parent_task_id: None,
        })
        .collect();
    tasks::insert_tasks_tx(tx, news).await.map_err(Into::into)
}
