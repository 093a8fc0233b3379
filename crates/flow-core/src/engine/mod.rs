//! Execution engine: trigger, advance, and cancel workflow executions.
//!
//! Composes the dispatcher's pure decisions with persistence. Callers
//! (the completion service, the CLI's trigger command, sweeps) hold an
//! `Engine` alongside a `DefinitionRegistry` reference.

use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use flow_db::models::{Execution, StepType, Task};
use flow_db::queries::{executions as exec_db, tasks as task_db};

use crate::definition::registry::DefinitionRegistry;
use crate::dispatch::{self, DispatchOutcome, NewStepDispatch};
use crate::error::FlowError;
use crate::state::ExecutionStateMachine;

/// Composes dispatch decisions with persistence. Holds the registry behind
/// an `Arc` so it can be cloned into spawned worker tasks.
#[derive(Clone)]
pub struct Engine {
    pool: PgPool,
    registry: Arc<DefinitionRegistry>,
}

impl Engine {
    pub fn new(pool: PgPool, registry: Arc<DefinitionRegistry>) -> Self {
        Self { pool, registry }
    }

    /// Trigger a new execution. Returns the existing execution unchanged
    /// if `idempotency_key` is already known.
    pub async fn trigger(
        &self,
        workflow_name: &str,
        workflow_version: i32,
        input: Value,
        idempotency_key: Option<&str>,
    ) -> Result<Execution, FlowError> {
        if let Some(key) = idempotency_key {
            if let Some(existing) = exec_db::get_execution_by_idempotency_key(&self.pool, key).await? {
                return Ok(existing);
            }
        }

        let definition = self.registry.get(workflow_name, workflow_version)?;

        let execution = exec_db::insert_execution(
            &self.pool,
            exec_db::NewExecution {
                workflow_name,
                workflow_version,
                input: input.clone(),
                idempotency_key,
                timeout_at: None,
            },
        )
        .await?;

        let outcome = dispatch::create_first_task(definition, input)?;
        self.materialize(&execution, outcome).await?;

        ExecutionStateMachine::start(&self.pool, execution.id, execution.version).await?;

        exec_db::get_execution(&self.pool, execution.id)
            .await?
            .ok_or_else(|| FlowError::Fatal(format!("execution {} vanished after trigger", execution.id)))
    }

    /// Called after a task completes successfully. No-op if the owning
    /// execution is already terminal (cancellation discipline).
    pub async fn on_task_completed(&self, task: &Task) -> Result<(), FlowError> {
        let execution = self.load_execution(task.execution_id).await?;
        if execution.status.is_terminal() {
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
                dispatch::dispatch_after_branch_step(
                    definition,
                    group,
                    branch_key,
                    &task.step_name,
                    task.output.clone().unwrap_or(Value::Null),
                )?
            }
            StepType::Parallel => {
                let group = task.parallel_group.as_deref().ok_or_else(|| {
                    FlowError::Fatal(format!("parallel task {} missing parallel_group", task.id))
                })?;
                return self.on_parallel_sibling_completed(&execution, definition, group).await;
            }
            StepType::Sequential => dispatch::dispatch_next(
                definition,
                &task.step_name,
                task.output.clone().unwrap_or(Value::Null),
            )?,
        };

        self.advance_or_finish(&execution, outcome).await
    }

    /// Fan-in: after a parallel sibling reaches a terminal status, check
    /// whether the whole group is done. Serialized on a row-level lock on
    /// the execution so exactly one concurrent completer performs the
    /// post-block dispatch.
    async fn on_parallel_sibling_completed(
        &self,
        execution: &Execution,
        definition: &crate::definition::WorkflowDefinition,
        group: &str,
    ) -> Result<(), FlowError> {
        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        let locked = exec_db::lock_execution_for_update(&mut tx, execution.id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("execution {} not found", execution.id)))?;

        if locked.status.is_terminal() {
            tx.commit().await.map_err(anyhow::Error::from)?;
            return Ok(());
        }

        let siblings = task_db::list_parallel_group_tx(&mut tx, execution.id, group).await?;
        if !task_db::is_group_complete(&siblings) {
            tx.commit().await.map_err(anyhow::Error::from)?;
            return Ok(());
        }

        let outcome = dispatch::dispatch_after_parallel_block(definition, group, &siblings);

        match outcome {
            Ok(DispatchOutcome::Done(output)) => {
                exec_db::complete_execution_tx(&mut tx, execution.id, execution.version, output).await?;
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
                exec_db::fail_execution_tx(&mut tx, execution.id, execution.version, &msg).await?;
            }
            Err(other) => return Err(other),
        }

        tx.commit().await.map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn advance_or_finish(
        &self,
        execution: &Execution,
        outcome: DispatchOutcome,
    ) -> Result<(), FlowError> {
        match outcome {
            DispatchOutcome::Done(output) => {
                ExecutionStateMachine::complete(&self.pool, execution.id, execution.version, output)
                    .await?;
                Ok(())
            }
            other => self.materialize(execution, other).await,
        }
    }

    /// Called after a task exhausts its retry budget. No-op if the owning
    /// execution is already terminal.
    pub async fn on_task_dead_lettered(&self, task: &Task, error: &str) -> Result<(), FlowError> {
        let execution = self.load_execution(task.execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(());
        }

        // A dead-lettered sibling inside a parallel block may still let the
        // group complete (partial success); route through fan-in instead
        // of failing the execution outright.
        if task.step_type == StepType::Parallel {
            if let Some(group) = task.parallel_group.as_deref() {
                let definition = self
                    .registry
                    .get(&execution.workflow_name, execution.workflow_version)?;
                return self.on_parallel_sibling_completed(&execution, definition, group).await;
            }
        }

        let message = format!("step {:?} dead-lettered: {error}", task.step_name);
        ExecutionStateMachine::fail(&self.pool, execution.id, execution.version, &message).await?;
        Ok(())
    }

    /// Cancel an execution. Running tasks are not interrupted; they finish
    /// and their outputs persist on the task row, but `on_task_completed`
    /// will see the execution already terminal and refuse to dispatch.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), FlowError> {
        let execution = self.load_execution(execution_id).await?;
        ExecutionStateMachine::cancel(&self.pool, execution.id, execution.version).await?;
        Ok(())
    }

    async fn load_execution(&self, id: Uuid) -> Result<Execution, FlowError> {
        exec_db::get_execution(&self.pool, id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("execution {id} not found")))
    }

    async fn materialize(&self, execution: &Execution, outcome: DispatchOutcome) -> Result<(), FlowError> {
        match outcome {
            DispatchOutcome::Done(output) => {
                ExecutionStateMachine::complete(&self.pool, execution.id, execution.version, output)
                    .await?;
            }
            DispatchOutcome::Sequential(d) | DispatchOutcome::Branch(d) => {
                insert_one(&self.pool, execution.id, d).await?;
            }
            DispatchOutcome::Parallel(ds) => {
                insert_batch(&self.pool, execution.id, ds).await?;
            }
        }
        Ok(())
    }
}

async fn insert_one(pool: &PgPool, execution_id: Uuid, d: NewStepDispatch) -> Result<Task, FlowError> {
    task_db::insert_task(
        pool,
        task_db::NewTask {
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

async fn insert_batch(
    pool: &PgPool,
    execution_id: Uuid,
    ds: Vec<NewStepDispatch>,
) -> Result<Vec<Task>, FlowError> {
    let news = ds
        .iter()
        .map(|d| task_db::NewTask {
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
    task_db::insert_tasks_batch(pool, news).await.map_err(Into::into)
}

async fn insert_one_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    execution_id: Uuid,
    d: NewStepDispatch,
) -> Result<Task, FlowError> {
    task_db::insert_task_tx(
        tx,
        task_db::NewTask {
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
    execution_id: Uuid,
    ds: Vec<NewStepDispatch>,
) -> Result<Vec<Task>, FlowError> {
    let news = ds
        .iter()
        .map(|d| task_db::NewTask {
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
    task_db::insert_tasks_tx(tx, news).await.map_err(Into::into)
}

