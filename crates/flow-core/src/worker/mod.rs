//! Worker runtime: polls the task queue, invokes step handlers, and
//! advances the workflow engine on completion.

pub mod handler;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flow_db::models::Task;
use flow_db::queries::{executions as exec_db, tasks as task_db, workers as worker_db};

use crate::completion::CompletionService;
use crate::definition::registry::DefinitionRegistry;
use crate::engine::Engine;
use crate::error::FlowError;
use crate::queue;
use crate::worker::handler::{box_if_not_object, HandlerContext, HandlerRegistry};

/// Tunables for a single worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    pub lock_timeout_ms: i64,
    pub drain_timeout_ms: u64,
    pub stale_threshold_secs: i64,
    pub heartbeat_interval_ms: u64,
    pub notifier_debounce_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval_ms: 200,
            batch_size: 20,
            lock_timeout_ms: 5 * 60 * 1000,
            drain_timeout_ms: 30_000,
            stale_threshold_secs: 60,
            heartbeat_interval_ms: 5_000,
            notifier_debounce_ms: 50,
        }
    }
}

/// In-memory lifecycle, distinct from the worker row's persisted status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// A live worker instance: one poll loop, a handler-invocation task pool,
/// and a separate advancement task pool, all sharing one database pool.
///
/// Always held behind an `Arc` so in-flight handler/prefetch tasks spawned
/// onto the tokio runtime can hold a cheap clone of it.
pub struct Worker {
    pool: PgPool,
    worker_id: String,
    config: WorkerConfig,
    engine: Engine,
    completion: CompletionService,
    definitions: Arc<DefinitionRegistry>,
    handlers: Arc<HandlerRegistry>,
    lifecycle: RwLock<Lifecycle>,
    active_tasks: AtomicUsize,
    prefetch: AsyncMutex<VecDeque<Task>>,
}

impl Worker {
    pub fn new(
        pool: PgPool,
        hostname: &str,
        config: WorkerConfig,
        definitions: Arc<DefinitionRegistry>,
        handlers: Arc<HandlerRegistry>,
    ) -> Arc<Self> {
        let short: String = Uuid::new_v4().to_string().chars().take(8).collect();
        let worker_id = format!("{hostname}-{short}");
        let engine = Engine::new(pool.clone(), definitions.clone());
        let completion = CompletionService::new(pool.clone(), definitions.clone());
        Arc::new(Self {
            pool,
            worker_id,
            config,
            engine,
            completion,
            definitions,
            handlers,
            lifecycle: RwLock::new(Lifecycle::Starting),
            active_tasks: AtomicUsize::new(0),
            prefetch: AsyncMutex::new(VecDeque::new()),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().expect("lifecycle lock poisoned")
    }

    fn set_lifecycle(&self, state: Lifecycle) {
        *self.lifecycle.write().expect("lifecycle lock poisoned") = state;
    }

    /// Start the worker: register its row, then run the poll loop until
    /// `shutdown` is cancelled, at which point a graceful drain runs.
    ///
    /// The optional `notifier` channel lets callers push an out-of-schedule
    /// poll; absence degrades gracefully to fixed-interval polling.
    pub async fn run(
        self: &Arc<Self>,
        shutdown: CancellationToken,
        mut notifier: Option<broadcast::Receiver<()>>,
    ) -> Result<(), FlowError> {
        worker_db::register_worker(&self.pool, &self.worker_id, &self.worker_id, self.config.concurrency as i32)
            .await?;
        self.set_lifecycle(Lifecycle::Running);

        let mut poll_tick = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        let mut heartbeat_tick = tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        let mut last_notify = tokio::time::Instant::now()
            .checked_sub(Duration::from_millis(self.config.notifier_debounce_ms))
            .unwrap_or_else(tokio::time::Instant::now);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = poll_tick.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(worker_id = %self.worker_id, error = %e, "poll cycle failed");
                    }
                }
                _ = heartbeat_tick.tick() => {
                    let active = self.active_tasks.load(Ordering::SeqCst) as i32;
                    if let Err(e) = worker_db::heartbeat(&self.pool, &self.worker_id, active).await {
                        tracing::error!(worker_id = %self.worker_id, error = %e, "heartbeat failed");
                    }
                }
                signal = async {
                    match notifier.as_mut() {
                        Some(rx) => rx.recv().await.ok(),
                        None => std::future::pending().await,
                    }
                } => {
                    if signal.is_some() {
                        let now = tokio::time::Instant::now();
                        if now.duration_since(last_notify) >= Duration::from_millis(self.config.notifier_debounce_ms) {
                            last_notify = now;
                            if let Err(e) = self.poll_once().await {
                                tracing::error!(worker_id = %self.worker_id, error = %e, "notifier-triggered poll failed");
                            }
                        }
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// One poll cycle: drain the prefetch buffer, top up from the queue,
    /// submit acquired tasks to the handler-invocation pool.
    async fn poll_once(self: &Arc<Self>) -> Result<(), FlowError> {
        if self.lifecycle() != Lifecycle::Running {
            return Ok(());
        }

        let available = self.config.concurrency as i64 - self.active_tasks.load(Ordering::SeqCst) as i64;
        if available <= 0 {
            return Ok(());
        }

        let mut drained = Vec::new();
        {
            let mut buffer = self.prefetch.lock().await;
            while (drained.len() as i64) < available {
                match buffer.pop_front() {
                    Some(task) => drained.push(task),
                    None => break,
                }
            }
        }

        let remaining = std::cmp::min(available - drained.len() as i64, self.config.batch_size);
        if remaining > 0 {
            let acquired = queue::acquire(&self.pool, &self.worker_id, remaining, self.config.lock_timeout_ms).await?;
            drained.extend(acquired);
        }

        for task in drained {
            self.active_tasks.fetch_add(1, Ordering::SeqCst);
            self.spawn_handler(task);
        }

        let buffer_is_empty = self.prefetch.lock().await.is_empty();
        if buffer_is_empty {
            self.spawn_prefetch();
        }

        Ok(())
    }

    /// Submit a prefetch job to the advancement pool: acquire a batch
    /// asynchronously and offer it to the buffer.
    fn spawn_prefetch(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            match queue::acquire(&worker.pool, &worker.worker_id, worker.config.batch_size, worker.config.lock_timeout_ms).await {
                Ok(tasks) if !tasks.is_empty() => {
                    let mut guard = worker.prefetch.lock().await;
                    guard.extend(tasks);
                }
                Ok(_) => {}
                Err(e) => tracing::error!(worker_id = %worker.worker_id, error = %e, "prefetch acquire failed"),
            }
        });
    }

    /// Run one task's full handler-invocation sequence, then submit the
    /// completion to the advancement pool.
    fn spawn_handler(self: &Arc<Self>, task: Task) {
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            let result = invoke_handler(&worker.pool, &worker.definitions, &worker.handlers, &task).await;
            worker.active_tasks.fetch_sub(1, Ordering::SeqCst);

            match result {
                Ok(output) => {
                    if let Err(e) = worker.completion.complete_and_advance(&task, output).await {
                        tracing::error!(task_id = %task.id, worker_id = %worker.worker_id, error = %e, "complete_and_advance failed");
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    match queue::fail(&worker.pool, &task, &message).await {
                        Ok(true) => {
                            let workflow_name = match exec_db::get_execution(&worker.pool, task.execution_id).await {
                                Ok(Some(execution)) => execution.workflow_name,
                                _ => task.step_name.clone(),
                            };
                            if let Err(e) = queue::dead_letter(&worker.pool, &task, &workflow_name, &message).await {
                                tracing::error!(task_id = %task.id, error = %e, "dead_letter insert failed");
                            }
                            if let Err(e) = worker.engine.on_task_dead_lettered(&task, &message).await {
                                tracing::error!(task_id = %task.id, error = %e, "on_task_dead_lettered failed");
                            }
                        }
                        Ok(false) => {}
                        Err(e) => tracing::error!(task_id = %task.id, error = %e, "fail() failed"),
                    }
                }
            }
        });
    }

    /// Steps 1-9 of graceful shutdown.
    async fn shutdown(&self) -> Result<(), FlowError> {
        self.set_lifecycle(Lifecycle::Draining);

        let drain_deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.drain_timeout_ms);
        while self.active_tasks.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut buffer = self.prefetch.lock().await;
        while let Some(task) = buffer.pop_front() {
            if let Err(e) = queue::release(&self.pool, task.id).await {
                tracing::error!(task_id = %task.id, error = %e, "failed to release buffered task on shutdown");
            }
        }
        drop(buffer);

        if let Err(e) = queue::release_all_for_worker(&self.pool, &self.worker_id).await {
            tracing::error!(worker_id = %self.worker_id, error = %e, "failed to release locked tasks on shutdown");
        }

        worker_db::mark_stopped(&self.pool, &self.worker_id).await?;
        self.set_lifecycle(Lifecycle::Stopped);
        Ok(())
    }
}

/// The handler-invocation sequence: mark RUNNING, build context, invoke,
/// persist metadata, box non-map returns.
async fn invoke_handler(
    pool: &PgPool,
    definitions: &DefinitionRegistry,
    handlers: &HandlerRegistry,
    task: &Task,
) -> Result<Value, FlowError> {
    queue::start(pool, task).await?;

    let execution = exec_db::get_execution(pool, task.execution_id)
        .await?
        .ok_or_else(|| FlowError::NotFound(format!("execution {} not found", task.execution_id)))?;

    let definition = definitions.get(&execution.workflow_name, execution.workflow_version)?;
    let step = definition
        .find_step(&task.step_name)
        .ok_or_else(|| FlowError::Fatal(format!("step {:?} not found in workflow definition", task.step_name)))?;

    let mut ctx = HandlerContext {
        execution_id: task.execution_id,
        workflow_name: execution.workflow_name.clone(),
        step_name: task.step_name.clone(),
        input: task.input.clone(),
        execution_input: execution.input.clone(),
        attempt: task.attempt + 1,
        metadata: task.metadata.clone(),
    };

    let handler = handlers.get(&step.handler_ref)?;
    let output = handler.handle(&mut ctx).await?;

    if ctx.metadata != task.metadata {
        task_db::update_task_metadata(pool, task.id, ctx.metadata).await?;
    }

    Ok(box_if_not_object(output))
}

/// Leader-gated orphan reclamation sweep: reset tasks whose lock expired
/// without a worker releasing them back to PENDING.
pub async fn reclaim_orphans(pool: &PgPool) -> Result<usize, FlowError> {
    let reclaimed = queue::reclaim_orphaned(pool).await?;
    Ok(reclaimed.len())
}

/// Leader-gated stale-worker sweep: mark workers whose heartbeat is older
/// than `stale_after_secs` as STOPPED and release every task they held.
pub async fn sweep_stale_workers(pool: &PgPool, stale_after_secs: i64) -> Result<usize, FlowError> {
    let stale = worker_db::find_stale_workers(pool, stale_after_secs).await?;
    let mut released = 0;
    for worker in &stale {
        worker_db::mark_stale_stopped(pool, &worker.worker_id).await?;
        let tasks = queue::release_all_for_worker(pool, &worker.worker_id).await?;
        released += tasks.len();
    }
    Ok(released)
}
