//! Core orchestration logic for the durable workflow engine: workflow
//! definitions, the dispatcher, the task queue, the execution state
//! machine, the completion service, and the worker runtime.
//!
//! Persistence lives in `flow_db`; this crate composes it with pure
//! decision logic (dispatch, retry) and async runtime concerns (worker
//! polling, sweeps).

pub mod completion;
pub mod config;
pub mod dead_letter;
pub mod definition;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod notifier;
pub mod queue;
pub mod retry;
pub mod state;
pub mod sweep;
pub mod worker;

pub use definition::registry::DefinitionRegistry;
pub use definition::{Element, StepDef, WorkflowDefinition};
pub use engine::Engine;
pub use error::{FlowError, Result};
pub use worker::handler::{HandlerContext, HandlerRegistry, StepHandler};
pub use worker::{Worker, WorkerConfig};
