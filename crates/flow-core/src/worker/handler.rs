//! Step handler trait and the context passed to user-supplied handlers.
//!
//! Dynamic step-handler dispatch is replaced by a trait object taking and
//! returning `serde_json::Value`, keyed by the `handler_ref` string a step
//! definition carries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::FlowError;

/// Everything a handler needs to process one task invocation.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub step_name: String,
    /// The task's stored input (previous step's output, or the
    /// aggregated parallel-block output map).
    pub input: Value,
    /// The original input the execution was triggered with.
    pub execution_input: Value,
    /// 1-based attempt number for this invocation.
    pub attempt: i32,
    /// Writable scratch space a handler can use to persist metadata back
    /// onto the task row.
    pub metadata: Value,
}

/// A step's executable behavior. Implementations are registered under the
/// `handler_ref` named by the owning `StepDef`.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Value, FlowError>;
}

/// Maps `handler_ref` to its implementation. Built once at startup and
/// shared (behind `Arc`) across every worker task.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler_ref: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler_ref.into(), handler);
    }

    pub fn get(&self, handler_ref: &str) -> Result<Arc<dyn StepHandler>, FlowError> {
        self.handlers
            .get(handler_ref)
            .cloned()
            .ok_or_else(|| FlowError::NotFound(format!("no handler registered for {handler_ref:?}")))
    }
}

/// Box a handler return value that is not itself a JSON object, per the
/// dispatcher's "return values that are not maps are boxed" rule.
pub fn box_if_not_object(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => serde_json::json!({ "result": other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl StepHandler for Echo {
        async fn handle(&self, ctx: &mut HandlerContext) -> Result<Value, FlowError> {
            Ok(ctx.input.clone())
        }
    }

    #[test]
    fn box_if_not_object_wraps_scalars() {
        assert_eq!(box_if_not_object(json!(42)), json!({"result": 42}));
        assert_eq!(box_if_not_object(json!("x")), json!({"result": "x"}));
    }

    #[test]
    fn box_if_not_object_passes_maps_through() {
        assert_eq!(box_if_not_object(json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn registry_get_missing_is_not_found() {
        let registry = HandlerRegistry::new();
        assert!(matches!(registry.get("missing"), Err(FlowError::NotFound(_))));
    }

    #[tokio::test]
    async fn registry_roundtrips_registered_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(Echo));
        let handler = registry.get("echo").unwrap();
        let mut ctx = HandlerContext {
            execution_id: Uuid::new_v4(),
            workflow_name: "w".into(),
            step_name: "s".into(),
            input: json!({"a": 1}),
            execution_input: json!({}),
            attempt: 1,
            metadata: json!({}),
        };
        let output = handler.handle(&mut ctx).await.unwrap();
        assert_eq!(output, json!({"a": 1}));
    }
}
