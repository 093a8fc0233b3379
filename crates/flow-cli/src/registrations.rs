//! Workflow and handler registration.
//!
//! There is no DSL or reflection-based discovery: embedding binaries build
//! their `DefinitionRegistry`/`HandlerRegistry` explicitly at startup. This
//! module is flowctl's own startup wiring, doubling as a worked example for
//! anyone embedding `flow-core` in their own binary.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use flow_core::definition::registry::DefinitionRegistry;
use flow_core::definition::{Element, StepDef, WorkflowDefinition};
use flow_core::worker::handler::{box_if_not_object, HandlerContext, HandlerRegistry, StepHandler};
use flow_core::Result;
use flow_db::queries::workflows;

/// Passes its input straight through, boxing scalars into `{"result": ...}`.
/// Useful for smoke-testing a fresh deployment before real handlers exist.
struct Echo;

#[async_trait]
impl StepHandler for Echo {
    async fn handle(&self, ctx: &mut HandlerContext) -> Result<Value> {
        Ok(box_if_not_object(ctx.input.clone()))
    }
}

fn order_processing() -> Result<WorkflowDefinition> {
    WorkflowDefinition::new(
        "order-processing",
        1,
        vec![
            Element::Step(StepDef::new("validate", "echo")),
            Element::Parallel {
                name: "checks".into(),
                steps: vec![StepDef::new("fraud", "echo"), StepDef::new("inventory", "echo")],
            },
            Element::Branch {
                name: "route".into(),
                branches: vec![(
                    "HIGH".into(),
                    vec![StepDef::new("deep", "echo"), StepDef::new("escalate", "echo")],
                )],
                otherwise: Some(vec![StepDef::new("fast", "echo")]),
            },
            Element::Step(StepDef::new("finalize", "echo")),
        ],
    )
}

pub fn build_definitions() -> Result<Arc<DefinitionRegistry>> {
    let mut registry = DefinitionRegistry::new();
    registry.register(order_processing()?);
    Ok(Arc::new(registry))
}

pub fn build_handlers() -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register("echo", Arc::new(Echo));
    Arc::new(registry)
}

/// Upsert a durable audit row per registered definition. The in-process
/// registry remains the source of truth for dispatch; this just gives
/// operators a record of what was registered that survives a restart.
pub async fn sync_audit_rows(pool: &PgPool, registry: &DefinitionRegistry) -> anyhow::Result<()> {
    for definition in registry.list() {
        let serialized = serde_json::to_value(definition)
            .context("failed to serialize workflow definition for audit")?;
        workflows::upsert_workflow(pool, &definition.name, definition.version, None, serialized).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_processing_registers_without_error() {
        let registry = build_definitions().unwrap();
        assert!(registry.get("order-processing", 1).is_ok());
    }

    #[tokio::test]
    async fn echo_handler_boxes_scalars() {
        let handlers = build_handlers();
        let handler = handlers.get("echo").unwrap();
        let mut ctx = HandlerContext {
            execution_id: uuid::Uuid::new_v4(),
            workflow_name: "order-processing".into(),
            step_name: "validate".into(),
            input: serde_json::json!(42),
            execution_input: serde_json::json!({}),
            attempt: 1,
            metadata: serde_json::json!({}),
        };
        let output = handler.handle(&mut ctx).await.unwrap();
        assert_eq!(output, serde_json::json!({"result": 42}));
    }
}
