//! Task dispatcher: pure decision logic for what to create next after a
//! step completes. Persistence is left to the engine, which turns a
//! [`DispatchPlan`] into actual task rows inside its own transaction.

use std::collections::BTreeMap;

use flow_db::models::{BackoffStrategy, StepType, Task, TaskStatus};
use serde_json::Value;

use crate::definition::{find_next_branch_step, Element, StepDef, WorkflowDefinition};
use crate::error::FlowError;

/// One task to be created, fully specified.
#[derive(Debug, Clone)]
pub struct NewStepDispatch {
    pub step_name: String,
    pub step_type: StepType,
    pub step_order: i32,
    pub input: Value,
    pub max_attempts: i32,
    pub backoff_strategy: BackoffStrategy,
    pub backoff_base_ms: i64,
    pub priority: i32,
    pub parallel_group: Option<String>,
    pub branch_key: Option<String>,
}

fn dispatch_for_step(step: &StepDef, step_order: i32, input: Value) -> NewStepDispatch {
    NewStepDispatch {
        step_name: step.name.clone(),
        step_type: StepType::Sequential,
        step_order,
        input,
        max_attempts: step.retry_policy.max_attempts,
        backoff_strategy: step.retry_policy.strategy,
        backoff_base_ms: step.retry_policy.base_delay_ms,
        priority: step.priority,
        parallel_group: None,
        branch_key: None,
    }
}

/// What the dispatcher decided to do after a step (or a whole parallel
/// block) finished.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// No next element: the execution is complete. Carries the output to
    /// record as the execution's final output.
    Done(Value),
    /// A single sequential task.
    Sequential(NewStepDispatch),
    /// A fan-out: every sibling is created together.
    Parallel(Vec<NewStepDispatch>),
    /// A single branch task (either the first step of a matched branch, or
    /// the next intra-branch step).
    Branch(NewStepDispatch),
}

/// Extract the branch-selection key from a completed step's output.
///
/// If `input` is an object, look for `"result"` then `"branch"`; a bare
/// JSON string string-coerces directly. Anything else (a map lacking both
/// keys, or a non-map/non-string scalar) is a fatal, named dispatch error —
/// never silently coerced to a debug string.
pub fn extract_branch_key(input: &Value) -> Result<String, FlowError> {
    match input {
        Value::Object(map) => {
            if let Some(v) = map.get("result") {
                return value_as_branch_key(v);
            }
            if let Some(v) = map.get("branch") {
                return value_as_branch_key(v);
            }
            Err(FlowError::Invalid(
                "branch condition input is a map without a \"result\" or \"branch\" key".into(),
            ))
        }
        Value::String(s) => Ok(s.clone()),
        other => Err(FlowError::Invalid(format!(
            "branch condition input must be a map or a string, got {other}"
        ))),
    }
}

fn value_as_branch_key(v: &Value) -> Result<String, FlowError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        other => Err(FlowError::Invalid(format!(
            "branch condition value must be a string, got {other}"
        ))),
    }
}

/// Build the aggregated parallel-block output map `{stepName -> output}`
/// across successful siblings only. Dead-lettered siblings are omitted.
pub fn aggregate_parallel_outputs(siblings: &[Task]) -> Value {
    let mut map = BTreeMap::new();
    for task in siblings {
        if task.status == TaskStatus::Completed {
            map.insert(
                task.step_name.clone(),
                task.output.clone().unwrap_or(Value::Null),
            );
        }
    }
    Value::Object(map.into_iter().collect())
}

/// Decide what to dispatch immediately after a workflow is triggered.
/// A branch as the first element is rejected at registration time, so this
/// never has to reason about a missing `"otherwise"`.
pub fn create_first_task(
    definition: &WorkflowDefinition,
    input: Value,
) -> Result<DispatchOutcome, FlowError> {
    dispatch_element(definition.first_element(), 0, input)
}

fn dispatch_element(
    element: &Element,
    step_order: i32,
    input: Value,
) -> Result<DispatchOutcome, FlowError> {
    match element {
        Element::Step(step) => Ok(DispatchOutcome::Sequential(dispatch_for_step(
            step, step_order, input,
        ))),
        Element::Parallel { steps, name } => {
            let dispatches = steps
                .iter()
                .map(|step| {
                    let mut d = dispatch_for_step(step, step_order, input.clone());
                    d.step_type = StepType::Parallel;
                    d.parallel_group = Some(name.clone());
                    d
                })
                .collect();
            Ok(DispatchOutcome::Parallel(dispatches))
        }
        Element::Branch { name, .. } => {
            let key = extract_branch_key(&input)?;
            let matched_key = if has_explicit_arm(element, &key) {
                key
            } else {
                "otherwise".to_string()
            };
            let branch_steps = element.branch_steps_for_key(&matched_key).ok_or_else(|| {
                FlowError::Invalid(format!(
                    "branch {name}: no arm for key {matched_key:?} and no \"otherwise\" fallback"
                ))
            })?;
            let first_step = branch_steps.first().ok_or_else(|| {
                FlowError::Fatal(format!("branch {name}: matched arm has no steps"))
            })?;
            let mut d = dispatch_for_step(first_step, step_order, input);
            d.step_type = StepType::Branch;
            d.parallel_group = Some(name.clone());
            d.branch_key = Some(matched_key);
            Ok(DispatchOutcome::Branch(d))
        }
    }
}

fn has_explicit_arm(element: &Element, key: &str) -> bool {
    match element {
        Element::Branch { branches, .. } => branches.iter().any(|(k, _)| k == key),
        _ => false,
    }
}

/// Decide what happens after a (non-branch, non-parallel-sibling) step
/// completes: find the next element and dispatch into it.
pub fn dispatch_next(
    definition: &WorkflowDefinition,
    completed_step_name: &str,
    completed_output: Value,
) -> Result<DispatchOutcome, FlowError> {
    let index = definition.find_element_index(completed_step_name).ok_or_else(|| {
        FlowError::Fatal(format!(
            "completed step {completed_step_name:?} not found in workflow {}",
            definition.name
        ))
    })?;

    match definition.element_at(index + 1) {
        None => Ok(DispatchOutcome::Done(completed_output)),
        Some(next) => dispatch_element(next, (index + 1) as i32, completed_output),
    }
}

/// Decide what happens after a parallel block finishes (fan-in). `siblings`
/// must already be confirmed terminal by the caller via
/// `flow_db::queries::tasks::is_group_complete`.
pub fn dispatch_after_parallel_block(
    definition: &WorkflowDefinition,
    block_name: &str,
    siblings: &[Task],
) -> Result<DispatchOutcome, FlowError> {
    let any_completed = siblings.iter().any(|t| t.status == TaskStatus::Completed);
    if !any_completed {
        return Err(FlowError::Invalid(format!(
            "parallel block {block_name}: every sibling dead-lettered, no successful output to advance"
        )));
    }

    let block_index = definition
        .elements
        .iter()
        .position(|e| e.name() == block_name)
        .ok_or_else(|| FlowError::Fatal(format!("parallel block {block_name} not found")))?;

    let aggregated = aggregate_parallel_outputs(siblings);

    match definition.element_at(block_index + 1) {
        None => Ok(DispatchOutcome::Done(aggregated)),
        Some(next) => dispatch_element(next, (block_index + 1) as i32, aggregated),
    }
}

/// Decide what happens after one step inside a branch completes: advance
/// to the next intra-branch step if one exists, otherwise fall through to
/// the element after the branch block.
pub fn dispatch_after_branch_step(
    definition: &WorkflowDefinition,
    block_name: &str,
    branch_key: &str,
    completed_step_name: &str,
    completed_output: Value,
) -> Result<DispatchOutcome, FlowError> {
    let block_index = definition
        .elements
        .iter()
        .position(|e| e.name() == block_name)
        .ok_or_else(|| FlowError::Fatal(format!("branch block {block_name} not found")))?;

    let element = definition.element_at(block_index).expect("index just located");
    let branch_steps = element.branch_steps_for_key(branch_key).ok_or_else(|| {
        FlowError::Fatal(format!("branch block {block_name}: key {branch_key:?} vanished"))
    })?;

    if let Some(next_step) = find_next_branch_step(branch_steps, completed_step_name) {
        let mut d = dispatch_for_step(next_step, block_index as i32, completed_output);
        d.step_type = StepType::Branch;
        d.parallel_group = Some(block_name.to_string());
        d.branch_key = Some(branch_key.to_string());
        return Ok(DispatchOutcome::Branch(d));
    }

    match definition.element_at(block_index + 1) {
        None => Ok(DispatchOutcome::Done(completed_output)),
        Some(next) => dispatch_element(next, (block_index + 1) as i32, completed_output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepDef;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn def() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "order",
            1,
            vec![
                Element::Step(StepDef::new("validate", "h")),
                Element::Parallel {
                    name: "checks".into(),
                    steps: vec![StepDef::new("fraud", "h"), StepDef::new("inventory", "h")],
                },
                Element::Branch {
                    name: "route".into(),
                    branches: vec![("HIGH".into(), vec![StepDef::new("deep", "h"), StepDef::new("escalate", "h")])],
                    otherwise: Some(vec![StepDef::new("fast", "h")]),
                },
                Element::Step(StepDef::new("finalize", "h")),
            ],
        )
        .unwrap()
    }

    fn dummy_task(step_name: &str, status: TaskStatus, output: Option<Value>) -> Task {
        Task {
            id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            step_name: step_name.into(),
            step_type: StepType::Parallel,
            step_order: 1,
            status,
            input: Value::Null,
            output,
            error: None,
            attempt: 0,
            max_attempts: 1,
            backoff_strategy: BackoffStrategy::Fixed,
            backoff_base_ms: 1000,
            next_retry_at: None,
            locked_by: None,
            locked_at: None,
            lock_timeout_at: None,
            started_at: None,
            completed_at: None,
            parallel_group: Some("checks".into()),
            branch_key: None,
            priority: 0,
            parent_task_id: None,
            metadata: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            version: 0,
        }
    }

    #[test]
    fn first_task_is_sequential() {
        let outcome = create_first_task(&def(), json!({"amount": 10})).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Sequential(d) if d.step_name == "validate"));
    }

    #[test]
    fn dispatch_next_after_step_fans_out_to_parallel_block() {
        let outcome = dispatch_next(&def(), "validate", json!({"ok": true})).unwrap();
        match outcome {
            DispatchOutcome::Parallel(dispatches) => {
                assert_eq!(dispatches.len(), 2);
                assert!(dispatches.iter().all(|d| d.parallel_group.as_deref() == Some("checks")));
            }
            other => panic!("expected parallel fan-out, got {other:?}"),
        }
    }

    #[test]
    fn branch_extraction_prefers_result_then_branch_key() {
        assert_eq!(extract_branch_key(&json!({"result": "HIGH"})).unwrap(), "HIGH");
        assert_eq!(extract_branch_key(&json!({"branch": "LOW"})).unwrap(), "LOW");
        assert_eq!(extract_branch_key(&json!("HIGH")).unwrap(), "HIGH");
    }

    #[test]
    fn branch_extraction_rejects_map_without_known_keys() {
        assert!(extract_branch_key(&json!({"other": "x"})).is_err());
    }

    #[test]
    fn branch_extraction_rejects_non_map_non_string() {
        assert!(extract_branch_key(&json!(42)).is_err());
    }

    #[test]
    fn dispatch_after_parallel_block_aggregates_successful_siblings_only() {
        let siblings = vec![
            dummy_task("fraud", TaskStatus::Completed, Some(json!({"score": 1}))),
            dummy_task("inventory", TaskStatus::DeadLetter, None),
        ];
        let outcome = dispatch_after_parallel_block(&def(), "checks", &siblings).unwrap();
        match outcome {
            DispatchOutcome::Branch(d) => {
                let input = d.input;
                assert_eq!(input["fraud"]["score"], json!(1));
                assert!(input.get("inventory").is_none());
            }
            other => panic!("expected branch dispatch, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_after_parallel_block_fails_when_all_dead_lettered() {
        let siblings = vec![
            dummy_task("fraud", TaskStatus::DeadLetter, None),
            dummy_task("inventory", TaskStatus::DeadLetter, None),
        ];
        let err = dispatch_after_parallel_block(&def(), "checks", &siblings).unwrap_err();
        assert!(matches!(err, FlowError::Invalid(_)));
    }

    #[test]
    fn multi_step_branch_advances_intra_branch_then_falls_through() {
        let first = dispatch_after_branch_step(&def(), "route", "HIGH", "deep", json!({}))
            .unwrap();
        assert!(matches!(first, DispatchOutcome::Branch(d) if d.step_name == "escalate"));

        let after = dispatch_after_branch_step(&def(), "route", "HIGH", "escalate", json!({}))
            .unwrap();
        assert!(matches!(after, DispatchOutcome::Sequential(d) if d.step_name == "finalize"));
    }

    #[test]
    fn dispatch_next_for_terminal_step_returns_done() {
        let outcome = dispatch_next(&def(), "finalize", json!({"done": true})).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Done(_)));
    }
}
