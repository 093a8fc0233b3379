//! Workflow definitions: immutable, process-resident descriptions of a
//! directed sequence of steps, parallel blocks, and branch blocks.
//!
//! Definitions are built once via explicit Rust registration (no DSL
//! parsing, no reflection) and held by the [`registry::DefinitionRegistry`].

pub mod registry;

use serde::Serialize;

use crate::error::FlowError;
use crate::retry::RetryPolicy;

/// A single unit of work within an element.
#[derive(Debug, Clone, Serialize)]
pub struct StepDef {
    pub name: String,
    pub handler_ref: String,
    pub retry_policy: RetryPolicy,
    pub timeout_ms: Option<i64>,
    pub priority: i32,
}

impl StepDef {
    pub fn new(name: impl Into<String>, handler_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler_ref: handler_ref.into(),
            retry_policy: RetryPolicy::default(),
            timeout_ms: None,
            priority: 0,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// One ordered element of a workflow: a single step, a fan-out block, or a
/// conditional branch block.
#[derive(Debug, Clone, Serialize)]
pub enum Element {
    Step(StepDef),
    Parallel {
        name: String,
        steps: Vec<StepDef>,
    },
    Branch {
        name: String,
        /// `(condition value, intra-branch step list)`, order preserved for
        /// deterministic first-match evaluation.
        branches: Vec<(String, Vec<StepDef>)>,
        otherwise: Option<Vec<StepDef>>,
    },
}

impl Element {
    pub fn name(&self) -> &str {
        match self {
            Element::Step(s) => &s.name,
            Element::Parallel { name, .. } => name,
            Element::Branch { name, .. } => name,
        }
    }

    /// All step names owned by this element, across every nested branch.
    fn all_step_names(&self) -> Vec<&str> {
        match self {
            Element::Step(s) => vec![s.name.as_str()],
            Element::Parallel { steps, .. } => steps.iter().map(|s| s.name.as_str()).collect(),
            Element::Branch {
                branches, otherwise, ..
            } => {
                let mut names: Vec<&str> = branches
                    .iter()
                    .flat_map(|(_, steps)| steps.iter().map(|s| s.name.as_str()))
                    .collect();
                if let Some(steps) = otherwise {
                    names.extend(steps.iter().map(|s| s.name.as_str()));
                }
                names
            }
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Element::Step(_) => false,
            Element::Parallel { steps, .. } => steps.is_empty(),
            Element::Branch {
                branches, otherwise, ..
            } => branches.iter().all(|(_, s)| s.is_empty()) && otherwise.as_deref().unwrap_or(&[]).is_empty(),
        }
    }

    /// Look up the step list selected by a branch key, falling back to
    /// `"otherwise"`. Returns `None` if neither matches.
    pub fn branch_steps_for_key(&self, key: &str) -> Option<&[StepDef]> {
        match self {
            Element::Branch {
                branches, otherwise, ..
            } => branches
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, steps)| steps.as_slice())
                .or_else(|| otherwise.as_deref()),
            _ => None,
        }
    }
}

/// Find the step immediately following `completed_step_name` within a
/// branch's intra-branch step list, if one exists.
pub fn find_next_branch_step<'a>(
    branch_steps: &'a [StepDef],
    completed_step_name: &str,
) -> Option<&'a StepDef> {
    let idx = branch_steps
        .iter()
        .position(|s| s.name == completed_step_name)?;
    branch_steps.get(idx + 1)
}

/// Immutable, process-resident workflow definition, identified by
/// `(name, version)`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: i32,
    pub elements: Vec<Element>,
}

impl WorkflowDefinition {
    /// Build a definition, enforcing every structural invariant at
    /// construction time rather than deferring to first dispatch.
    pub fn new(
        name: impl Into<String>,
        version: i32,
        elements: Vec<Element>,
    ) -> Result<Self, FlowError> {
        let name = name.into();

        if version < 1 {
            return Err(FlowError::Invalid(format!(
                "workflow {name}: version must be >= 1, got {version}"
            )));
        }
        if elements.is_empty() {
            return Err(FlowError::Invalid(format!(
                "workflow {name}: must have at least one element"
            )));
        }
        for element in &elements {
            if element.is_empty() {
                return Err(FlowError::Invalid(format!(
                    "workflow {name}: element {:?} must be non-empty",
                    element.name()
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for element in &elements {
            for step_name in element.all_step_names() {
                if !seen.insert(step_name) {
                    return Err(FlowError::Invalid(format!(
                        "workflow {name}: duplicate step name {step_name:?}"
                    )));
                }
            }
        }

        // A branch as the first element without "otherwise" is a
        // structural defect: reject at registration, not at first trigger.
        if let Some(Element::Branch { otherwise, .. }) = elements.first() {
            if otherwise.is_none() {
                return Err(FlowError::Invalid(format!(
                    "workflow {name}: a branch block cannot be the first element \
                     without an \"otherwise\" arm"
                )));
            }
        }

        Ok(Self {
            name,
            version,
            elements,
        })
    }

    /// Index of the element owning `step_name`, searching nested branch
    /// step lists too.
    pub fn find_element_index(&self, step_name: &str) -> Option<usize> {
        self.elements
            .iter()
            .position(|e| e.all_step_names().contains(&step_name))
    }

    pub fn element_at(&self, index: usize) -> Option<&Element> {
        self.elements.get(index)
    }

    /// The first step(s) to materialize when an execution is triggered.
    pub fn first_element(&self) -> &Element {
        &self.elements[0]
    }

    /// Find a step definition by name, searching nested branch arms too.
    pub fn find_step(&self, step_name: &str) -> Option<&StepDef> {
        self.elements.iter().find_map(|e| match e {
            Element::Step(s) if s.name == step_name => Some(s),
            Element::Parallel { steps, .. } => steps.iter().find(|s| s.name == step_name),
            Element::Branch {
                branches, otherwise, ..
            } => branches
                .iter()
                .flat_map(|(_, steps)| steps.iter())
                .chain(otherwise.iter().flatten())
                .find(|s| s.name == step_name),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_elements() {
        let err = WorkflowDefinition::new("w", 1, vec![]).unwrap_err();
        assert!(matches!(err, FlowError::Invalid(_)));
    }

    #[test]
    fn rejects_version_below_one() {
        let elements = vec![Element::Step(StepDef::new("a", "h"))];
        let err = WorkflowDefinition::new("w", 0, elements).unwrap_err();
        assert!(matches!(err, FlowError::Invalid(_)));
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let elements = vec![
            Element::Step(StepDef::new("a", "h")),
            Element::Step(StepDef::new("a", "h")),
        ];
        let err = WorkflowDefinition::new("w", 1, elements).unwrap_err();
        assert!(matches!(err, FlowError::Invalid(_)));
    }

    #[test]
    fn rejects_empty_parallel_block() {
        let elements = vec![Element::Parallel {
            name: "p".into(),
            steps: vec![],
        }];
        let err = WorkflowDefinition::new("w", 1, elements).unwrap_err();
        assert!(matches!(err, FlowError::Invalid(_)));
    }

    #[test]
    fn rejects_leading_branch_without_otherwise() {
        let elements = vec![Element::Branch {
            name: "b".into(),
            branches: vec![("LOW".into(), vec![StepDef::new("fast", "h")])],
            otherwise: None,
        }];
        let err = WorkflowDefinition::new("w", 1, elements).unwrap_err();
        assert!(matches!(err, FlowError::Invalid(_)));
    }

    #[test]
    fn accepts_leading_branch_with_otherwise() {
        let elements = vec![Element::Branch {
            name: "b".into(),
            branches: vec![("LOW".into(), vec![StepDef::new("fast", "h")])],
            otherwise: Some(vec![StepDef::new("manual", "h")]),
        }];
        assert!(WorkflowDefinition::new("w", 1, elements).is_ok());
    }

    #[test]
    fn find_element_index_locates_nested_branch_step() {
        let elements = vec![
            Element::Step(StepDef::new("evaluate", "h")),
            Element::Branch {
                name: "b".into(),
                branches: vec![("HIGH".into(), vec![StepDef::new("deep", "h"), StepDef::new("escalate", "h")])],
                otherwise: Some(vec![StepDef::new("manual", "h")]),
            },
            Element::Step(StepDef::new("finalize", "h")),
        ];
        let def = WorkflowDefinition::new("w", 1, elements).unwrap();
        assert_eq!(def.find_element_index("escalate"), Some(1));
        assert_eq!(def.find_element_index("finalize"), Some(2));
        assert_eq!(def.find_element_index("missing"), None);
    }

    #[test]
    fn find_step_locates_nested_branch_and_parallel_steps() {
        let elements = vec![
            Element::Parallel {
                name: "checks".into(),
                steps: vec![StepDef::new("fraud", "h")],
            },
            Element::Branch {
                name: "route".into(),
                branches: vec![("HIGH".into(), vec![StepDef::new("deep", "h")])],
                otherwise: Some(vec![StepDef::new("fast", "h")]),
            },
        ];
        let def = WorkflowDefinition::new("w", 1, elements).unwrap();
        assert!(def.find_step("fraud").is_some());
        assert!(def.find_step("deep").is_some());
        assert!(def.find_step("fast").is_some());
        assert!(def.find_step("missing").is_none());
    }

    #[test]
    fn find_next_branch_step_advances_intra_branch() {
        let steps = vec![StepDef::new("deep", "h"), StepDef::new("escalate", "h")];
        let next = find_next_branch_step(&steps, "deep").unwrap();
        assert_eq!(next.name, "escalate");
        assert!(find_next_branch_step(&steps, "escalate").is_none());
    }
}
