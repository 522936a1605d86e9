//! Workflow definition validation
//!
//! Definitions are checked before they enter the manager cache: step ids,
//! goto and branch targets, branch acyclicity, and kind-specific config.
//! Conditional branches must form a DAG; goto edges are instead bounded at
//! runtime by a hop budget since a backwards goto can legitimately converge.

use std::collections::{HashMap, HashSet};

use petgraph::algo;
use petgraph::graph::DiGraph;
use thiserror::Error;

use garrison_domain::{StepKind, Value, WorkflowDefinition};

/// Minimum Jaro-Winkler similarity before an unknown id earns a
/// "did you mean" hint
const SUGGESTION_SIMILARITY: f64 = 0.78;

// =============================================================================
// Errors
// =============================================================================

/// Why a definition was rejected
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("step at index {index} has an empty id")]
    EmptyStepId { index: usize },

    #[error("duplicate step id '{id}'")]
    DuplicateStepId { id: String },

    #[error("step '{step}' uses goto without a goto_step")]
    MissingGotoTarget { step: String },

    #[error(
        "step '{}' references unknown step '{}'{}",
        .step,
        .target,
        .suggestion.as_deref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default()
    )]
    UnknownStepReference {
        step: String,
        target: String,
        suggestion: Option<String>,
    },

    #[error("conditional branches form a cycle through: {}", .steps.join(" -> "))]
    BranchCycle { steps: Vec<String> },

    #[error("step '{step}' config is invalid: {message}")]
    BadStepConfig { step: String, message: String },
}

// =============================================================================
// Validation Functions
// =============================================================================

/// Validate a workflow definition.
///
/// Returns the first defect found.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), ValidationError> {
    validate_step_ids(definition)?;
    validate_step_references(definition)?;
    validate_branch_dag(definition)?;
    validate_step_config(definition)?;
    Ok(())
}

/// Step ids must be present and unique
fn validate_step_ids(definition: &WorkflowDefinition) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for (index, step) in definition.steps.iter().enumerate() {
        if step.id.is_empty() {
            return Err(ValidationError::EmptyStepId { index });
        }
        if !seen.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId {
                id: step.id.clone(),
            });
        }
    }
    Ok(())
}

/// Goto targets and conditional branch targets must exist
fn validate_step_references(definition: &WorkflowDefinition) -> Result<(), ValidationError> {
    let step_ids: HashSet<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();

    let unknown = |step: &str, target: &str| ValidationError::UnknownStepReference {
        step: step.to_string(),
        target: target.to_string(),
        suggestion: closest_step_id(target, &step_ids),
    };

    for step in &definition.steps {
        if let Some(policy) = &step.on_error {
            if policy.action == "goto" {
                match policy.goto_step.as_deref() {
                    None | Some("") => {
                        return Err(ValidationError::MissingGotoTarget {
                            step: step.id.clone(),
                        });
                    }
                    Some(target) if !step_ids.contains(target) => {
                        return Err(unknown(&step.id, target));
                    }
                    Some(_) => {}
                }
            }
        }

        for target in &step.next_steps {
            if !step_ids.contains(target.as_str()) {
                return Err(unknown(&step.id, target));
            }
        }
    }

    Ok(())
}

/// The closest existing id, if it is similar enough to look like a typo
fn closest_step_id(target: &str, step_ids: &HashSet<&str>) -> Option<String> {
    step_ids
        .iter()
        .map(|&id| (strsim::jaro_winkler(target, id), id))
        .filter(|(similarity, _)| *similarity >= SUGGESTION_SIMILARITY)
        .max_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, id)| id.to_string())
}

/// Conditional branch edges must not form a cycle: a condition step whose
/// branch transitively reaches itself would recurse forever
fn validate_branch_dag(definition: &WorkflowDefinition) -> Result<(), ValidationError> {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut node_indices = HashMap::new();

    for step in &definition.steps {
        let idx = graph.add_node(step.id.as_str());
        node_indices.insert(step.id.as_str(), idx);
    }

    for step in &definition.steps {
        let Some(&from_idx) = node_indices.get(step.id.as_str()) else {
            continue;
        };
        for target in &step.next_steps {
            if let Some(&to_idx) = node_indices.get(target.as_str()) {
                graph.add_edge(from_idx, to_idx, ());
            }
        }
    }

    if algo::is_cyclic_directed(&graph) {
        let sccs = algo::kosaraju_scc(&graph);
        let steps: Vec<String> = sccs
            .iter()
            .find(|scc| scc.len() > 1)
            .map(|scc| scc.iter().map(|&idx| graph[idx].to_string()).collect())
            .unwrap_or_else(|| {
                // Self-loop: a step listing itself in next_steps
                definition
                    .steps
                    .iter()
                    .filter(|s| s.next_steps.iter().any(|t| t == &s.id))
                    .map(|s| s.id.clone())
                    .collect()
            });

        return Err(ValidationError::BranchCycle { steps });
    }

    Ok(())
}

/// Each step kind needs its minimum config to be runnable
fn validate_step_config(definition: &WorkflowDefinition) -> Result<(), ValidationError> {
    let bad = |step: &str, message: &str| ValidationError::BadStepConfig {
        step: step.to_string(),
        message: message.to_string(),
    };

    for step in &definition.steps {
        let has_str = |key: &str| {
            step.config
                .resolve_path(key)
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty())
        };

        match step.kind {
            StepKind::Action => {
                if !has_str("action_type") {
                    return Err(bad(&step.id, "action step needs an action_type"));
                }
            }
            StepKind::Delay => {
                let delay = step.config.resolve_path("delay_ms").and_then(Value::as_i64);
                if !delay.is_some_and(|d| d > 0) {
                    return Err(bad(&step.id, "delay step needs a positive delay_ms"));
                }
            }
            StepKind::Script => {
                if !has_str("script") {
                    return Err(bad(&step.id, "script step needs a script body"));
                }
            }
            StepKind::Variable => {
                if !has_str("operation") {
                    return Err(bad(&step.id, "variable step needs an operation"));
                }
            }
            // Condition steps with no conditions are vacuously true
            StepKind::Condition => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use garrison_domain::StepConfig;

    fn definition(steps: serde_json::Value) -> WorkflowDefinition {
        serde_json::from_value(serde_json::json!({ "steps": steps })).unwrap()
    }

    fn action_step(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "type": "action",
            "config": { "action_type": "rcon_command", "command": "ping" }
        })
    }

    #[test]
    fn test_valid_definition() {
        let def = definition(serde_json::json!([action_step("a"), action_step("b")]));
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_duplicate_step_id() {
        let def = definition(serde_json::json!([action_step("a"), action_step("a")]));
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateStepId { ref id } if id == "a"));
    }

    #[test]
    fn test_goto_target_with_suggestion() {
        let mut def = definition(serde_json::json!([action_step("notify"), action_step("b")]));
        let step: &mut StepConfig = &mut def.steps[1];
        step.on_error = Some(
            serde_json::from_value(serde_json::json!({ "action": "goto", "goto_step": "notfy" }))
                .unwrap(),
        );

        let err = validate_definition(&def).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("unknown step 'notfy'"), "{rendered}");
        assert!(rendered.contains("did you mean 'notify'?"), "{rendered}");
    }

    #[test]
    fn test_no_suggestion_for_dissimilar_target() {
        let mut def = definition(serde_json::json!([action_step("notify"), action_step("b")]));
        def.steps[1].next_steps = vec!["zzzz".to_string()];

        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::UnknownStepReference { suggestion: None, .. }
        ));
    }

    #[test]
    fn test_missing_goto_target() {
        let mut def = definition(serde_json::json!([action_step("a")]));
        def.steps[0].on_error =
            Some(serde_json::from_value(serde_json::json!({ "action": "goto" })).unwrap());

        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, ValidationError::MissingGotoTarget { .. }));
    }

    #[test]
    fn test_branch_cycle_detection() {
        let def = definition(serde_json::json!([
            {
                "id": "a", "type": "condition",
                "config": { "conditions": [] },
                "next_steps": ["b"]
            },
            {
                "id": "b", "type": "condition",
                "config": { "conditions": [] },
                "next_steps": ["a"]
            }
        ]));
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_branch_self_loop() {
        let def = definition(serde_json::json!([
            {
                "id": "a", "type": "condition",
                "config": { "conditions": [] },
                "next_steps": ["a"]
            }
        ]));
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, ValidationError::BranchCycle { ref steps } if steps == &["a"]));
    }

    #[test]
    fn test_missing_action_type() {
        let def = definition(serde_json::json!([
            { "id": "a", "type": "action", "config": {} }
        ]));
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("action_type"));
    }

    #[test]
    fn test_delay_requires_positive_delay_ms() {
        let def = definition(serde_json::json!([
            { "id": "a", "type": "delay", "config": { "delay_ms": 0 } }
        ]));
        assert!(validate_definition(&def).is_err());

        let def = definition(serde_json::json!([
            { "id": "a", "type": "delay", "config": { "delay_ms": 50 } }
        ]));
        assert!(validate_definition(&def).is_ok());
    }
}
