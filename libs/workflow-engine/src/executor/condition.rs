//! Condition step handler
//!
//! Evaluates configured conditions over the combined context view. On a
//! match the runner executes the step's `next_steps` as sub-runs; on a miss
//! the step either completes quietly (`skip_on_false`) or fails.

use std::collections::BTreeMap;

use async_trait::async_trait;

use garrison_domain::{ConditionConfig, StepConfig, StepKind, Value};

use crate::condition::{evaluate_conditions, ConditionLogic};
use crate::context::ExecutionContext;

use super::{cfg_flag, cfg_str, StepError, StepHandler, StepOutcome, StepServices};

/// Handler for `condition` steps
pub struct ConditionStepHandler;

#[async_trait]
impl StepHandler for ConditionStepHandler {
    async fn execute(
        &self,
        step: &StepConfig,
        ctx: &mut ExecutionContext,
        _services: &StepServices,
    ) -> Result<StepOutcome, StepError> {
        let conditions = parse_conditions(&step.config)?;
        let logic = cfg_str(&step.config, "logic")
            .map_or(ConditionLogic::And, |s| ConditionLogic::parse(&s));

        let matched = evaluate_conditions(&conditions, &ctx.combined_view(), logic);

        let mut output = BTreeMap::new();
        output.insert("matched".to_string(), Value::Bool(matched));
        output.insert(
            "conditions_evaluated".to_string(),
            Value::Int(conditions.len() as i64),
        );

        if matched {
            return Ok(StepOutcome {
                output: Value::Map(output),
                branch: step.next_steps.clone(),
                branch_tolerant: cfg_flag(&step.config, "continue_on_next_step_error"),
            });
        }

        if cfg_flag(&step.config, "skip_on_false") {
            return Ok(StepOutcome::output(Value::Map(output)));
        }

        Err(StepError::ActionFailed("conditions not met".to_string()))
    }

    fn kind(&self) -> StepKind {
        StepKind::Condition
    }
}

fn parse_conditions(config: &Value) -> Result<Vec<ConditionConfig>, StepError> {
    match config.resolve_path("conditions") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.to_json())
            .map_err(|e| StepError::InvalidConfig(format!("invalid conditions: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context_with_event, harness, step};
    use super::*;

    fn condition_step(config: serde_json::Value, next_steps: Vec<&str>) -> StepConfig {
        let mut step = step("condition", config);
        step.next_steps = next_steps.into_iter().map(String::from).collect();
        step
    }

    #[tokio::test]
    async fn test_match_exposes_branch() {
        let h = harness();
        let mut ctx = context_with_event(serde_json::json!({
            "player": { "level": 5, "vip": true }
        }));
        let step = condition_step(
            serde_json::json!({
                "logic": "OR",
                "conditions": [
                    { "field": "trigger_event.player.level", "operator": "greater_than", "value": 10 },
                    { "field": "trigger_event.player.vip", "operator": "equals", "value": true }
                ],
                "skip_on_false": true
            }),
            vec!["reward"],
        );

        let outcome = ConditionStepHandler
            .execute(&step, &mut ctx, &h.services)
            .await
            .unwrap();
        assert_eq!(outcome.branch, vec!["reward"]);
        assert_eq!(
            outcome.output.resolve_path("matched"),
            Some(&Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn test_miss_with_skip_on_false_completes() {
        let h = harness();
        let mut ctx = context_with_event(serde_json::json!({
            "player": { "level": 5, "vip": false }
        }));
        let step = condition_step(
            serde_json::json!({
                "logic": "OR",
                "conditions": [
                    { "field": "trigger_event.player.level", "operator": "greater_than", "value": 10 },
                    { "field": "trigger_event.player.vip", "operator": "equals", "value": true }
                ],
                "skip_on_false": true
            }),
            vec!["reward"],
        );

        let outcome = ConditionStepHandler
            .execute(&step, &mut ctx, &h.services)
            .await
            .unwrap();
        assert!(outcome.branch.is_empty());
        assert_eq!(
            outcome.output.resolve_path("matched"),
            Some(&Value::Bool(false))
        );
    }

    #[tokio::test]
    async fn test_miss_without_skip_fails() {
        let h = harness();
        let mut ctx = context_with_event(serde_json::json!({ "player": { "level": 1 } }));
        let step = condition_step(
            serde_json::json!({
                "conditions": [
                    { "field": "trigger_event.player.level", "operator": "greater_than", "value": 10 }
                ]
            }),
            vec![],
        );

        let err = ConditionStepHandler
            .execute(&step, &mut ctx, &h.services)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("conditions not met"));
    }

    #[tokio::test]
    async fn test_conditions_see_variables_and_step_results() {
        let h = harness();
        let mut ctx = context_with_event(serde_json::json!({}));
        ctx.variables
            .insert("strikes".to_string(), Value::Int(3));
        ctx.step_results.insert(
            "lookup".to_string(),
            Value::from_json(serde_json::json!({ "banned": false })),
        );

        let step = condition_step(
            serde_json::json!({
                "conditions": [
                    { "field": "strikes", "operator": "greater_or_equal", "value": 3 },
                    { "field": "step_results.lookup.banned", "operator": "equals", "value": false }
                ]
            }),
            vec![],
        );

        let outcome = ConditionStepHandler
            .execute(&step, &mut ctx, &h.services)
            .await
            .unwrap();
        assert_eq!(
            outcome.output.resolve_path("matched"),
            Some(&Value::Bool(true))
        );
    }
}
