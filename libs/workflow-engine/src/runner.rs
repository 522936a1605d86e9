//! Step runner
//!
//! Drives a definition's step list in order, applying per-step and
//! workflow-level error policies (continue / stop / retry / goto), logging
//! every step-state transition, and maintaining the execution counters.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use garrison_domain::{
    ExecutionStatus, StepConfig, StepLog, StepStatus, Value, WorkflowDefinition,
};

use crate::context::ExecutionContext;
use crate::executor::{StepError, StepOutcome, StepRegistry, StepServices};

/// Runtime budget for goto transfers within one execution
const MAX_GOTO_HOPS: u32 = 100;

/// Runtime budget for nested conditional branch sub-runs
const MAX_BRANCH_DEPTH: u32 = 8;

// =============================================================================
// Report
// =============================================================================

/// Per-execution step counters
#[derive(Debug, Clone, Copy, Default)]
pub struct StepCounters {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Result of driving one execution to completion
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub counters: StepCounters,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

// =============================================================================
// Internal State
// =============================================================================

/// Where control flows after a step
enum StepFlow {
    Next,
    Goto(usize),
}

struct RunState {
    /// Strictly monotonic step_order counter for log rows
    order: u32,
    counters: StepCounters,
}

enum EffectivePolicy<'a> {
    Continue,
    Stop,
    Retry { max_retries: u32, delay_ms: u64 },
    Goto(&'a str),
}

// =============================================================================
// Runner
// =============================================================================

/// Drives step lists for the workflow manager
pub struct StepRunner {
    registry: Arc<StepRegistry>,
    services: StepServices,
}

impl StepRunner {
    /// Create a runner over a handler registry and host services
    #[must_use]
    pub fn new(registry: Arc<StepRegistry>, services: StepServices) -> Self {
        Self { registry, services }
    }

    /// Wait until the watch channel carries `true`, without holding the
    /// borrowed `Ref` across an await point (the `Ref` is not `Send`).
    async fn wait_for_cancel(cancel: &mut tokio::sync::watch::Receiver<bool>) {
        if *cancel.borrow() {
            return;
        }
        while cancel.changed().await.is_ok() {
            if *cancel.borrow() {
                return;
            }
        }
    }

    /// Execute a definition against a fresh context, returning the report.
    ///
    /// The caller persists the report into the execution record and summary.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        ctx: &mut ExecutionContext,
    ) -> RunReport {
        let started = Instant::now();
        let mut state = RunState {
            order: 0,
            counters: StepCounters {
                total: definition.steps.len() as u32,
                ..StepCounters::default()
            },
        };

        let mut idx = 0;
        let mut goto_hops = 0u32;
        let mut workflow_policy_only = false;
        let mut failure: Option<String> = None;

        while idx < definition.steps.len() {
            let step = &definition.steps[idx];
            ctx.current_step = idx;

            if self.services.is_cancelled() {
                failure = Some("execution cancelled".to_string());
                break;
            }

            if !step.enabled {
                self.log_skipped(ctx, step, &mut state).await;
                idx += 1;
                continue;
            }

            match self
                .run_step(definition, step, ctx, &mut state, workflow_policy_only, 0)
                .await
            {
                Ok(StepFlow::Next) => idx += 1,
                Ok(StepFlow::Goto(target)) => {
                    // Per-step handling no longer applies past the first goto
                    workflow_policy_only = true;
                    goto_hops += 1;
                    if goto_hops > MAX_GOTO_HOPS {
                        failure = Some(format!("goto hop budget exceeded ({MAX_GOTO_HOPS} hops)"));
                        break;
                    }
                    idx = target;
                }
                Err(message) => {
                    failure = Some(message);
                    break;
                }
            }
        }

        let status = if failure.is_some() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };

        RunReport {
            status,
            error_message: failure,
            counters: state.counters,
            duration_ms: started.elapsed().as_millis() as u64,
            completed_at: Utc::now(),
        }
    }

    /// Execute one step, applying its error policy. Boxed for branch recursion.
    fn run_step<'a>(
        &'a self,
        definition: &'a WorkflowDefinition,
        step: &'a StepConfig,
        ctx: &'a mut ExecutionContext,
        state: &'a mut RunState,
        workflow_policy_only: bool,
        depth: u32,
    ) -> Pin<Box<dyn Future<Output = Result<StepFlow, String>> + Send + 'a>> {
        Box::pin(async move {
            self.log_transition(ctx, step, state, StepStatus::Running, Value::Null, None, 0)
                .await;

            let started = Instant::now();
            let result = self.execute_once(step, ctx).await;
            let elapsed = started.elapsed();

            let error = match result {
                Ok(outcome) => {
                    return self
                        .complete_step(definition, step, ctx, state, outcome, elapsed, depth)
                        .await;
                }
                Err(e) => e,
            };

            if matches!(error, StepError::Cancelled) {
                self.fail_step(ctx, step, state, &error.to_string(), elapsed)
                    .await;
                return Err(error.to_string());
            }

            match self.effective_policy(definition, step, workflow_policy_only) {
                EffectivePolicy::Continue => {
                    self.fail_step(ctx, step, state, &error.to_string(), elapsed)
                        .await;
                    Ok(StepFlow::Next)
                }
                EffectivePolicy::Stop => {
                    self.fail_step(ctx, step, state, &error.to_string(), elapsed)
                        .await;
                    Err(error.to_string())
                }
                EffectivePolicy::Goto(target_id) => {
                    self.fail_step(ctx, step, state, &error.to_string(), elapsed)
                        .await;
                    if depth > 0 {
                        // A sub-run cannot transfer control in the parent list
                        tracing::warn!(step = %step.id, "goto inside a branch sub-run, stopping");
                        return Err(error.to_string());
                    }
                    definition
                        .steps
                        .iter()
                        .position(|s| s.id == target_id)
                        .map(StepFlow::Goto)
                        .ok_or_else(|| format!("goto target '{target_id}' not found"))
                }
                EffectivePolicy::Retry {
                    max_retries,
                    delay_ms,
                } => {
                    self.retry_step(
                        definition,
                        step,
                        ctx,
                        state,
                        error,
                        max_retries,
                        delay_ms,
                        depth,
                    )
                    .await
                }
            }
        })
    }

    /// Retry loop: up to `max_retries` further attempts, no delay before the
    /// first retry, RETRYING/RETRY_FAILED rows per attempt.
    #[allow(clippy::too_many_arguments)]
    async fn retry_step(
        &self,
        definition: &WorkflowDefinition,
        step: &StepConfig,
        ctx: &mut ExecutionContext,
        state: &mut RunState,
        mut last_error: StepError,
        max_retries: u32,
        delay_ms: u64,
        depth: u32,
    ) -> Result<StepFlow, String> {
        if !last_error.is_retryable() {
            self.fail_step(ctx, step, state, &last_error.to_string(), Duration::ZERO)
                .await;
            return Err(last_error.to_string());
        }

        for attempt in 1..=max_retries {
            if attempt > 1 {
                let mut cancel = self.services.cancel.clone();
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    () = Self::wait_for_cancel(&mut cancel) => {
                        let message = "execution cancelled".to_string();
                        self.fail_step(ctx, step, state, &message, Duration::ZERO).await;
                        return Err(message);
                    }
                }
            }

            self.log_transition(ctx, step, state, StepStatus::Retrying, Value::Null, None, 0)
                .await;

            let started = Instant::now();
            match self.execute_once(step, ctx).await {
                Ok(outcome) => {
                    return self
                        .complete_step(
                            definition,
                            step,
                            ctx,
                            state,
                            outcome,
                            started.elapsed(),
                            depth,
                        )
                        .await;
                }
                Err(e) => {
                    self.log_transition(
                        ctx,
                        step,
                        state,
                        StepStatus::RetryFailed,
                        Value::Null,
                        Some(e.to_string()),
                        started.elapsed().as_millis() as u64,
                    )
                    .await;

                    let retryable = e.is_retryable();
                    last_error = e;
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let message = format!("step failed after {max_retries} retries: {last_error}");
        self.fail_step(ctx, step, state, &message, Duration::ZERO)
            .await;
        Err(message)
    }

    /// Dispatch to the registered handler for the step kind
    async fn execute_once(
        &self,
        step: &StepConfig,
        ctx: &mut ExecutionContext,
    ) -> Result<StepOutcome, StepError> {
        let handler = self.registry.get(step.kind).ok_or_else(|| {
            StepError::InvalidConfig(format!("no handler for step kind '{}'", step.kind.as_str()))
        })?;
        handler.execute(step, ctx, &self.services).await
    }

    /// Record a successful step and run any conditional branch
    async fn complete_step(
        &self,
        definition: &WorkflowDefinition,
        step: &StepConfig,
        ctx: &mut ExecutionContext,
        state: &mut RunState,
        outcome: StepOutcome,
        elapsed: Duration,
        depth: u32,
    ) -> Result<StepFlow, String> {
        ctx.step_results
            .insert(step.id.clone(), outcome.output.clone());
        state.counters.completed += 1;
        self.log_transition(
            ctx,
            step,
            state,
            StepStatus::Completed,
            outcome.output.clone(),
            None,
            elapsed.as_millis() as u64,
        )
        .await;

        if outcome.branch.is_empty() {
            return Ok(StepFlow::Next);
        }

        if depth >= MAX_BRANCH_DEPTH {
            return Err(format!(
                "conditional branch depth budget exceeded ({MAX_BRANCH_DEPTH})"
            ));
        }

        for target_id in &outcome.branch {
            let Some(target) = definition.steps.iter().find(|s| &s.id == target_id) else {
                return Err(format!("next step '{target_id}' not found"));
            };

            if !target.enabled {
                self.log_skipped(ctx, target, state).await;
                continue;
            }

            let result = self
                .run_step(definition, target, ctx, state, false, depth + 1)
                .await;

            if let Err(branch_error) = result {
                if outcome.branch_tolerant {
                    tracing::warn!(step = %step.id, next_step = %target_id,
                        error = %branch_error, "tolerated branch step failure");
                } else {
                    return Err(format!("next step '{target_id}' failed: {branch_error}"));
                }
            }
        }

        Ok(StepFlow::Next)
    }

    /// Resolve which error policy applies to a failed step
    fn effective_policy<'a>(
        &self,
        definition: &'a WorkflowDefinition,
        step: &'a StepConfig,
        workflow_policy_only: bool,
    ) -> EffectivePolicy<'a> {
        if !workflow_policy_only {
            if let Some(policy) = &step.on_error {
                match policy.action.as_str() {
                    "continue" => return EffectivePolicy::Continue,
                    "stop" => return EffectivePolicy::Stop,
                    "retry" => {
                        return EffectivePolicy::Retry {
                            max_retries: policy.max_retries,
                            delay_ms: policy.retry_delay_ms,
                        }
                    }
                    "goto" => {
                        if let Some(target) = policy.goto_step.as_deref() {
                            return EffectivePolicy::Goto(target);
                        }
                    }
                    _ => {}
                }
            }
        }

        let handling = &definition.error_handling;
        match handling.default_action.as_str() {
            "continue" => EffectivePolicy::Continue,
            "retry" => EffectivePolicy::Retry {
                max_retries: handling.max_retries,
                delay_ms: handling.retry_delay_ms,
            },
            _ => EffectivePolicy::Stop,
        }
    }

    async fn fail_step(
        &self,
        ctx: &ExecutionContext,
        step: &StepConfig,
        state: &mut RunState,
        error: &str,
        elapsed: Duration,
    ) {
        state.counters.failed += 1;
        self.log_transition(
            ctx,
            step,
            state,
            StepStatus::Failed,
            Value::Null,
            Some(error.to_string()),
            elapsed.as_millis() as u64,
        )
        .await;
    }

    async fn log_skipped(&self, ctx: &ExecutionContext, step: &StepConfig, state: &mut RunState) {
        state.counters.skipped += 1;
        self.log_transition(ctx, step, state, StepStatus::Skipped, Value::Null, None, 0)
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_transition(
        &self,
        ctx: &ExecutionContext,
        step: &StepConfig,
        state: &mut RunState,
        step_status: StepStatus,
        step_output: Value,
        step_error: Option<String>,
        step_duration_ms: u64,
    ) {
        state.order += 1;
        let log = StepLog {
            execution_id: ctx.execution_id,
            workflow_id: ctx.workflow_id,
            server_id: ctx.server_id,
            event_time: Utc::now(),
            trigger_event_type: ctx.trigger_event_type.clone(),
            trigger_event_data: ctx.trigger_event.clone(),
            status: ExecutionStatus::Running,
            step_name: step.name.clone(),
            step_type: step.kind.as_str().to_string(),
            step_order: state.order,
            step_status,
            step_input: step.config.clone(),
            step_output,
            step_error,
            step_duration_ms,
            variables: ctx.variables_value(),
            metadata: ctx.metadata.clone(),
        };
        self.services.sink.step(&log).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::{context_with_event, harness, Harness};
    use garrison_domain::StepStatus;

    fn definition(json: serde_json::Value) -> WorkflowDefinition {
        serde_json::from_value(json).unwrap()
    }

    fn runner(h: &Harness) -> StepRunner {
        StepRunner::new(
            Arc::new(StepRegistry::with_builtins()),
            h.services.clone(),
        )
    }

    fn rcon_step(id: &str, command: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": id,
            "type": "action",
            "config": { "action_type": "rcon_command", "command": command }
        })
    }

    #[tokio::test]
    async fn test_linear_run_completes() {
        let h = harness();
        let def = definition(serde_json::json!({
            "steps": [rcon_step("a", "cmd_a"), rcon_step("b", "cmd_b")]
        }));
        let mut ctx = context_with_event(serde_json::json!({}));

        let report = runner(&h).run(&def, &mut ctx).await;

        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.counters.completed, 2);
        assert_eq!(report.counters.failed, 0);
        assert_eq!(h.rcon.commands(), vec!["cmd_a", "cmd_b"]);
        assert!(ctx.step_results.contains_key("a"));
    }

    #[tokio::test]
    async fn test_disabled_step_is_skipped() {
        let h = harness();
        let mut step_b = rcon_step("b", "cmd_b");
        step_b["enabled"] = serde_json::json!(false);
        let def = definition(serde_json::json!({
            "steps": [rcon_step("a", "cmd_a"), step_b]
        }));
        let mut ctx = context_with_event(serde_json::json!({}));

        let report = runner(&h).run(&def, &mut ctx).await;

        assert_eq!(report.counters.completed, 1);
        assert_eq!(report.counters.skipped, 1);
        assert_eq!(h.rcon.commands(), vec!["cmd_a"]);
        assert!(h
            .sink
            .steps()
            .iter()
            .any(|l| l.step_status == StepStatus::Skipped));
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let h = harness();
        // Initial attempt plus two retries all fail
        h.rcon.script_failures(3, "server offline");
        let mut step_a = rcon_step("a", "cmd_a");
        step_a["on_error"] = serde_json::json!({
            "action": "retry", "max_retries": 2, "retry_delay": 10
        });
        let def = definition(serde_json::json!({ "steps": [step_a] }));
        let mut ctx = context_with_event(serde_json::json!({}));

        let report = runner(&h).run(&def, &mut ctx).await;

        assert_eq!(report.status, ExecutionStatus::Failed);
        let message = report.error_message.unwrap();
        assert!(message.contains("step failed after 2 retries:"), "{message}");

        let logs = h.sink.steps();
        let running = logs
            .iter()
            .filter(|l| l.step_status == StepStatus::Running)
            .count();
        let retrying = logs
            .iter()
            .filter(|l| l.step_status == StepStatus::Retrying)
            .count();
        let retry_failed = logs
            .iter()
            .filter(|l| l.step_status == StepStatus::RetryFailed)
            .count();
        assert_eq!(running, 1);
        assert_eq!(retrying, 2);
        assert_eq!(retry_failed, 2);
    }

    #[tokio::test]
    async fn test_retry_succeeds_midway() {
        let h = harness();
        h.rcon.script_failures(1, "blip");
        let mut step_a = rcon_step("a", "cmd_a");
        step_a["on_error"] = serde_json::json!({
            "action": "retry", "max_retries": 3, "retry_delay": 5
        });
        let def = definition(serde_json::json!({ "steps": [step_a, rcon_step("b", "cmd_b")] }));
        let mut ctx = context_with_event(serde_json::json!({}));

        let report = runner(&h).run(&def, &mut ctx).await;

        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.counters.completed, 2);
        assert_eq!(report.counters.failed, 0);
        assert_eq!(h.rcon.commands(), vec!["cmd_a", "cmd_a", "cmd_b"]);
    }

    #[tokio::test]
    async fn test_goto_on_failure() {
        let h = harness();
        h.rcon.script_failures(1, "boom");
        let mut step_a = rcon_step("a", "cmd_a");
        step_a["on_error"] = serde_json::json!({ "action": "goto", "goto_step": "c" });
        let def = definition(serde_json::json!({
            "steps": [step_a, rcon_step("b", "cmd_b"), rcon_step("c", "cmd_c")]
        }));
        let mut ctx = context_with_event(serde_json::json!({}));

        let report = runner(&h).run(&def, &mut ctx).await;

        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.counters.completed, 1);
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.counters.skipped, 0);
        assert_eq!(h.rcon.commands(), vec!["cmd_a", "cmd_c"]);
    }

    /// Minimal HTTP endpoint that answers every request with 500
    async fn spawn_failing_endpoint() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 500 Internal Server Error\r\n\
                              content-length: 0\r\nconnection: close\r\n\r\n",
                        )
                        .await;
                });
            }
        });
        format!("http://{addr}/hook")
    }

    #[tokio::test]
    async fn test_http_retry_exhaustion_against_500_endpoint() {
        let h = harness();
        let url = spawn_failing_endpoint().await;
        let def = definition(serde_json::json!({
            "steps": [{
                "id": "notify", "name": "notify", "type": "action",
                "config": {
                    "action_type": "http_request",
                    "url": url,
                    "method": "POST",
                    "fail_on_error": true
                },
                "on_error": { "action": "retry", "max_retries": 2, "retry_delay": 10 }
            }]
        }));
        let mut ctx = context_with_event(serde_json::json!({}));

        let report = runner(&h).run(&def, &mut ctx).await;

        assert_eq!(report.status, ExecutionStatus::Failed);
        let message = report.error_message.unwrap();
        assert!(message.contains("step failed after 2 retries:"), "{message}");
        assert!(message.contains("500"), "{message}");

        let logs = h.sink.steps();
        assert_eq!(
            logs.iter()
                .filter(|l| l.step_status == StepStatus::Running)
                .count(),
            1
        );
        assert_eq!(
            logs.iter()
                .filter(|l| l.step_status == StepStatus::Retrying)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_goto_switches_to_workflow_policy() {
        let h = harness();
        // a fails (goto c), then c fails; c's own continue policy must be
        // ignored after the goto, so the workflow default (stop) applies
        h.rcon.script_failures(1, "boom_a");
        let mut step_a = rcon_step("a", "cmd_a");
        step_a["on_error"] = serde_json::json!({ "action": "goto", "goto_step": "c" });
        let mut step_c = rcon_step("c", "cmd_c");
        step_c["on_error"] = serde_json::json!({ "action": "continue" });
        let def = definition(serde_json::json!({
            "steps": [step_a, rcon_step("b", "cmd_b"), step_c, rcon_step("d", "cmd_d")]
        }));
        h.rcon.script_failures(1, "boom_c");
        // First scripted failure hits cmd_a, second hits cmd_c

        let mut ctx = context_with_event(serde_json::json!({}));
        let report = runner(&h).run(&def, &mut ctx).await;

        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(h.rcon.commands(), vec!["cmd_a", "cmd_c"]);
    }

    #[tokio::test]
    async fn test_continue_policy_moves_on() {
        let h = harness();
        h.rcon.script_failures(1, "boom");
        let mut step_a = rcon_step("a", "cmd_a");
        step_a["on_error"] = serde_json::json!({ "action": "continue" });
        let def = definition(serde_json::json!({ "steps": [step_a, rcon_step("b", "cmd_b")] }));
        let mut ctx = context_with_event(serde_json::json!({}));

        let report = runner(&h).run(&def, &mut ctx).await;

        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.counters.failed, 1);
        assert_eq!(report.counters.completed, 1);
        assert_eq!(h.rcon.commands(), vec!["cmd_a", "cmd_b"]);
    }

    #[tokio::test]
    async fn test_workflow_default_is_stop() {
        let h = harness();
        h.rcon.script_failures(1, "boom");
        let def = definition(serde_json::json!({
            "steps": [rcon_step("a", "cmd_a"), rcon_step("b", "cmd_b")]
        }));
        let mut ctx = context_with_event(serde_json::json!({}));

        let report = runner(&h).run(&def, &mut ctx).await;

        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(h.rcon.commands(), vec!["cmd_a"]);
        // b was never visited, so it is not counted as skipped
        assert_eq!(report.counters.skipped, 0);
        assert!(
            report.counters.completed + report.counters.failed + report.counters.skipped
                < report.counters.total
        );
    }

    #[tokio::test]
    async fn test_unknown_per_step_action_falls_back_to_workflow_policy() {
        let h = harness();
        h.rcon.script_failures(1, "boom");
        let mut step_a = rcon_step("a", "cmd_a");
        step_a["on_error"] = serde_json::json!({ "action": "shrug" });
        let def = definition(serde_json::json!({
            "error_handling": { "default_action": "continue" },
            "steps": [step_a, rcon_step("b", "cmd_b")]
        }));
        let mut ctx = context_with_event(serde_json::json!({}));

        let report = runner(&h).run(&def, &mut ctx).await;
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(h.rcon.commands(), vec!["cmd_a", "cmd_b"]);
    }

    #[tokio::test]
    async fn test_conditional_branch_runs_target_once() {
        let h = harness();
        let def = definition(serde_json::json!({
            "steps": [
                {
                    "id": "gate", "name": "gate", "type": "condition",
                    "config": {
                        "logic": "OR",
                        "conditions": [
                            { "field": "trigger_event.player.level", "operator": "greater_than", "value": 10 },
                            { "field": "trigger_event.player.vip", "operator": "equals", "value": true }
                        ],
                        "skip_on_false": true
                    },
                    "next_steps": ["reward"]
                },
                {
                    "id": "reward", "name": "reward", "type": "action", "enabled": false,
                    "config": { "action_type": "rcon_command", "command": "GiveItem" }
                }
            ]
        }));

        // reward is disabled in the main list; enable it for the branch case
        let mut def_enabled = def.clone();
        def_enabled.steps[1].enabled = true;

        // vip=true: reward runs via the branch, then again in the main list
        let mut ctx = context_with_event(serde_json::json!({ "player": { "level": 5, "vip": true } }));
        let report = runner(&h).run(&def_enabled, &mut ctx).await;
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(h.rcon.commands(), vec!["GiveItem", "GiveItem"]);

        // vip=false, level low: branch not taken
        let h2 = harness();
        let mut ctx = context_with_event(serde_json::json!({ "player": { "level": 5, "vip": false } }));
        let report = runner(&h2).run(&def, &mut ctx).await;
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert!(h2.rcon.commands().is_empty());
    }

    #[tokio::test]
    async fn test_branch_failure_aborts_unless_tolerant() {
        let base = serde_json::json!({
            "steps": [
                {
                    "id": "gate", "name": "gate", "type": "condition",
                    "config": { "conditions": [], "skip_on_false": true },
                    "next_steps": ["poke"]
                },
                {
                    "id": "poke", "name": "poke", "type": "action", "enabled": false,
                    "config": { "action_type": "rcon_command", "command": "Poke" }
                }
            ]
        });

        // Intolerant: branch failure fails the execution
        let h = harness();
        let mut def = definition(base.clone());
        def.steps[1].enabled = true;
        h.rcon.script_failures(1, "offline");
        let mut ctx = context_with_event(serde_json::json!({}));
        let report = runner(&h).run(&def, &mut ctx).await;
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert!(report.error_message.unwrap().contains("poke"));

        // Tolerant: execution completes despite the branch failure
        let h = harness();
        let mut def = definition(base);
        def.steps[1].enabled = true;
        def.steps[0].config = Value::from_json(serde_json::json!({
            "conditions": [], "skip_on_false": true, "continue_on_next_step_error": true
        }));
        h.rcon.script_failures(1, "offline");
        let mut ctx = context_with_event(serde_json::json!({}));
        let report = runner(&h).run(&def, &mut ctx).await;
        assert_eq!(report.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_step_order_is_strictly_monotonic() {
        let h = harness();
        h.rcon.script_failures(2, "blip");
        let mut step_a = rcon_step("a", "cmd_a");
        step_a["on_error"] = serde_json::json!({
            "action": "retry", "max_retries": 2, "retry_delay": 1
        });
        let def = definition(serde_json::json!({ "steps": [step_a, rcon_step("b", "cmd_b")] }));
        let mut ctx = context_with_event(serde_json::json!({}));

        runner(&h).run(&def, &mut ctx).await;

        let orders: Vec<u32> = h.sink.steps().iter().map(|l| l.step_order).collect();
        let mut sorted = orders.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(orders, sorted, "step_order must be strictly increasing");
    }

    #[tokio::test]
    async fn test_step_durations_fit_total() {
        let h = harness();
        let def = definition(serde_json::json!({
            "steps": [
                { "id": "wait", "name": "wait", "type": "delay", "config": { "delay_ms": 20 } }
            ]
        }));
        let mut ctx = context_with_event(serde_json::json!({}));

        let report = runner(&h).run(&def, &mut ctx).await;

        let step_total: u64 = h.sink.steps().iter().map(|l| l.step_duration_ms).sum();
        assert!(step_total <= report.duration_ms);
    }
}
