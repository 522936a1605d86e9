//! Delay step handler
//!
//! Blocks the execution for `delay_ms`, waking early on cancellation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use garrison_domain::{StepConfig, StepKind, Value};

use crate::context::ExecutionContext;

use super::{StepError, StepHandler, StepOutcome, StepServices};

/// Handler for `delay` steps
pub struct DelayStepHandler;

#[async_trait]
impl StepHandler for DelayStepHandler {
    async fn execute(
        &self,
        step: &StepConfig,
        _ctx: &mut ExecutionContext,
        services: &StepServices,
    ) -> Result<StepOutcome, StepError> {
        let delay_ms = step
            .config
            .resolve_path("delay_ms")
            .and_then(Value::as_i64)
            .filter(|ms| *ms > 0)
            .ok_or_else(|| {
                StepError::InvalidConfig("missing or non-positive 'delay_ms'".to_string())
            })?;

        let mut cancel = services.cancel.clone();
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(delay_ms as u64)) => {}
            _ = cancel.wait_for(|cancelled| *cancelled) => return Err(StepError::Cancelled),
        }

        let mut output = BTreeMap::new();
        output.insert("delayed_ms".to_string(), Value::Int(delay_ms));
        Ok(StepOutcome::output(Value::Map(output)))
    }

    fn kind(&self) -> StepKind {
        StepKind::Delay
    }
}
