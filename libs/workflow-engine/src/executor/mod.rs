//! Step executors
//!
//! One handler per step kind, dispatched from a registry keyed by the kind
//! tag. Handlers share a narrow services struct (RCON, HTTP, KV, analytics,
//! cancellation) and mutate the execution context passed in by the runner.

pub mod action;
pub mod condition;
pub mod delay;
pub mod script;
pub mod variable;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use garrison_db::KvRepository;
use garrison_domain::{StepConfig, StepKind, Value};

use crate::analytics::SinkLogger;
use crate::context::ExecutionContext;
use crate::rcon::RconClient;

// =============================================================================
// Errors
// =============================================================================

/// Errors a step can fail with
#[derive(Debug, Error)]
pub enum StepError {
    /// Malformed step config, unknown action/operation/transform
    #[error("invalid step config: {0}")]
    InvalidConfig(String),

    /// Transient external failure (RCON, HTTP, webhook); retry-eligible
    #[error("{0}")]
    ActionFailed(String),

    /// Wall-clock timeout; never retried
    #[error("{0}")]
    TimedOut(String),

    /// Execution cancelled; never retried
    #[error("execution cancelled")]
    Cancelled,

    /// Script compilation or runtime failure
    #[error("script error: {0}")]
    Script(String),

    /// Definition-store failure surfaced mid-execution
    #[error("store error: {0}")]
    Store(String),
}

impl StepError {
    /// Whether retry policies apply to this failure
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::TimedOut(_) | Self::Cancelled)
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Successful result of one step execution
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// Value stored into `step_results[step.id]`
    pub output: Value,

    /// Steps to execute as sub-runs (condition steps only)
    pub branch: Vec<String>,

    /// Whether a failing branch step is tolerated
    pub branch_tolerant: bool,
}

impl StepOutcome {
    /// Outcome with just an output value
    #[must_use]
    pub fn output(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }
}

// =============================================================================
// Services
// =============================================================================

/// Host services shared by all step handlers
#[derive(Clone)]
pub struct StepServices {
    /// RCON client for the managed servers
    pub rcon: Arc<dyn RconClient>,

    /// HTTP client (30 s timeout configured at construction)
    pub http: reqwest::Client,

    /// Workflow-scoped KV store (script host only)
    pub kv: Arc<dyn KvRepository>,

    /// Analytics sink wrapper
    pub sink: SinkLogger,

    /// Root cancellation signal; true once shutdown begins
    pub cancel: watch::Receiver<bool>,
}

impl StepServices {
    /// Whether cancellation has been signalled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

// =============================================================================
// Handler Trait & Registry
// =============================================================================

/// Trait for step handlers
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Execute the step against the context
    async fn execute(
        &self,
        step: &StepConfig,
        ctx: &mut ExecutionContext,
        services: &StepServices,
    ) -> Result<StepOutcome, StepError>;

    /// The step kind this handler serves
    fn kind(&self) -> StepKind;
}

/// Registry of step handlers keyed by kind
pub struct StepRegistry {
    handlers: HashMap<StepKind, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    /// Create a registry with all built-in handlers
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register(Arc::new(action::ActionStepHandler));
        registry.register(Arc::new(condition::ConditionStepHandler));
        registry.register(Arc::new(variable::VariableStepHandler));
        registry.register(Arc::new(delay::DelayStepHandler));
        registry.register(Arc::new(script::ScriptStepHandler));
        registry
    }

    /// Register a handler under its kind
    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    /// Look up the handler for a step kind
    #[must_use]
    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&kind).cloned()
    }
}

// =============================================================================
// Config Helpers
// =============================================================================

/// Fetch a raw string field from a step config map
#[must_use]
pub(crate) fn cfg_str(config: &Value, key: &str) -> Option<String> {
    config
        .resolve_path(key)
        .map(garrison_domain::Value::canonical_string)
        .filter(|s| !s.is_empty())
}

/// Fetch a required, template-rendered string field
pub(crate) fn cfg_rendered(
    config: &Value,
    key: &str,
    ctx: &ExecutionContext,
) -> Result<String, StepError> {
    cfg_str(config, key)
        .map(|raw| ctx.render(&raw))
        .ok_or_else(|| StepError::InvalidConfig(format!("missing required field '{key}'")))
}

/// Fetch an optional, template-rendered string field
#[must_use]
pub(crate) fn cfg_rendered_opt(config: &Value, key: &str, ctx: &ExecutionContext) -> Option<String> {
    cfg_str(config, key).map(|raw| ctx.render(&raw))
}

/// Fetch a truthy flag
#[must_use]
pub(crate) fn cfg_flag(config: &Value, key: &str) -> bool {
    config.resolve_path(key).is_some_and(Value::truthy)
}
