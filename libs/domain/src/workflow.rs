//! Workflow definition types
//!
//! These types are deserialized from the JSON definition stored alongside
//! each workflow row. The store treats the definition as opaque JSONB; the
//! engine parses it into these types before execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{ServerId, TriggerId, WorkflowId};
use crate::value::Value;

// =============================================================================
// Workflow Record
// =============================================================================

/// A stored workflow: a named, server-scoped bundle of triggers and steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier
    pub id: WorkflowId,

    /// The server this workflow is scoped to
    pub server_id: ServerId,

    /// Human-readable workflow name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Whether the workflow participates in event matching
    pub enabled: bool,

    /// Parsed definition (stored as opaque JSON)
    pub definition: WorkflowDefinition,

    /// User who created the workflow
    pub created_by: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Definition
// =============================================================================

/// Root workflow definition parsed from JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkflowDefinition {
    /// Definition format version (e.g. "1.0")
    #[serde(default = "default_version")]
    pub version: String,

    /// Triggers that start an execution when matched
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,

    /// Default variable values for every execution
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,

    /// Ordered step list
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Workflow-level error handling
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

// =============================================================================
// Triggers & Conditions
// =============================================================================

/// A trigger: event type plus conditions over the event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TriggerConfig {
    /// Unique trigger identifier
    #[serde(default)]
    pub id: TriggerId,

    /// Human-readable trigger name
    #[serde(default)]
    pub name: String,

    /// Event type this trigger binds to
    pub event_type: String,

    /// Whether this trigger is active
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Conditions over the event payload (all must hold)
    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,
}

/// One field/operator/value predicate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConditionConfig {
    /// Dot-separated field path
    pub field: String,

    /// Operator name; unknown operators evaluate to false at runtime
    pub operator: String,

    /// Right-hand comparison value
    #[serde(default)]
    pub value: Value,

    /// Optional value-type hint retained from the editor
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
}

// =============================================================================
// Steps
// =============================================================================

/// Kind of work a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Action,
    Condition,
    Variable,
    Delay,
    Script,
}

impl StepKind {
    /// Lowercase tag used in execution logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Condition => "condition",
            Self::Variable => "variable",
            Self::Delay => "delay",
            Self::Script => "script",
        }
    }
}

/// One unit of work in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StepConfig {
    /// Unique step identifier within the workflow
    pub id: String,

    /// Human-readable step name
    #[serde(default)]
    pub name: String,

    /// Step kind
    #[serde(rename = "type")]
    pub kind: StepKind,

    /// Disabled steps are skipped
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Kind-specific configuration map
    #[serde(default = "Value::empty_map")]
    pub config: Value,

    /// Per-step error handling; falls back to workflow-level handling
    #[serde(default)]
    pub on_error: Option<StepErrorPolicy>,

    /// Steps executed as sub-runs when a condition step matches
    #[serde(default)]
    pub next_steps: Vec<String>,
}

// =============================================================================
// Error Handling
// =============================================================================

/// Per-step error policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StepErrorPolicy {
    /// One of `continue`, `stop`, `retry`, `goto`; anything else falls back
    /// to the workflow-level policy
    pub action: String,

    /// Maximum retry attempts after the initial failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in milliseconds
    #[serde(default = "default_retry_delay_ms", rename = "retry_delay")]
    pub retry_delay_ms: u64,

    /// Target step for the `goto` action
    #[serde(default)]
    pub goto_step: Option<String>,
}

/// Workflow-level error handling defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ErrorHandlingConfig {
    /// One of `continue`, `stop`, `retry`
    #[serde(default = "default_stop")]
    pub default_action: String,

    /// Maximum retry attempts for the workflow-level `retry` action
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            default_action: default_stop(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_stop() -> String {
    "stop".to_string()
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    1000
}
