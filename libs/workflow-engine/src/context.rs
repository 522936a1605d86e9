//! Per-execution mutable state
//!
//! One context per execution, owned and mutated only by the task driving
//! that execution. Step executors read and mutate it through the runner.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use garrison_domain::{ExecutionId, ServerId, Value, Workflow, WorkflowId};

use crate::template;

/// Mutable state threaded through one workflow execution
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Unique execution identifier
    pub execution_id: ExecutionId,

    /// Owning workflow
    pub workflow_id: WorkflowId,

    /// Server scope
    pub server_id: ServerId,

    /// Workflow name (for logs and metadata)
    pub workflow_name: String,

    /// Event type that triggered this execution
    pub trigger_event_type: String,

    /// Trigger event payload (map)
    pub trigger_event: Value,

    /// Execution variables
    pub variables: BTreeMap<String, Value>,

    /// Results of completed steps, keyed by step id
    pub step_results: BTreeMap<String, Value>,

    /// Read-only execution metadata populated at start
    pub metadata: Value,

    /// Index of the step currently executing
    pub current_step: usize,

    /// When the execution started
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Create a context for a fresh execution.
    ///
    /// `variables` should already have persisted workflow variables overlaid
    /// on the definition defaults.
    #[must_use]
    pub fn new(
        execution_id: ExecutionId,
        workflow: &Workflow,
        trigger_event_type: String,
        trigger_event: Value,
        variables: BTreeMap<String, Value>,
    ) -> Self {
        let started_at = Utc::now();

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "workflow_name".to_string(),
            Value::String(workflow.name.clone()),
        );
        metadata.insert(
            "workflow_id".to_string(),
            Value::String(workflow.id.to_string()),
        );
        metadata.insert(
            "server_id".to_string(),
            Value::String(workflow.server_id.to_string()),
        );
        metadata.insert(
            "execution_id".to_string(),
            Value::String(execution_id.to_string()),
        );
        metadata.insert(
            "started_at".to_string(),
            Value::String(started_at.to_rfc3339()),
        );

        Self {
            execution_id,
            workflow_id: workflow.id,
            server_id: workflow.server_id,
            workflow_name: workflow.name.clone(),
            trigger_event_type,
            trigger_event,
            variables,
            step_results: BTreeMap::new(),
            metadata: Value::Map(metadata),
            current_step: 0,
            started_at,
        }
    }

    /// Build the combined view used by templating and condition steps:
    /// variables at the top level plus the `trigger_event`, `metadata`, and
    /// `step_results` roots.
    #[must_use]
    pub fn combined_view(&self) -> Value {
        let mut view = self.variables.clone();
        view.insert("trigger_event".to_string(), self.trigger_event.clone());
        view.insert("metadata".to_string(), self.metadata.clone());
        view.insert(
            "step_results".to_string(),
            Value::Map(self.step_results.clone()),
        );
        Value::Map(view)
    }

    /// Render a template against the combined view
    #[must_use]
    pub fn render(&self, text: &str) -> String {
        template::render(text, &self.combined_view())
    }

    /// Variables as a map value (for logging snapshots)
    #[must_use]
    pub fn variables_value(&self) -> Value {
        Value::Map(self.variables.clone())
    }
}
