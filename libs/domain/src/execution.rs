//! Execution records, step logs, summaries, persisted variables, and KV entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{ExecutionId, ServerId, WorkflowId};
use crate::value::Value;

// =============================================================================
// Statuses
// =============================================================================

/// Lifecycle status of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    /// Tag used at the database boundary
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// Status of one step-state transition in the execution log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
    Retrying,
    RetryFailed,
    Skipped,
}

impl StepStatus {
    /// Tag used at the database boundary
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
            Self::RetryFailed => "RETRY_FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

// =============================================================================
// Execution Record (definition store)
// =============================================================================

/// Transactional record of one execution's lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Row identifier
    pub id: Uuid,

    /// Owning workflow
    pub workflow_id: WorkflowId,

    /// The execution this record tracks
    pub execution_id: ExecutionId,

    /// Current status
    pub status: ExecutionStatus,

    /// When the execution started
    pub started_at: DateTime<Utc>,

    /// When the execution finished (if it has)
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Last error message for failed executions
    #[serde(default)]
    pub error_message: Option<String>,
}

// =============================================================================
// Step Log (analytics store, append-only)
// =============================================================================

/// One step-state transition appended to the analytics store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLog {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub server_id: ServerId,
    pub event_time: DateTime<Utc>,
    pub trigger_event_type: String,
    pub trigger_event_data: Value,
    pub status: ExecutionStatus,
    pub step_name: String,
    pub step_type: String,
    pub step_order: u32,
    pub step_status: StepStatus,
    pub step_input: Value,
    pub step_output: Value,
    #[serde(default)]
    pub step_error: Option<String>,
    pub step_duration_ms: u64,
    pub variables: Value,
    pub metadata: Value,
}

// =============================================================================
// Execution Summary (analytics store, upserted)
// =============================================================================

/// Rolled-up per-execution counters, upserted at completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub server_id: ServerId,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    pub skipped_steps: u32,
    pub total_duration_ms: u64,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

// =============================================================================
// Persisted Variables & KV
// =============================================================================

/// A persisted per-workflow variable, overlaid on definition defaults
/// at execution start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVariable {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry in the workflow-scoped persistent key-value store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvEntry {
    pub workflow_id: WorkflowId,
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_tags() {
        assert_eq!(ExecutionStatus::Running.as_str(), "RUNNING");
        assert_eq!(StepStatus::RetryFailed.as_str(), "RETRY_FAILED");
        assert_eq!(
            serde_json::to_string(&StepStatus::Skipped).unwrap(),
            "\"SKIPPED\""
        );
    }
}
