//! Execution logging to the analytics store
//!
//! Append-only step and message rows plus one upserted summary row per
//! execution. Sink failures never fail an execution: the `SinkLogger`
//! wrapper logs them at error level and drops them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use garrison_domain::{ExecutionId, ExecutionSummary, StepLog, WorkflowId};

// =============================================================================
// Errors
// =============================================================================

/// Analytics store errors
#[derive(Debug, Error)]
pub enum SinkError {
    /// Database error
    #[error("analytics database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for SinkError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// =============================================================================
// Sink Trait
// =============================================================================

/// Write interface of the analytics store
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    /// Append one step-state transition row
    async fn append_step(&self, log: &StepLog) -> Result<(), SinkError>;

    /// Append one free-form execution message (log_message steps, scripts)
    async fn append_message(
        &self,
        execution_id: &ExecutionId,
        workflow_id: &WorkflowId,
        level: &str,
        message: &str,
    ) -> Result<(), SinkError>;

    /// Insert or update the per-execution summary row
    async fn upsert_summary(&self, summary: &ExecutionSummary) -> Result<(), SinkError>;
}

// =============================================================================
// PostgreSQL Sink
// =============================================================================

/// PostgreSQL-backed analytics sink
pub struct PgExecutionSink {
    pool: PgPool,
}

impl PgExecutionSink {
    /// Create a new PostgreSQL sink
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionSink for PgExecutionSink {
    async fn append_step(&self, log: &StepLog) -> Result<(), SinkError> {
        sqlx::query(
            r"
            INSERT INTO workflow_execution_logs (
                execution_id, workflow_id, server_id, event_time,
                trigger_event_type, trigger_event_data, status,
                step_name, step_type, step_order, step_status,
                step_input, step_output, step_error, step_duration_ms,
                variables, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ",
        )
        .bind(log.execution_id.as_uuid())
        .bind(log.workflow_id.as_uuid())
        .bind(log.server_id.as_uuid())
        .bind(log.event_time)
        .bind(&log.trigger_event_type)
        .bind(log.trigger_event_data.to_json())
        .bind(log.status.as_str())
        .bind(&log.step_name)
        .bind(&log.step_type)
        .bind(i64::from(log.step_order))
        .bind(log.step_status.as_str())
        .bind(log.step_input.to_json())
        .bind(log.step_output.to_json())
        .bind(&log.step_error)
        .bind(i64::try_from(log.step_duration_ms).unwrap_or(i64::MAX))
        .bind(log.variables.to_json())
        .bind(log.metadata.to_json())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_message(
        &self,
        execution_id: &ExecutionId,
        workflow_id: &WorkflowId,
        level: &str,
        message: &str,
    ) -> Result<(), SinkError> {
        sqlx::query(
            r"
            INSERT INTO workflow_execution_messages (execution_id, workflow_id, level, message)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(execution_id.as_uuid())
        .bind(workflow_id.as_uuid())
        .bind(level)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_summary(&self, summary: &ExecutionSummary) -> Result<(), SinkError> {
        sqlx::query(
            r"
            INSERT INTO workflow_execution_summaries (
                execution_id, workflow_id, server_id,
                total_steps, completed_steps, failed_steps, skipped_steps,
                total_duration_ms, status, error_message, started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (execution_id) DO UPDATE SET
                total_steps = EXCLUDED.total_steps,
                completed_steps = EXCLUDED.completed_steps,
                failed_steps = EXCLUDED.failed_steps,
                skipped_steps = EXCLUDED.skipped_steps,
                total_duration_ms = EXCLUDED.total_duration_ms,
                status = EXCLUDED.status,
                error_message = EXCLUDED.error_message,
                completed_at = EXCLUDED.completed_at
            ",
        )
        .bind(summary.execution_id.as_uuid())
        .bind(summary.workflow_id.as_uuid())
        .bind(summary.server_id.as_uuid())
        .bind(i64::from(summary.total_steps))
        .bind(i64::from(summary.completed_steps))
        .bind(i64::from(summary.failed_steps))
        .bind(i64::from(summary.skipped_steps))
        .bind(i64::try_from(summary.total_duration_ms).unwrap_or(i64::MAX))
        .bind(summary.status.as_str())
        .bind(&summary.error_message)
        .bind(summary.started_at)
        .bind(summary.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// In-Memory Sink
// =============================================================================

/// In-memory sink for development and testing
#[derive(Default)]
pub struct MemoryExecutionSink {
    steps: Mutex<Vec<StepLog>>,
    messages: Mutex<Vec<(ExecutionId, String, String)>>,
    summaries: Mutex<HashMap<ExecutionId, ExecutionSummary>>,
}

impl MemoryExecutionSink {
    /// Create a new empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All step rows appended so far
    #[must_use]
    pub fn steps(&self) -> Vec<StepLog> {
        self.steps.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// All messages appended so far as `(execution_id, level, message)`
    #[must_use]
    pub fn messages(&self) -> Vec<(ExecutionId, String, String)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// The summary for an execution, if one was written
    #[must_use]
    pub fn summary(&self, execution_id: &ExecutionId) -> Option<ExecutionSummary> {
        self.summaries
            .lock()
            .ok()
            .and_then(|s| s.get(execution_id).cloned())
    }
}

#[async_trait]
impl ExecutionSink for MemoryExecutionSink {
    async fn append_step(&self, log: &StepLog) -> Result<(), SinkError> {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push(log.clone());
        }
        Ok(())
    }

    async fn append_message(
        &self,
        execution_id: &ExecutionId,
        _workflow_id: &WorkflowId,
        level: &str,
        message: &str,
    ) -> Result<(), SinkError> {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((*execution_id, level.to_string(), message.to_string()));
        }
        Ok(())
    }

    async fn upsert_summary(&self, summary: &ExecutionSummary) -> Result<(), SinkError> {
        if let Ok(mut summaries) = self.summaries.lock() {
            summaries.insert(summary.execution_id, summary.clone());
        }
        Ok(())
    }
}

// =============================================================================
// Swallowing Wrapper
// =============================================================================

/// Wrapper that makes sink writes infallible from the runner's point of view.
#[derive(Clone)]
pub struct SinkLogger {
    sink: Arc<dyn ExecutionSink>,
}

impl SinkLogger {
    /// Wrap a sink
    #[must_use]
    pub fn new(sink: Arc<dyn ExecutionSink>) -> Self {
        Self { sink }
    }

    /// Append a step row; failures are logged and dropped
    pub async fn step(&self, log: &StepLog) {
        if let Err(e) = self.sink.append_step(log).await {
            tracing::error!(execution_id = %log.execution_id, error = %e,
                "failed to write step log");
        }
    }

    /// Append a message row; failures are logged and dropped
    pub async fn message(
        &self,
        execution_id: &ExecutionId,
        workflow_id: &WorkflowId,
        level: &str,
        message: &str,
    ) {
        if let Err(e) = self
            .sink
            .append_message(execution_id, workflow_id, level, message)
            .await
        {
            tracing::error!(execution_id = %execution_id, error = %e,
                "failed to write execution message");
        }
    }

    /// Upsert the execution summary; failures are logged and dropped
    pub async fn summary(&self, summary: &ExecutionSummary) {
        if let Err(e) = self.sink.upsert_summary(summary).await {
            tracing::error!(execution_id = %summary.execution_id, error = %e,
                "failed to write execution summary");
        }
    }
}
