//! PostgreSQL implementation of ExecutionRepository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use garrison_domain::{ExecutionId, ExecutionRecord, ExecutionStatus, WorkflowId};

use crate::repo::errors::ExecutionStoreError;
use crate::repo::traits::ExecutionRepository;

/// PostgreSQL execution record repository
pub struct PgExecutionRepository {
    pool: PgPool,
}

impl PgExecutionRepository {
    /// Create a new PostgreSQL execution repository
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const EXECUTION_COLUMNS: &str =
    "id, workflow_id, execution_id, status, started_at, completed_at, error_message";

#[async_trait]
impl ExecutionRepository for PgExecutionRepository {
    async fn insert_running(
        &self,
        workflow_id: &WorkflowId,
        execution_id: &ExecutionId,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionRecord, ExecutionStoreError> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            r"
            INSERT INTO workflow_executions (id, workflow_id, execution_id, status, started_at)
            VALUES ($1, $2, $3, 'RUNNING', $4)
            RETURNING {EXECUTION_COLUMNS}
            "
        ))
        .bind(Uuid::new_v4())
        .bind(workflow_id.as_uuid())
        .bind(execution_id.as_uuid())
        .bind(started_at)
        .fetch_one(&self.pool)
        .await
        .map_err(ExecutionStoreError::Database)?;

        Ok(row.into())
    }

    async fn mark_completed(
        &self,
        execution_id: &ExecutionId,
        completed_at: DateTime<Utc>,
    ) -> Result<(), ExecutionStoreError> {
        let result = sqlx::query(
            r"
            UPDATE workflow_executions
            SET status = 'COMPLETED', completed_at = $2
            WHERE execution_id = $1
            ",
        )
        .bind(execution_id.as_uuid())
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(ExecutionStoreError::Database)?;

        if result.rows_affected() == 0 {
            return Err(ExecutionStoreError::NotFound(*execution_id));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        execution_id: &ExecutionId,
        completed_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<(), ExecutionStoreError> {
        let result = sqlx::query(
            r"
            UPDATE workflow_executions
            SET status = 'FAILED', completed_at = $2, error_message = $3
            WHERE execution_id = $1
            ",
        )
        .bind(execution_id.as_uuid())
        .bind(completed_at)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(ExecutionStoreError::Database)?;

        if result.rows_affected() == 0 {
            return Err(ExecutionStoreError::NotFound(*execution_id));
        }
        Ok(())
    }

    async fn find_by_execution_id(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, ExecutionStoreError> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE execution_id = $1"
        ))
        .bind(execution_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(ExecutionStoreError::Database)?;

        Ok(row.map(Into::into))
    }

    async fn list_recent_for_workflow(
        &self,
        workflow_id: &WorkflowId,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, ExecutionStoreError> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            r"
            SELECT {EXECUTION_COLUMNS}
            FROM workflow_executions
            WHERE workflow_id = $1
            ORDER BY started_at DESC
            LIMIT $2
            "
        ))
        .bind(workflow_id.as_uuid())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(ExecutionStoreError::Database)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

/// Row type for the workflow_executions table
#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    workflow_id: Uuid,
    execution_id: Uuid,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl From<ExecutionRow> for ExecutionRecord {
    fn from(row: ExecutionRow) -> Self {
        let status = match row.status.as_str() {
            "COMPLETED" => ExecutionStatus::Completed,
            "FAILED" => ExecutionStatus::Failed,
            _ => ExecutionStatus::Running,
        };

        Self {
            id: row.id,
            workflow_id: WorkflowId::from_uuid(row.workflow_id),
            execution_id: ExecutionId::from_uuid(row.execution_id),
            status,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
        }
    }
}
