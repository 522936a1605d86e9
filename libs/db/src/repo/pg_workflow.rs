//! PostgreSQL implementations of WorkflowRepository and VariableRepository

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use garrison_domain::{
    ServerId, Value, Workflow, WorkflowDefinition, WorkflowId, WorkflowVariable,
};

use crate::repo::errors::{
    CreateWorkflowError, DeleteWorkflowError, FindWorkflowError, ListWorkflowsError,
    UpdateWorkflowError, VariableStoreError,
};
use crate::repo::traits::{NewWorkflow, VariableRepository, WorkflowRepository, WorkflowUpdate};

/// PostgreSQL workflow repository
pub struct PgWorkflowRepository {
    pool: PgPool,
}

impl PgWorkflowRepository {
    /// Create a new PostgreSQL workflow repository
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const WORKFLOW_COLUMNS: &str = "workflow_id, server_id, name, description, enabled, \
     definition, created_by, created_at, updated_at";

#[async_trait]
impl WorkflowRepository for PgWorkflowRepository {
    async fn create(&self, workflow: &NewWorkflow) -> Result<Workflow, CreateWorkflowError> {
        let id = WorkflowId::new();
        let definition = serde_json::to_value(&workflow.definition)
            .map_err(|e| CreateWorkflowError::Database(sqlx::Error::Decode(e.to_string().into())))?;

        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            r"
            INSERT INTO workflows (
                workflow_id, server_id, name, description, enabled, definition, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {WORKFLOW_COLUMNS}
            "
        ))
        .bind(id.as_uuid())
        .bind(workflow.server_id.as_uuid())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.enabled)
        .bind(&definition)
        .bind(&workflow.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if let Some(db_err) = e.as_database_error() {
                if db_err.constraint() == Some("workflows_server_id_name_key") {
                    return CreateWorkflowError::NameExists(workflow.name.clone());
                }
            }
            CreateWorkflowError::Database(e)
        })?;

        row.try_into()
            .map_err(|e: String| CreateWorkflowError::Database(sqlx::Error::Decode(e.into())))
    }

    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<Workflow>, FindWorkflowError> {
        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE workflow_id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(FindWorkflowError::Database)?;

        row.map(TryInto::try_into)
            .transpose()
            .map_err(FindWorkflowError::InvalidDefinition)
    }

    async fn list_by_server(
        &self,
        server_id: &ServerId,
    ) -> Result<Vec<Workflow>, ListWorkflowsError> {
        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE server_id = $1 ORDER BY created_at"
        ))
        .bind(server_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(ListWorkflowsError::Database)?;

        convert_rows(rows)
    }

    async fn list_enabled(&self) -> Result<Vec<Workflow>, ListWorkflowsError> {
        let rows = sqlx::query_as::<_, WorkflowRow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE enabled = TRUE ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(ListWorkflowsError::Database)?;

        convert_rows(rows)
    }

    async fn update(
        &self,
        id: &WorkflowId,
        update: &WorkflowUpdate,
    ) -> Result<Workflow, UpdateWorkflowError> {
        let definition = update
            .definition
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| UpdateWorkflowError::Database(sqlx::Error::Decode(e.to_string().into())))?;

        let row = sqlx::query_as::<_, WorkflowRow>(&format!(
            r"
            UPDATE workflows
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                enabled = COALESCE($4, enabled),
                definition = COALESCE($5, definition),
                updated_at = NOW()
            WHERE workflow_id = $1
            RETURNING {WORKFLOW_COLUMNS}
            "
        ))
        .bind(id.as_uuid())
        .bind(&update.name)
        .bind(&update.description)
        .bind(update.enabled)
        .bind(&definition)
        .fetch_optional(&self.pool)
        .await
        .map_err(UpdateWorkflowError::Database)?
        .ok_or(UpdateWorkflowError::NotFound(*id))?;

        row.try_into()
            .map_err(|e: String| UpdateWorkflowError::Database(sqlx::Error::Decode(e.into())))
    }

    async fn set_enabled(&self, id: &WorkflowId, enabled: bool) -> Result<(), UpdateWorkflowError> {
        let result = sqlx::query(
            "UPDATE workflows SET enabled = $2, updated_at = NOW() WHERE workflow_id = $1",
        )
        .bind(id.as_uuid())
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(UpdateWorkflowError::Database)?;

        if result.rows_affected() == 0 {
            return Err(UpdateWorkflowError::NotFound(*id));
        }
        Ok(())
    }

    async fn delete(&self, id: &WorkflowId) -> Result<(), DeleteWorkflowError> {
        // Variables, execution records, and KV entries cascade via FKs
        let result = sqlx::query("DELETE FROM workflows WHERE workflow_id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(DeleteWorkflowError::Database)?;

        if result.rows_affected() == 0 {
            return Err(DeleteWorkflowError::NotFound(*id));
        }
        Ok(())
    }
}

fn convert_rows(rows: Vec<WorkflowRow>) -> Result<Vec<Workflow>, ListWorkflowsError> {
    rows.into_iter()
        .map(|row| {
            let workflow_id = WorkflowId::from_uuid(row.workflow_id);
            row.try_into()
                .map_err(|e: String| ListWorkflowsError::InvalidDefinition {
                    workflow_id,
                    message: e,
                })
        })
        .collect()
}

// =============================================================================
// Variable Repository
// =============================================================================

/// PostgreSQL repository for persisted workflow variables
pub struct PgVariableRepository {
    pool: PgPool,
}

impl PgVariableRepository {
    /// Create a new PostgreSQL variable repository
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VariableRepository for PgVariableRepository {
    async fn list_for_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<WorkflowVariable>, VariableStoreError> {
        let rows = sqlx::query_as::<_, VariableRow>(
            r"
            SELECT workflow_id, name, value, created_at, updated_at
            FROM workflow_variables
            WHERE workflow_id = $1
            ORDER BY name
            ",
        )
        .bind(workflow_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(VariableStoreError::Database)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn upsert(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
        value: &Value,
    ) -> Result<WorkflowVariable, VariableStoreError> {
        let row = sqlx::query_as::<_, VariableRow>(
            r"
            INSERT INTO workflow_variables (workflow_id, name, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_id, name)
            DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            RETURNING workflow_id, name, value, created_at, updated_at
            ",
        )
        .bind(workflow_id.as_uuid())
        .bind(name)
        .bind(value.to_json())
        .fetch_one(&self.pool)
        .await
        .map_err(VariableStoreError::Database)?;

        Ok(row.into())
    }

    async fn delete(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
    ) -> Result<bool, VariableStoreError> {
        let result =
            sqlx::query("DELETE FROM workflow_variables WHERE workflow_id = $1 AND name = $2")
                .bind(workflow_id.as_uuid())
                .bind(name)
                .execute(&self.pool)
                .await
                .map_err(VariableStoreError::Database)?;

        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

/// Row type for the workflows table
#[derive(Debug, sqlx::FromRow)]
struct WorkflowRow {
    workflow_id: Uuid,
    server_id: Uuid,
    name: String,
    description: Option<String>,
    enabled: bool,
    definition: serde_json::Value,
    created_by: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = String;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let definition: WorkflowDefinition =
            serde_json::from_value(row.definition).map_err(|e| e.to_string())?;

        Ok(Workflow {
            id: WorkflowId::from_uuid(row.workflow_id),
            server_id: ServerId::from_uuid(row.server_id),
            name: row.name,
            description: row.description,
            enabled: row.enabled,
            definition,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row type for the workflow_variables table
#[derive(Debug, sqlx::FromRow)]
struct VariableRow {
    workflow_id: Uuid,
    name: String,
    value: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<VariableRow> for WorkflowVariable {
    fn from(row: VariableRow) -> Self {
        Self {
            workflow_id: WorkflowId::from_uuid(row.workflow_id),
            name: row.name,
            value: Value::from_json(row.value),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
