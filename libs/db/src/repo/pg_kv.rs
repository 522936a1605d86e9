//! PostgreSQL implementation of the workflow-scoped KV repository
//!
//! Every query filters on workflow_id; entries are never visible across
//! workflows.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::PgPool;

use garrison_domain::{Value, WorkflowId};

use crate::repo::errors::KvStoreError;
use crate::repo::traits::KvRepository;

/// PostgreSQL key-value repository
pub struct PgKvRepository {
    pool: PgPool,
}

impl PgKvRepository {
    /// Create a new PostgreSQL KV repository
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KvRepository for PgKvRepository {
    async fn get(
        &self,
        workflow_id: &WorkflowId,
        key: &str,
    ) -> Result<Option<Value>, KvStoreError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT value FROM workflow_kv WHERE workflow_id = $1 AND key = $2")
                .bind(workflow_id.as_uuid())
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(KvStoreError::Database)?;

        Ok(row.map(|(v,)| Value::from_json(v)))
    }

    async fn set(
        &self,
        workflow_id: &WorkflowId,
        key: &str,
        value: &Value,
    ) -> Result<(), KvStoreError> {
        sqlx::query(
            r"
            INSERT INTO workflow_kv (workflow_id, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_id, key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            ",
        )
        .bind(workflow_id.as_uuid())
        .bind(key)
        .bind(value.to_json())
        .execute(&self.pool)
        .await
        .map_err(KvStoreError::Database)?;

        Ok(())
    }

    async fn delete(&self, workflow_id: &WorkflowId, key: &str) -> Result<bool, KvStoreError> {
        let result = sqlx::query("DELETE FROM workflow_kv WHERE workflow_id = $1 AND key = $2")
            .bind(workflow_id.as_uuid())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(KvStoreError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, workflow_id: &WorkflowId, key: &str) -> Result<bool, KvStoreError> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM workflow_kv WHERE workflow_id = $1 AND key = $2)",
        )
        .bind(workflow_id.as_uuid())
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(KvStoreError::Database)?;

        Ok(row.0)
    }

    async fn list_keys(&self, workflow_id: &WorkflowId) -> Result<Vec<String>, KvStoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM workflow_kv WHERE workflow_id = $1 ORDER BY key")
                .bind(workflow_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(KvStoreError::Database)?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn count(&self, workflow_id: &WorkflowId) -> Result<u64, KvStoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workflow_kv WHERE workflow_id = $1")
            .bind(workflow_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(KvStoreError::Database)?;

        Ok(row.0.max(0) as u64)
    }

    async fn get_all(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<BTreeMap<String, Value>, KvStoreError> {
        let rows: Vec<(String, serde_json::Value)> =
            sqlx::query_as("SELECT key, value FROM workflow_kv WHERE workflow_id = $1")
                .bind(workflow_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(KvStoreError::Database)?;

        Ok(rows
            .into_iter()
            .map(|(k, v)| (k, Value::from_json(v)))
            .collect())
    }

    async fn clear(&self, workflow_id: &WorkflowId) -> Result<u64, KvStoreError> {
        let result = sqlx::query("DELETE FROM workflow_kv WHERE workflow_id = $1")
            .bind(workflow_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(KvStoreError::Database)?;

        Ok(result.rows_affected())
    }
}
