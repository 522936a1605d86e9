//! In-memory repository implementations for development and testing

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use garrison_domain::{
    ExecutionId, ExecutionRecord, ExecutionStatus, ServerId, Value, Workflow, WorkflowId,
    WorkflowVariable,
};

use crate::repo::errors::{
    CreateWorkflowError, DeleteWorkflowError, ExecutionStoreError, FindWorkflowError,
    KvStoreError, ListWorkflowsError, UpdateWorkflowError, VariableStoreError,
};
use crate::repo::traits::{
    ExecutionRepository, KvRepository, NewWorkflow, VariableRepository, WorkflowRepository,
    WorkflowUpdate,
};

// =============================================================================
// Workflows
// =============================================================================

/// Simple in-memory workflow repository for development/testing
#[derive(Default)]
pub struct MemoryWorkflowRepository {
    workflows: Mutex<HashMap<WorkflowId, Workflow>>,
}

impl MemoryWorkflowRepository {
    /// Create a new empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the repository with an existing workflow
    pub async fn insert(&self, workflow: Workflow) {
        self.workflows.lock().await.insert(workflow.id, workflow);
    }
}

#[async_trait]
impl WorkflowRepository for MemoryWorkflowRepository {
    async fn create(&self, workflow: &NewWorkflow) -> Result<Workflow, CreateWorkflowError> {
        let now = Utc::now();
        let stored = Workflow {
            id: WorkflowId::new(),
            server_id: workflow.server_id,
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            enabled: workflow.enabled,
            definition: workflow.definition.clone(),
            created_by: workflow.created_by.clone(),
            created_at: now,
            updated_at: now,
        };
        self.workflows.lock().await.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<Workflow>, FindWorkflowError> {
        Ok(self.workflows.lock().await.get(id).cloned())
    }

    async fn list_by_server(
        &self,
        server_id: &ServerId,
    ) -> Result<Vec<Workflow>, ListWorkflowsError> {
        Ok(self
            .workflows
            .lock()
            .await
            .values()
            .filter(|w| w.server_id == *server_id)
            .cloned()
            .collect())
    }

    async fn list_enabled(&self) -> Result<Vec<Workflow>, ListWorkflowsError> {
        Ok(self
            .workflows
            .lock()
            .await
            .values()
            .filter(|w| w.enabled)
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        id: &WorkflowId,
        update: &WorkflowUpdate,
    ) -> Result<Workflow, UpdateWorkflowError> {
        let mut workflows = self.workflows.lock().await;
        let workflow = workflows
            .get_mut(id)
            .ok_or(UpdateWorkflowError::NotFound(*id))?;

        if let Some(name) = &update.name {
            workflow.name = name.clone();
        }
        if let Some(description) = &update.description {
            workflow.description = Some(description.clone());
        }
        if let Some(enabled) = update.enabled {
            workflow.enabled = enabled;
        }
        if let Some(definition) = &update.definition {
            workflow.definition = definition.clone();
        }
        workflow.updated_at = Utc::now();
        Ok(workflow.clone())
    }

    async fn set_enabled(&self, id: &WorkflowId, enabled: bool) -> Result<(), UpdateWorkflowError> {
        let mut workflows = self.workflows.lock().await;
        let workflow = workflows
            .get_mut(id)
            .ok_or(UpdateWorkflowError::NotFound(*id))?;
        workflow.enabled = enabled;
        workflow.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &WorkflowId) -> Result<(), DeleteWorkflowError> {
        self.workflows
            .lock()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or(DeleteWorkflowError::NotFound(*id))
    }
}

// =============================================================================
// Variables
// =============================================================================

/// In-memory persisted-variable repository
#[derive(Default)]
pub struct MemoryVariableRepository {
    variables: Mutex<HashMap<(WorkflowId, String), WorkflowVariable>>,
}

impl MemoryVariableRepository {
    /// Create a new empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VariableRepository for MemoryVariableRepository {
    async fn list_for_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<WorkflowVariable>, VariableStoreError> {
        Ok(self
            .variables
            .lock()
            .await
            .values()
            .filter(|v| v.workflow_id == *workflow_id)
            .cloned()
            .collect())
    }

    async fn upsert(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
        value: &Value,
    ) -> Result<WorkflowVariable, VariableStoreError> {
        let now = Utc::now();
        let mut variables = self.variables.lock().await;
        let entry = variables
            .entry((*workflow_id, name.to_string()))
            .and_modify(|v| {
                v.value = value.clone();
                v.updated_at = now;
            })
            .or_insert_with(|| WorkflowVariable {
                workflow_id: *workflow_id,
                name: name.to_string(),
                value: value.clone(),
                created_at: now,
                updated_at: now,
            });
        Ok(entry.clone())
    }

    async fn delete(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
    ) -> Result<bool, VariableStoreError> {
        Ok(self
            .variables
            .lock()
            .await
            .remove(&(*workflow_id, name.to_string()))
            .is_some())
    }
}

// =============================================================================
// Executions
// =============================================================================

/// In-memory execution record repository
#[derive(Default)]
pub struct MemoryExecutionRepository {
    records: Mutex<HashMap<ExecutionId, ExecutionRecord>>,
}

impl MemoryExecutionRepository {
    /// Create a new empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records (test helper)
    pub async fn all(&self) -> Vec<ExecutionRecord> {
        self.records.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl ExecutionRepository for MemoryExecutionRepository {
    async fn insert_running(
        &self,
        workflow_id: &WorkflowId,
        execution_id: &ExecutionId,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionRecord, ExecutionStoreError> {
        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            workflow_id: *workflow_id,
            execution_id: *execution_id,
            status: ExecutionStatus::Running,
            started_at,
            completed_at: None,
            error_message: None,
        };
        self.records
            .lock()
            .await
            .insert(*execution_id, record.clone());
        Ok(record)
    }

    async fn mark_completed(
        &self,
        execution_id: &ExecutionId,
        completed_at: DateTime<Utc>,
    ) -> Result<(), ExecutionStoreError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(execution_id)
            .ok_or(ExecutionStoreError::NotFound(*execution_id))?;
        record.status = ExecutionStatus::Completed;
        record.completed_at = Some(completed_at);
        Ok(())
    }

    async fn mark_failed(
        &self,
        execution_id: &ExecutionId,
        completed_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<(), ExecutionStoreError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(execution_id)
            .ok_or(ExecutionStoreError::NotFound(*execution_id))?;
        record.status = ExecutionStatus::Failed;
        record.completed_at = Some(completed_at);
        record.error_message = Some(error_message.to_string());
        Ok(())
    }

    async fn find_by_execution_id(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, ExecutionStoreError> {
        Ok(self.records.lock().await.get(execution_id).cloned())
    }

    async fn list_recent_for_workflow(
        &self,
        workflow_id: &WorkflowId,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, ExecutionStoreError> {
        let mut records: Vec<ExecutionRecord> = self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.workflow_id == *workflow_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(records)
    }
}

// =============================================================================
// KV
// =============================================================================

/// In-memory workflow-scoped KV repository
#[derive(Default)]
pub struct MemoryKvRepository {
    entries: Mutex<HashMap<WorkflowId, BTreeMap<String, Value>>>,
}

impl MemoryKvRepository {
    /// Create a new empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvRepository for MemoryKvRepository {
    async fn get(
        &self,
        workflow_id: &WorkflowId,
        key: &str,
    ) -> Result<Option<Value>, KvStoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(workflow_id)
            .and_then(|m| m.get(key).cloned()))
    }

    async fn set(
        &self,
        workflow_id: &WorkflowId,
        key: &str,
        value: &Value,
    ) -> Result<(), KvStoreError> {
        self.entries
            .lock()
            .await
            .entry(*workflow_id)
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, workflow_id: &WorkflowId, key: &str) -> Result<bool, KvStoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .get_mut(workflow_id)
            .is_some_and(|m| m.remove(key).is_some()))
    }

    async fn exists(&self, workflow_id: &WorkflowId, key: &str) -> Result<bool, KvStoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(workflow_id)
            .is_some_and(|m| m.contains_key(key)))
    }

    async fn list_keys(&self, workflow_id: &WorkflowId) -> Result<Vec<String>, KvStoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(workflow_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, workflow_id: &WorkflowId) -> Result<u64, KvStoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(workflow_id)
            .map_or(0, |m| m.len() as u64))
    }

    async fn get_all(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<BTreeMap<String, Value>, KvStoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .get(workflow_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, workflow_id: &WorkflowId) -> Result<u64, KvStoreError> {
        Ok(self
            .entries
            .lock()
            .await
            .remove(workflow_id)
            .map_or(0, |m| m.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garrison_domain::WorkflowDefinition;

    fn new_workflow(server_id: ServerId, enabled: bool) -> NewWorkflow {
        NewWorkflow {
            server_id,
            name: "test".to_string(),
            description: None,
            enabled,
            definition: serde_json::from_str::<WorkflowDefinition>("{}").unwrap(),
            created_by: "admin".to_string(),
        }
    }

    #[tokio::test]
    async fn test_workflow_crud() {
        let repo = MemoryWorkflowRepository::new();
        let server = ServerId::new();

        let created = repo.create(&new_workflow(server, true)).await.unwrap();
        assert!(repo.find_by_id(&created.id).await.unwrap().is_some());
        assert_eq!(repo.list_enabled().await.unwrap().len(), 1);

        repo.set_enabled(&created.id, false).await.unwrap();
        assert!(repo.list_enabled().await.unwrap().is_empty());

        repo.delete(&created.id).await.unwrap();
        assert!(repo.find_by_id(&created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kv_is_scoped_per_workflow() {
        let repo = MemoryKvRepository::new();
        let a = WorkflowId::new();
        let b = WorkflowId::new();

        repo.set(&a, "count", &Value::Int(1)).await.unwrap();
        assert_eq!(repo.get(&a, "count").await.unwrap(), Some(Value::Int(1)));
        assert_eq!(repo.get(&b, "count").await.unwrap(), None);
        assert_eq!(repo.count(&b).await.unwrap(), 0);

        assert_eq!(repo.clear(&a).await.unwrap(), 1);
        assert_eq!(repo.count(&a).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_execution_lifecycle() {
        let repo = MemoryExecutionRepository::new();
        let workflow_id = WorkflowId::new();
        let execution_id = ExecutionId::new();

        repo.insert_running(&workflow_id, &execution_id, Utc::now())
            .await
            .unwrap();
        repo.mark_failed(&execution_id, Utc::now(), "boom")
            .await
            .unwrap();

        let record = repo
            .find_by_execution_id(&execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
    }
}
