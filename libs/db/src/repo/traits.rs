//! Repository trait definitions
//!
//! These traits define the interface for definition-store operations.
//! Implementations are provided for PostgreSQL and, for development and
//! testing, as in-memory fakes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use garrison_domain::{
    ExecutionId, ExecutionRecord, ServerId, Value, Workflow, WorkflowDefinition, WorkflowId,
    WorkflowVariable,
};

use crate::repo::errors::*;

// =============================================================================
// Input Types
// =============================================================================

/// Input for creating a new workflow
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub server_id: ServerId,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub definition: WorkflowDefinition,
    pub created_by: String,
}

/// Input for updating a workflow
#[derive(Debug, Clone, Default)]
pub struct WorkflowUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub definition: Option<WorkflowDefinition>,
}

// =============================================================================
// Repository Traits
// =============================================================================

/// Repository for workflow definitions
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Create a new workflow
    async fn create(&self, workflow: &NewWorkflow) -> Result<Workflow, CreateWorkflowError>;

    /// Find a workflow by ID
    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<Workflow>, FindWorkflowError>;

    /// List all workflows for a server
    async fn list_by_server(&self, server_id: &ServerId)
        -> Result<Vec<Workflow>, ListWorkflowsError>;

    /// List all enabled workflows across servers (startup / reload)
    async fn list_enabled(&self) -> Result<Vec<Workflow>, ListWorkflowsError>;

    /// Update an existing workflow
    async fn update(
        &self,
        id: &WorkflowId,
        update: &WorkflowUpdate,
    ) -> Result<Workflow, UpdateWorkflowError>;

    /// Enable or disable a workflow
    async fn set_enabled(&self, id: &WorkflowId, enabled: bool) -> Result<(), UpdateWorkflowError>;

    /// Delete a workflow; cascades to variables, executions, and KV entries
    async fn delete(&self, id: &WorkflowId) -> Result<(), DeleteWorkflowError>;
}

/// Repository for persisted per-workflow variables
#[async_trait]
pub trait VariableRepository: Send + Sync {
    /// List all persisted variables for a workflow
    async fn list_for_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<WorkflowVariable>, VariableStoreError>;

    /// Insert or update a variable value
    async fn upsert(
        &self,
        workflow_id: &WorkflowId,
        name: &str,
        value: &Value,
    ) -> Result<WorkflowVariable, VariableStoreError>;

    /// Delete a variable; returns whether it existed
    async fn delete(&self, workflow_id: &WorkflowId, name: &str)
        -> Result<bool, VariableStoreError>;
}

/// Repository for execution lifecycle records
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Insert a new RUNNING record at execution start
    async fn insert_running(
        &self,
        workflow_id: &WorkflowId,
        execution_id: &ExecutionId,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionRecord, ExecutionStoreError>;

    /// Transition a record to COMPLETED
    async fn mark_completed(
        &self,
        execution_id: &ExecutionId,
        completed_at: DateTime<Utc>,
    ) -> Result<(), ExecutionStoreError>;

    /// Transition a record to FAILED with the last error message
    async fn mark_failed(
        &self,
        execution_id: &ExecutionId,
        completed_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<(), ExecutionStoreError>;

    /// Find a record by execution ID
    async fn find_by_execution_id(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, ExecutionStoreError>;

    /// List the most recent records for a workflow, newest first
    async fn list_recent_for_workflow(
        &self,
        workflow_id: &WorkflowId,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>, ExecutionStoreError>;
}

/// Repository for the workflow-scoped persistent key-value store.
///
/// Every operation is scoped to one workflow; entries are never visible
/// across workflows.
#[async_trait]
pub trait KvRepository: Send + Sync {
    /// Get a value by key
    async fn get(&self, workflow_id: &WorkflowId, key: &str)
        -> Result<Option<Value>, KvStoreError>;

    /// Insert or update a value; updates `updated_at` on conflict
    async fn set(
        &self,
        workflow_id: &WorkflowId,
        key: &str,
        value: &Value,
    ) -> Result<(), KvStoreError>;

    /// Delete a key; returns whether it existed
    async fn delete(&self, workflow_id: &WorkflowId, key: &str) -> Result<bool, KvStoreError>;

    /// Whether a key exists
    async fn exists(&self, workflow_id: &WorkflowId, key: &str) -> Result<bool, KvStoreError>;

    /// List all keys for a workflow
    async fn list_keys(&self, workflow_id: &WorkflowId) -> Result<Vec<String>, KvStoreError>;

    /// Count entries for a workflow
    async fn count(&self, workflow_id: &WorkflowId) -> Result<u64, KvStoreError>;

    /// Fetch all entries for a workflow
    async fn get_all(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<BTreeMap<String, Value>, KvStoreError>;

    /// Remove all entries for a workflow; returns the number removed
    async fn clear(&self, workflow_id: &WorkflowId) -> Result<u64, KvStoreError>;
}
