//! Per-operation repository errors
//!
//! Each repository operation has its own error type for precise error handling.

use garrison_domain::{ExecutionId, WorkflowId};
use thiserror::Error;

// =============================================================================
// Workflow Repository Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum CreateWorkflowError {
    #[error("workflow name already exists on this server: {0}")]
    NameExists(String),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum FindWorkflowError {
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum ListWorkflowsError {
    #[error("invalid workflow definition for {workflow_id}: {message}")]
    InvalidDefinition {
        workflow_id: WorkflowId,
        message: String,
    },
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum UpdateWorkflowError {
    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum DeleteWorkflowError {
    #[error("workflow not found: {0}")]
    NotFound(WorkflowId),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

// =============================================================================
// Variable Repository Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum VariableStoreError {
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

// =============================================================================
// Execution Repository Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ExecutionStoreError {
    #[error("execution not found: {0}")]
    NotFound(ExecutionId),
    #[error("database error")]
    Database(#[source] sqlx::Error),
}

// =============================================================================
// KV Repository Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum KvStoreError {
    #[error("database error")]
    Database(#[source] sqlx::Error),
}
