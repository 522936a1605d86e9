//! Definition store for Garrison
//!
//! Transactional CRUD for workflows, persisted variables, execution records,
//! and the workflow-scoped key-value store. PostgreSQL implementations live
//! next to the repository traits; in-memory implementations are provided for
//! development and testing.

pub mod repo;

pub use repo::errors::*;
pub use repo::memory::{
    MemoryExecutionRepository, MemoryKvRepository, MemoryVariableRepository,
    MemoryWorkflowRepository,
};
pub use repo::pg_execution::PgExecutionRepository;
pub use repo::pg_kv::PgKvRepository;
pub use repo::pg_workflow::{PgVariableRepository, PgWorkflowRepository};
pub use repo::traits::{
    ExecutionRepository, KvRepository, NewWorkflow, VariableRepository, WorkflowRepository,
    WorkflowUpdate,
};
