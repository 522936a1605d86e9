//! Domain types for the Garrison game-server administration platform
//!
//! Defines typed identifiers, the open-typed value model shared by the
//! workflow engine and its stores, server events, and the workflow /
//! execution data model.

pub mod event;
pub mod execution;
pub mod ids;
pub mod value;
pub mod workflow;

pub use event::ServerEvent;
pub use execution::{
    ExecutionRecord, ExecutionStatus, ExecutionSummary, KvEntry, StepLog, StepStatus,
    WorkflowVariable,
};
pub use ids::{ExecutionId, IdParseError, ServerId, TriggerId, WorkflowId};
pub use value::Value;
pub use workflow::{
    ConditionConfig, ErrorHandlingConfig, StepConfig, StepErrorPolicy, StepKind, TriggerConfig,
    Workflow, WorkflowDefinition,
};
