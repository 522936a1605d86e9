//! Event-driven workflow engine for Garrison
//!
//! Subscribes to server events, matches them against user-defined workflows,
//! and executes each match as an ordered sequence of steps (RCON actions,
//! HTTP calls, variable transforms, delays, sandboxed scripts) with per-step
//! and workflow-level error policies.

pub mod analytics;
pub mod bus;
pub mod condition;
pub mod context;
pub mod executor;
pub mod manager;
pub mod rcon;
pub mod runner;
pub mod template;
pub mod validate;

pub use analytics::{ExecutionSink, MemoryExecutionSink, PgExecutionSink, SinkLogger};
pub use bus::{EventBus, EventFilter, InProcessEventBus, Subscription};
pub use condition::{evaluate_conditions, ConditionLogic};
pub use context::ExecutionContext;
pub use executor::{StepError, StepHandler, StepOutcome, StepRegistry, StepServices};
pub use manager::{LiveExecutionInfo, ManagerError, TriggerBinding, WorkflowManager};
pub use rcon::{RconClient, RconError, RecordingRconClient};
pub use runner::{RunReport, StepCounters, StepRunner};
pub use template::render;
pub use validate::{validate_definition, ValidationError};
