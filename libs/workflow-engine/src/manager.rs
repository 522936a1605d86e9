//! Workflow manager
//!
//! Owns the enabled-workflow cache, consumes the event bus, matches events
//! to triggers, and spawns one independent execution task per match. Also
//! tracks live executions and drives graceful shutdown.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use garrison_db::{
    ExecutionRepository, KvRepository, ListWorkflowsError, VariableRepository, WorkflowRepository,
};
use garrison_domain::{
    ExecutionId, ExecutionSummary, ServerEvent, ServerId, TriggerId, Value, Workflow, WorkflowId,
};

use crate::analytics::{ExecutionSink, SinkLogger};
use crate::bus::{EventBus, EventFilter, Subscription};
use crate::condition::{evaluate_conditions, ConditionLogic};
use crate::context::ExecutionContext;
use crate::executor::{StepRegistry, StepServices};
use crate::rcon::RconClient;
use crate::runner::StepRunner;
use crate::validate::validate_definition;

/// Hard cap on outbound HTTP request time for action steps
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Errors
// =============================================================================

/// Manager lifecycle errors
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Failed to load workflows from the definition store
    #[error("failed to load workflows: {0}")]
    Load(#[from] ListWorkflowsError),

    /// Failed to build the HTTP client
    #[error("failed to build http client: {0}")]
    HttpClient(String),

    /// Manager already started
    #[error("manager already started")]
    AlreadyStarted,
}

// =============================================================================
// Snapshots
// =============================================================================

/// Observability snapshot of one live execution
#[derive(Debug, Clone)]
pub struct LiveExecutionInfo {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub server_id: ServerId,
    pub started_at: DateTime<Utc>,
}

/// One trigger bound to an event type, for the observability index
#[derive(Debug, Clone)]
pub struct TriggerBinding {
    pub workflow_id: WorkflowId,
    pub trigger_id: TriggerId,
    pub trigger_name: String,
}

// =============================================================================
// Manager
// =============================================================================

/// The engine's front door: cache, event loop, and execution fan-out
pub struct WorkflowManager {
    workflows: RwLock<HashMap<WorkflowId, Arc<Workflow>>>,
    live: Mutex<HashMap<ExecutionId, LiveExecutionInfo>>,
    handles: Mutex<HashMap<ExecutionId, JoinHandle<()>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,

    bus: Arc<dyn EventBus>,
    workflow_repo: Arc<dyn WorkflowRepository>,
    variable_repo: Arc<dyn VariableRepository>,
    execution_repo: Arc<dyn ExecutionRepository>,
    sink: SinkLogger,
    runner: StepRunner,

    cancel_tx: watch::Sender<bool>,
}

impl WorkflowManager {
    /// Build a manager over its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<dyn EventBus>,
        workflow_repo: Arc<dyn WorkflowRepository>,
        variable_repo: Arc<dyn VariableRepository>,
        execution_repo: Arc<dyn ExecutionRepository>,
        kv_repo: Arc<dyn KvRepository>,
        sink: Arc<dyn ExecutionSink>,
        rcon: Arc<dyn RconClient>,
    ) -> Result<Arc<Self>, ManagerError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ManagerError::HttpClient(e.to_string()))?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let sink = SinkLogger::new(sink);

        let services = StepServices {
            rcon,
            http,
            kv: kv_repo,
            sink: sink.clone(),
            cancel: cancel_rx,
        };
        let runner = StepRunner::new(Arc::new(StepRegistry::with_builtins()), services);

        Ok(Arc::new(Self {
            workflows: RwLock::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            loop_handle: Mutex::new(None),
            bus,
            workflow_repo,
            variable_repo,
            execution_repo,
            sink,
            runner,
            cancel_tx,
        }))
    }

    /// Load enabled workflows and start consuming the event bus.
    pub async fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        {
            let guard = self.loop_handle.lock().unwrap_or_else(|p| p.into_inner());
            if guard.is_some() {
                return Err(ManagerError::AlreadyStarted);
            }
        }

        let loaded = self.load_workflows().await?;
        tracing::info!(workflows = loaded, "workflow engine started");

        let subscription = self.bus.subscribe(EventFilter::all()).await;
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.event_loop(subscription).await;
        });

        let mut guard = self.loop_handle.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some(handle);
        Ok(())
    }

    /// Re-read all enabled workflows and replace the cache atomically.
    pub async fn reload_workflows(&self) -> Result<usize, ManagerError> {
        self.load_workflows().await
    }

    async fn load_workflows(&self) -> Result<usize, ManagerError> {
        let enabled = self.workflow_repo.list_enabled().await?;

        let mut cache = HashMap::new();
        for workflow in enabled {
            if let Err(e) = validate_definition(&workflow.definition) {
                tracing::warn!(workflow_id = %workflow.id, name = %workflow.name,
                    error = %e, "excluding invalid workflow from cache");
                continue;
            }
            cache.insert(workflow.id, Arc::new(workflow));
        }

        let count = cache.len();
        let mut workflows = self.workflows.write().await;
        *workflows = cache;
        Ok(count)
    }

    /// Wait until the watch channel carries `true`, without holding the
    /// borrowed `Ref` across an await point (the `Ref` is not `Send`).
    async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
        if *cancel.borrow() {
            return;
        }
        while cancel.changed().await.is_ok() {
            if *cancel.borrow() {
                return;
            }
        }
    }

    /// Single-consumer event loop; exits on shutdown.
    async fn event_loop(self: Arc<Self>, mut subscription: Subscription) {
        let mut cancel = self.cancel_tx.subscribe();
        loop {
            tokio::select! {
                event = subscription.receiver.recv() => {
                    match event {
                        Some(event) => self.dispatch_event(event).await,
                        None => break,
                    }
                }
                () = Self::wait_for_cancel(&mut cancel) => break,
            }
        }
        subscription.unsubscribe();
        tracing::debug!("event loop stopped");
    }

    /// Match one event against the cache and spawn executions.
    async fn dispatch_event(self: &Arc<Self>, event: ServerEvent) {
        let matched: Vec<Arc<Workflow>> = {
            let workflows = self.workflows.read().await;
            workflows
                .values()
                .filter(|w| w.server_id == event.server_id && matches_any_trigger(w, &event))
                .cloned()
                .collect()
        };

        for workflow in matched {
            self.spawn_execution(workflow, event.clone());
        }
    }

    /// Spawn one independent execution task for a matched workflow.
    fn spawn_execution(self: &Arc<Self>, workflow: Arc<Workflow>, event: ServerEvent) {
        let execution_id = ExecutionId::new();
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.run_execution(execution_id, workflow, event).await;
        });

        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles.insert(execution_id, handle);
        // A task that finished before this insert leaves a completed handle
        handles.retain(|_, h| !h.is_finished());
    }

    async fn run_execution(
        self: Arc<Self>,
        execution_id: ExecutionId,
        workflow: Arc<Workflow>,
        event: ServerEvent,
    ) {
        let variables = self.initial_variables(&workflow).await;
        let mut ctx = ExecutionContext::new(
            execution_id,
            &workflow,
            event.event_type.clone(),
            event.data.clone(),
            variables,
        );

        if let Err(e) = self
            .execution_repo
            .insert_running(&workflow.id, &execution_id, ctx.started_at)
            .await
        {
            tracing::error!(workflow_id = %workflow.id, error = %e,
                "failed to record execution start, not running");
            return;
        }

        {
            let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
            live.insert(
                execution_id,
                LiveExecutionInfo {
                    execution_id,
                    workflow_id: workflow.id,
                    workflow_name: workflow.name.clone(),
                    server_id: workflow.server_id,
                    started_at: ctx.started_at,
                },
            );
        }

        tracing::info!(execution_id = %execution_id, workflow = %workflow.name,
            event_type = %event.event_type, "execution started");

        let report = self.runner.run(&workflow.definition, &mut ctx).await;

        match &report.error_message {
            None => {
                if let Err(e) = self
                    .execution_repo
                    .mark_completed(&execution_id, report.completed_at)
                    .await
                {
                    tracing::error!(execution_id = %execution_id, error = %e,
                        "failed to finalize execution record");
                }
            }
            Some(message) => {
                if let Err(e) = self
                    .execution_repo
                    .mark_failed(&execution_id, report.completed_at, message)
                    .await
                {
                    tracing::error!(execution_id = %execution_id, error = %e,
                        "failed to finalize execution record");
                }
            }
        }

        let summary = ExecutionSummary {
            execution_id,
            workflow_id: workflow.id,
            server_id: workflow.server_id,
            total_steps: report.counters.total,
            completed_steps: report.counters.completed,
            failed_steps: report.counters.failed,
            skipped_steps: report.counters.skipped,
            total_duration_ms: report.duration_ms,
            status: report.status,
            error_message: report.error_message.clone(),
            started_at: ctx.started_at,
            completed_at: report.completed_at,
        };
        self.sink.summary(&summary).await;

        tracing::info!(execution_id = %execution_id, status = report.status.as_str(),
            completed = report.counters.completed, failed = report.counters.failed,
            skipped = report.counters.skipped, "execution finished");

        // Record and summary are finalized; only now drop the live entry
        {
            let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
            live.remove(&execution_id);
        }
        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        handles.remove(&execution_id);
    }

    /// Definition defaults overlaid with persisted workflow variables
    async fn initial_variables(&self, workflow: &Workflow) -> BTreeMap<String, Value> {
        let mut variables = workflow.definition.variables.clone();
        match self.variable_repo.list_for_workflow(&workflow.id).await {
            Ok(persisted) => {
                for variable in persisted {
                    variables.insert(variable.name, variable.value);
                }
            }
            Err(e) => {
                tracing::warn!(workflow_id = %workflow.id, error = %e,
                    "failed to load persisted variables, using definition defaults");
            }
        }
        variables
    }

    /// Stop accepting events, cancel live executions, and wait for them.
    pub async fn shutdown(&self) {
        tracing::info!("workflow engine shutting down");
        let _ = self.cancel_tx.send(true);

        let loop_handle = {
            let mut guard = self.loop_handle.lock().unwrap_or_else(|p| p.into_inner());
            guard.take()
        };
        if let Some(handle) = loop_handle {
            let _ = handle.await;
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|p| p.into_inner());
            guard.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("workflow engine stopped");
    }

    // =========================================================================
    // Observability
    // =========================================================================

    /// Snapshot of the enabled-workflow cache
    pub async fn workflow_snapshot(&self) -> Vec<Arc<Workflow>> {
        let workflows = self.workflows.read().await;
        workflows.values().cloned().collect()
    }

    /// Snapshot of live executions
    #[must_use]
    pub fn live_executions(&self) -> Vec<LiveExecutionInfo> {
        let live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        live.values().cloned().collect()
    }

    /// Index of event types to the triggers bound to them
    pub async fn trigger_index(&self) -> HashMap<String, Vec<TriggerBinding>> {
        let workflows = self.workflows.read().await;
        let mut index: HashMap<String, Vec<TriggerBinding>> = HashMap::new();
        for workflow in workflows.values() {
            for trigger in &workflow.definition.triggers {
                if !trigger.enabled {
                    continue;
                }
                index
                    .entry(trigger.event_type.clone())
                    .or_default()
                    .push(TriggerBinding {
                        workflow_id: workflow.id,
                        trigger_id: trigger.id,
                        trigger_name: trigger.name.clone(),
                    });
            }
        }
        index
    }
}

/// Whether any enabled trigger matches the event
fn matches_any_trigger(workflow: &Workflow, event: &ServerEvent) -> bool {
    let view = event.payload_view();
    workflow.definition.triggers.iter().any(|trigger| {
        trigger.enabled
            && trigger.event_type == event.event_type
            && evaluate_conditions(&trigger.conditions, &view, ConditionLogic::And)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use garrison_db::{
        MemoryExecutionRepository, MemoryKvRepository, MemoryVariableRepository,
        MemoryWorkflowRepository,
    };
    use garrison_domain::{ExecutionStatus, WorkflowDefinition};

    use crate::analytics::MemoryExecutionSink;
    use crate::bus::InProcessEventBus;
    use crate::rcon::RecordingRconClient;

    struct TestRig {
        bus: Arc<InProcessEventBus>,
        workflows: Arc<MemoryWorkflowRepository>,
        executions: Arc<MemoryExecutionRepository>,
        sink: Arc<MemoryExecutionSink>,
        rcon: Arc<RecordingRconClient>,
        manager: Arc<WorkflowManager>,
    }

    fn rig() -> TestRig {
        let bus = Arc::new(InProcessEventBus::new());
        let workflows = Arc::new(MemoryWorkflowRepository::new());
        let variables = Arc::new(MemoryVariableRepository::new());
        let executions = Arc::new(MemoryExecutionRepository::new());
        let kv = Arc::new(MemoryKvRepository::new());
        let sink = Arc::new(MemoryExecutionSink::new());
        let rcon = Arc::new(RecordingRconClient::new());

        let manager = WorkflowManager::new(
            bus.clone(),
            workflows.clone(),
            variables.clone(),
            executions.clone(),
            kv.clone(),
            sink.clone(),
            rcon.clone(),
        )
        .unwrap();

        TestRig {
            bus,
            workflows,
            executions,
            sink,
            rcon,
            manager,
        }
    }

    fn workflow(server_id: ServerId, enabled: bool, definition: serde_json::Value) -> Workflow {
        Workflow {
            id: WorkflowId::new(),
            server_id,
            name: "moderation".to_string(),
            description: None,
            enabled,
            definition: serde_json::from_value::<WorkflowDefinition>(definition).unwrap(),
            created_by: "admin".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn kick_on_slur_definition() -> serde_json::Value {
        serde_json::json!({
            "triggers": [{
                "name": "slur filter",
                "event_type": "chat_message",
                "conditions": [{
                    "field": "trigger_event.message",
                    "operator": "contains",
                    "value": "slur"
                }]
            }],
            "steps": [{
                "id": "kick",
                "name": "kick offender",
                "type": "action",
                "config": {
                    "action_type": "kick_player",
                    "player_id": "${trigger_event.steam_id}",
                    "reason": "Language"
                }
            }]
        })
    }

    /// Poll until all execution records have settled out of RUNNING
    async fn wait_for_settled(rig: &TestRig, expected: usize) -> Vec<garrison_domain::ExecutionRecord> {
        for _ in 0..300 {
            let records = rig.executions.all().await;
            if records.len() == expected
                && records.iter().all(|r| r.status != ExecutionStatus::Running)
            {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {expected} settled execution(s)");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kick_on_slur_end_to_end() {
        let rig = rig();
        let server_id = ServerId::new();
        rig.workflows
            .insert(workflow(server_id, true, kick_on_slur_definition()))
            .await;
        rig.manager.start().await.unwrap();

        rig.bus.publish(&ServerEvent::new(
            "chat_message",
            server_id,
            Value::from_json(serde_json::json!({
                "steam_id": "76500001",
                "message": "you slur"
            })),
        ));

        let records = wait_for_settled(&rig, 1).await;
        assert_eq!(records[0].status, ExecutionStatus::Completed);
        assert_eq!(rig.rcon.commands(), vec!["AdminKick \"76500001\" Language"]);

        let summary = rig.sink.summary(&records[0].execution_id).unwrap();
        assert_eq!(summary.completed_steps, 1);
        assert_eq!(summary.failed_steps, 0);
        assert_eq!(summary.status, ExecutionStatus::Completed);

        rig.manager.shutdown().await;
        assert!(rig.manager.live_executions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disabled_workflow_never_spawns() {
        let rig = rig();
        let server_id = ServerId::new();
        rig.workflows
            .insert(workflow(server_id, false, kick_on_slur_definition()))
            .await;
        rig.manager.start().await.unwrap();

        rig.bus.publish(&ServerEvent::new(
            "chat_message",
            server_id,
            Value::from_json(serde_json::json!({ "steam_id": "1", "message": "slur" })),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rig.executions.all().await.is_empty());
        assert!(rig.rcon.commands().is_empty());

        rig.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_event_fans_out_to_all_matching_workflows() {
        let rig = rig();
        let server_id = ServerId::new();
        rig.workflows
            .insert(workflow(server_id, true, kick_on_slur_definition()))
            .await;
        rig.workflows
            .insert(workflow(server_id, true, kick_on_slur_definition()))
            .await;
        // Same definition on another server: must not match
        rig.workflows
            .insert(workflow(ServerId::new(), true, kick_on_slur_definition()))
            .await;
        rig.manager.start().await.unwrap();

        rig.bus.publish(&ServerEvent::new(
            "chat_message",
            server_id,
            Value::from_json(serde_json::json!({ "steam_id": "1", "message": "slur" })),
        ));

        let records = wait_for_settled(&rig, 2).await;
        assert!(records
            .iter()
            .all(|r| r.status == ExecutionStatus::Completed));

        rig.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_matching_conditions_do_not_spawn() {
        let rig = rig();
        let server_id = ServerId::new();
        rig.workflows
            .insert(workflow(server_id, true, kick_on_slur_definition()))
            .await;
        rig.manager.start().await.unwrap();

        rig.bus.publish(&ServerEvent::new(
            "chat_message",
            server_id,
            Value::from_json(serde_json::json!({ "steam_id": "1", "message": "hello" })),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rig.executions.all().await.is_empty());

        rig.manager.shutdown().await;
    }

    fn increment_definition() -> serde_json::Value {
        serde_json::json!({
            "triggers": [{ "event_type": "player_connected" }],
            "steps": [{
                "id": "count",
                "name": "count connections",
                "type": "variable",
                "config": { "operation": "increment", "variable_name": "seen", "value": 1 }
            }]
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execution_contexts_are_isolated() {
        let rig = rig();
        let server_id = ServerId::new();
        rig.workflows
            .insert(workflow(server_id, true, increment_definition()))
            .await;
        rig.manager.start().await.unwrap();

        for _ in 0..2 {
            rig.bus.publish(&ServerEvent::new(
                "player_connected",
                server_id,
                Value::from_json(serde_json::json!({ "steam_id": "1" })),
            ));
        }

        wait_for_settled(&rig, 2).await;

        // Each execution started its own counter from 0
        let completed_counts: Vec<Value> = rig
            .sink
            .steps()
            .iter()
            .filter(|l| l.step_status == garrison_domain::StepStatus::Completed)
            .filter_map(|l| l.step_output.resolve_path("new_value").cloned())
            .collect();
        assert_eq!(completed_counts, vec![Value::Int(1), Value::Int(1)]);

        rig.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reload_picks_up_new_workflows() {
        let rig = rig();
        let server_id = ServerId::new();
        rig.manager.start().await.unwrap();
        assert!(rig.manager.workflow_snapshot().await.is_empty());

        rig.workflows
            .insert(workflow(server_id, true, kick_on_slur_definition()))
            .await;
        let loaded = rig.manager.reload_workflows().await.unwrap();
        assert_eq!(loaded, 1);

        rig.bus.publish(&ServerEvent::new(
            "chat_message",
            server_id,
            Value::from_json(serde_json::json!({ "steam_id": "9", "message": "slur" })),
        ));
        let records = wait_for_settled(&rig, 1).await;
        assert_eq!(records[0].status, ExecutionStatus::Completed);

        rig.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_definition_is_excluded_from_cache() {
        let rig = rig();
        let server_id = ServerId::new();
        // Action step with no action_type fails validation
        rig.workflows
            .insert(workflow(
                server_id,
                true,
                serde_json::json!({
                    "triggers": [{ "event_type": "chat_message" }],
                    "steps": [{ "id": "bad", "type": "action", "config": {} }]
                }),
            ))
            .await;
        rig.manager.start().await.unwrap();

        assert!(rig.manager.workflow_snapshot().await.is_empty());
        rig.manager.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_cancels_live_executions() {
        let rig = rig();
        let server_id = ServerId::new();
        rig.workflows
            .insert(workflow(
                server_id,
                true,
                serde_json::json!({
                    "triggers": [{ "event_type": "chat_message" }],
                    "steps": [{
                        "id": "wait", "name": "wait", "type": "delay",
                        "config": { "delay_ms": 60_000 }
                    }]
                }),
            ))
            .await;
        rig.manager.start().await.unwrap();

        rig.bus.publish(&ServerEvent::new(
            "chat_message",
            server_id,
            Value::empty_map(),
        ));

        // Let the execution reach its delay step
        for _ in 0..100 {
            if !rig.manager.live_executions().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rig.manager.live_executions().len(), 1);

        rig.manager.shutdown().await;

        let records = rig.executions.all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Failed);
        assert!(records[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("cancelled"));
        assert!(rig.manager.live_executions().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trigger_index() {
        let rig = rig();
        let server_id = ServerId::new();
        rig.workflows
            .insert(workflow(server_id, true, kick_on_slur_definition()))
            .await;
        rig.manager.start().await.unwrap();

        let index = rig.manager.trigger_index().await;
        assert_eq!(index.len(), 1);
        let bindings = index.get("chat_message").unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].trigger_name, "slur filter");

        rig.manager.shutdown().await;
    }
}
