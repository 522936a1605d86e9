//! Script step handler
//!
//! Runs user scripts in a sandboxed rhai engine on a blocking thread. The
//! sandbox has no filesystem or network primitives; the host injects a
//! `workflow` object, a `result` map that becomes the step output, logging,
//! variable access, JSON helpers, RCON commands, and the workflow-scoped KV
//! store. A wall-clock deadline terminates runaway scripts.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};

use garrison_db::KvRepository;
use garrison_domain::{ExecutionId, ServerId, StepConfig, StepKind, Value, WorkflowId};

use crate::analytics::SinkLogger;
use crate::context::ExecutionContext;
use crate::rcon::RconClient;

use super::{StepError, StepHandler, StepOutcome, StepServices};

/// Default script wall-clock timeout
const DEFAULT_TIMEOUT_SECS: i64 = 30;

/// Handler for `script` steps
pub struct ScriptStepHandler;

#[async_trait]
impl StepHandler for ScriptStepHandler {
    async fn execute(
        &self,
        step: &StepConfig,
        ctx: &mut ExecutionContext,
        services: &StepServices,
    ) -> Result<StepOutcome, StepError> {
        run_script(step, ctx, services).await
    }

    fn kind(&self) -> StepKind {
        StepKind::Script
    }
}

/// Shared state mutated by script host functions
struct ScriptBridge {
    variables: Mutex<BTreeMap<String, Value>>,
}

/// Execute the script configured on a step.
///
/// Also used by action steps with `action_type = "script"`.
pub(crate) async fn run_script(
    step: &StepConfig,
    ctx: &mut ExecutionContext,
    services: &StepServices,
) -> Result<StepOutcome, StepError> {
    let script = step
        .config
        .resolve_path("script")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StepError::InvalidConfig("missing required field 'script'".to_string()))?
        .to_string();

    let timeout_secs = step
        .config
        .resolve_path("timeout_seconds")
        .and_then(Value::as_i64)
        .filter(|s| *s > 0)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);

    let workflow_object = workflow_object(step, ctx);
    let bridge = Arc::new(ScriptBridge {
        variables: Mutex::new(ctx.variables.clone()),
    });

    let host = HostBindings {
        bridge: Arc::clone(&bridge),
        rcon: Arc::clone(&services.rcon),
        kv: Arc::clone(&services.kv),
        sink: services.sink.clone(),
        server_id: ctx.server_id,
        workflow_id: ctx.workflow_id,
        execution_id: ctx.execution_id,
        handle: tokio::runtime::Handle::current(),
    };

    let cancel = services.cancel.clone();
    let deadline = Instant::now() + Duration::from_secs(timeout_secs as u64);

    let joined = tokio::task::spawn_blocking(move || {
        let mut engine = Engine::new();
        engine.set_max_expr_depths(64, 64);
        engine.on_progress(move |ops| {
            if ops % 64 == 0 {
                if Instant::now() >= deadline {
                    return Some(Dynamic::from("timeout"));
                }
                if *cancel.borrow() {
                    return Some(Dynamic::from("cancelled"));
                }
            }
            None
        });
        host.register(&mut engine);

        let mut scope = Scope::new();
        scope.push_dynamic("workflow", workflow_object);
        scope.push("result", rhai::Map::new());

        engine
            .eval_with_scope::<Dynamic>(&mut scope, &script)
            .map(|_| scope.get_value::<rhai::Map>("result").unwrap_or_default())
    })
    .await;

    let evaluated = match joined {
        Ok(result) => result,
        Err(join_err) => {
            return Err(StepError::Script(format!("script panicked: {join_err}")));
        }
    };

    match evaluated {
        Ok(result_map) => {
            // Variables written by set_variable survive only on success
            if let Ok(variables) = bridge.variables.lock() {
                ctx.variables = variables.clone();
            }
            Ok(StepOutcome::output(dynamic_to_value(&Dynamic::from(
                result_map,
            ))))
        }
        Err(e) => Err(classify_script_error(&e, timeout_secs)),
    }
}

fn classify_script_error(error: &EvalAltResult, timeout_secs: i64) -> StepError {
    if let EvalAltResult::ErrorTerminated(token, _) = error {
        let token = token.clone().into_string().unwrap_or_default();
        if token == "cancelled" {
            return StepError::Cancelled;
        }
        return StepError::TimedOut(format!("script timed out after {timeout_secs}s"));
    }
    StepError::Script(error.to_string())
}

/// Build the `workflow` object exposed to scripts
fn workflow_object(step: &StepConfig, ctx: &ExecutionContext) -> Dynamic {
    let mut config = step.config.as_map().cloned().unwrap_or_default();
    config.remove("script");
    config.remove("timeout_seconds");

    let mut object = BTreeMap::new();
    object.insert(
        "execution_id".to_string(),
        Value::String(ctx.execution_id.to_string()),
    );
    object.insert(
        "workflow_id".to_string(),
        Value::String(ctx.workflow_id.to_string()),
    );
    object.insert(
        "server_id".to_string(),
        Value::String(ctx.server_id.to_string()),
    );
    object.insert("step_id".to_string(), Value::String(step.id.clone()));
    object.insert("step_name".to_string(), Value::String(step.name.clone()));
    object.insert(
        "variables".to_string(),
        Value::Map(ctx.variables.clone()),
    );
    object.insert(
        "step_results".to_string(),
        Value::Map(ctx.step_results.clone()),
    );
    object.insert("trigger_event".to_string(), ctx.trigger_event.clone());
    object.insert("metadata".to_string(), ctx.metadata.clone());
    object.insert("config".to_string(), Value::Map(config));

    value_to_dynamic(&Value::Map(object))
}

fn value_to_dynamic(value: &Value) -> Dynamic {
    rhai::serde::to_dynamic(value.to_json()).unwrap_or(Dynamic::UNIT)
}

fn dynamic_to_value(dynamic: &Dynamic) -> Value {
    rhai::serde::from_dynamic::<serde_json::Value>(dynamic)
        .map(Value::from_json)
        .unwrap_or(Value::Null)
}

// =============================================================================
// Host Bindings
// =============================================================================

/// Everything the host injects into the script engine
struct HostBindings {
    bridge: Arc<ScriptBridge>,
    rcon: Arc<dyn RconClient>,
    kv: Arc<dyn KvRepository>,
    sink: SinkLogger,
    server_id: ServerId,
    workflow_id: WorkflowId,
    execution_id: ExecutionId,
    handle: tokio::runtime::Handle,
}

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

impl HostBindings {
    #[allow(clippy::too_many_lines)]
    fn register(self, engine: &mut Engine) {
        self.register_logging(engine);
        self.register_variables(engine);
        self.register_helpers(engine);
        self.register_rcon(engine);
        self.register_kv(engine);
    }

    fn register_logging(&self, engine: &mut Engine) {
        for (name, level) in [
            ("log", "info"),
            ("log_debug", "debug"),
            ("log_warn", "warn"),
            ("log_error", "error"),
        ] {
            let sink = self.sink.clone();
            let execution_id = self.execution_id;
            let workflow_id = self.workflow_id;
            let handle = self.handle.clone();
            engine.register_fn(name, move |message: &str| {
                match level {
                    "debug" => tracing::debug!(execution_id = %execution_id, "{message}"),
                    "warn" => tracing::warn!(execution_id = %execution_id, "{message}"),
                    "error" => tracing::error!(execution_id = %execution_id, "{message}"),
                    _ => tracing::info!(execution_id = %execution_id, "{message}"),
                }
                let sink = sink.clone();
                let message = message.to_string();
                handle.block_on(async move {
                    sink.message(&execution_id, &workflow_id, level, &message)
                        .await;
                });
            });
        }
    }

    fn register_variables(&self, engine: &mut Engine) {
        let bridge = Arc::clone(&self.bridge);
        engine.register_fn("get_variable", move |name: &str| -> Dynamic {
            bridge
                .variables
                .lock()
                .ok()
                .and_then(|vars| vars.get(name).map(|v| value_to_dynamic(v)))
                .unwrap_or(Dynamic::UNIT)
        });

        let bridge = Arc::clone(&self.bridge);
        engine.register_fn("set_variable", move |name: &str, value: Dynamic| {
            if let Ok(mut vars) = bridge.variables.lock() {
                vars.insert(name.to_string(), dynamic_to_value(&value));
            }
        });
    }

    fn register_helpers(&self, engine: &mut Engine) {
        engine.register_fn(
            "safe_get",
            |table: rhai::Map, key: &str, default: Dynamic| -> Dynamic {
                table.get(key).cloned().unwrap_or(default)
            },
        );

        engine.register_fn("to_string", |value: Dynamic, default: &str| -> String {
            if value.is_unit() {
                default.to_string()
            } else {
                value.to_string()
            }
        });

        engine.register_fn("json_encode", |value: Dynamic| -> ScriptResult<String> {
            let json = rhai::serde::from_dynamic::<serde_json::Value>(&value)?;
            serde_json::to_string(&json).map_err(|e| format!("json_encode failed: {e}").into())
        });

        engine.register_fn("json_decode", |text: &str| -> ScriptResult<Dynamic> {
            let json: serde_json::Value =
                serde_json::from_str(text).map_err(|e| format!("json_decode failed: {e}"))?;
            rhai::serde::to_dynamic(json)
        });
    }

    fn register_rcon(&self, engine: &mut Engine) {
        let execute = {
            let rcon = Arc::clone(&self.rcon);
            let server_id = self.server_id;
            let handle = self.handle.clone();
            move |command: String| -> ScriptResult<String> {
                let rcon = Arc::clone(&rcon);
                handle
                    .block_on(async move { rcon.execute(&server_id, &command).await })
                    .map_err(|e| e.to_string().into())
            }
        };

        {
            let execute = execute.clone();
            engine.register_fn("rcon_execute", move |command: &str| {
                execute(command.to_string())
            });
        }
        {
            let execute = execute.clone();
            engine.register_fn("rcon_kick", move |player: &str, reason: &str| {
                execute(format!("AdminKick \"{player}\" {reason}").trim_end().to_string())
            });
        }
        {
            let execute = execute.clone();
            engine.register_fn("rcon_kick", move |player: &str| {
                execute(format!("AdminKick \"{player}\""))
            });
        }
        {
            let execute = execute.clone();
            engine.register_fn(
                "rcon_ban",
                move |player: &str, days: i64, reason: &str| {
                    execute(format!("AdminBan \"{player}\" {days} {reason}").trim_end().to_string())
                },
            );
        }
        {
            let execute = execute.clone();
            engine.register_fn("rcon_ban", move |player: &str, days: i64| {
                execute(format!("AdminBan \"{player}\" {days}"))
            });
        }
        {
            let execute = execute.clone();
            engine.register_fn("rcon_warn", move |player: &str, message: &str| {
                execute(format!("AdminWarn \"{player}\" {message}"))
            });
        }
        {
            let execute = execute.clone();
            engine.register_fn("rcon_broadcast", move |message: &str| {
                execute(format!("AdminBroadcast {message}"))
            });
        }
        {
            engine.register_fn("rcon_chat_message", move |player: &str, message: &str| {
                execute(format!("AdminChatMessage \"{player}\" {message}"))
            });
        }
    }

    fn register_kv(&self, engine: &mut Engine) {
        let kv = Arc::clone(&self.kv);
        let workflow_id = self.workflow_id;
        let handle = self.handle.clone();
        engine.register_fn("kv_get", move |key: &str| -> ScriptResult<Dynamic> {
            let kv = Arc::clone(&kv);
            let key = key.to_string();
            handle
                .block_on(async move { kv.get(&workflow_id, &key).await })
                .map(|v| v.map_or(Dynamic::UNIT, |v| value_to_dynamic(&v)))
                .map_err(|e| e.to_string().into())
        });

        let kv = Arc::clone(&self.kv);
        let workflow_id = self.workflow_id;
        let handle = self.handle.clone();
        engine.register_fn(
            "kv_set",
            move |key: &str, value: Dynamic| -> ScriptResult<()> {
                let kv = Arc::clone(&kv);
                let key = key.to_string();
                let value = dynamic_to_value(&value);
                handle
                    .block_on(async move { kv.set(&workflow_id, &key, &value).await })
                    .map_err(|e| e.to_string().into())
            },
        );

        let kv = Arc::clone(&self.kv);
        let workflow_id = self.workflow_id;
        let handle = self.handle.clone();
        engine.register_fn("kv_delete", move |key: &str| -> ScriptResult<bool> {
            let kv = Arc::clone(&kv);
            let key = key.to_string();
            handle
                .block_on(async move { kv.delete(&workflow_id, &key).await })
                .map_err(|e| e.to_string().into())
        });

        let kv = Arc::clone(&self.kv);
        let workflow_id = self.workflow_id;
        let handle = self.handle.clone();
        engine.register_fn("kv_exists", move |key: &str| -> ScriptResult<bool> {
            let kv = Arc::clone(&kv);
            let key = key.to_string();
            handle
                .block_on(async move { kv.exists(&workflow_id, &key).await })
                .map_err(|e| e.to_string().into())
        });

        let kv = Arc::clone(&self.kv);
        let workflow_id = self.workflow_id;
        let handle = self.handle.clone();
        engine.register_fn("kv_list", move || -> ScriptResult<rhai::Array> {
            let kv = Arc::clone(&kv);
            handle
                .block_on(async move { kv.list_keys(&workflow_id).await })
                .map(|keys| keys.into_iter().map(Dynamic::from).collect())
                .map_err(|e| e.to_string().into())
        });

        let kv = Arc::clone(&self.kv);
        let workflow_id = self.workflow_id;
        let handle = self.handle.clone();
        engine.register_fn("kv_count", move || -> ScriptResult<i64> {
            let kv = Arc::clone(&kv);
            handle
                .block_on(async move { kv.count(&workflow_id).await })
                .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
                .map_err(|e| e.to_string().into())
        });

        let kv = Arc::clone(&self.kv);
        let workflow_id = self.workflow_id;
        let handle = self.handle.clone();
        engine.register_fn("kv_get_all", move || -> ScriptResult<Dynamic> {
            let kv = Arc::clone(&kv);
            handle
                .block_on(async move { kv.get_all(&workflow_id).await })
                .map(|entries| value_to_dynamic(&Value::Map(entries)))
                .map_err(|e| e.to_string().into())
        });

        let kv = Arc::clone(&self.kv);
        let workflow_id = self.workflow_id;
        let handle = self.handle.clone();
        engine.register_fn("kv_clear", move || -> ScriptResult<i64> {
            let kv = Arc::clone(&kv);
            handle
                .block_on(async move { kv.clear(&workflow_id).await })
                .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
                .map_err(|e| e.to_string().into())
        });
    }
}
