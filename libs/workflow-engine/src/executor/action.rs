//! Action step handler
//!
//! Dispatches on `config.action_type`: RCON moderation commands, HTTP
//! requests, webhooks, Discord messages, log messages, variable sets, and
//! inline scripts. All string fields are template-resolved before use.

use std::collections::BTreeMap;

use async_trait::async_trait;

use garrison_domain::{StepConfig, StepKind, Value};

use crate::context::ExecutionContext;

use super::script::run_script;
use super::{
    cfg_flag, cfg_rendered, cfg_rendered_opt, cfg_str, StepError, StepHandler, StepOutcome,
    StepServices,
};

/// Handler for `action` steps
pub struct ActionStepHandler;

#[async_trait]
impl StepHandler for ActionStepHandler {
    async fn execute(
        &self,
        step: &StepConfig,
        ctx: &mut ExecutionContext,
        services: &StepServices,
    ) -> Result<StepOutcome, StepError> {
        let action_type = cfg_str(&step.config, "action_type")
            .ok_or_else(|| StepError::InvalidConfig("missing required field 'action_type'".to_string()))?;

        match action_type.as_str() {
            "rcon_command" => {
                let command = cfg_rendered(&step.config, "command", ctx)?;
                send_rcon(ctx, services, command).await
            }
            "admin_broadcast" => {
                let message = cfg_rendered(&step.config, "message", ctx)?;
                send_rcon(ctx, services, format!("AdminBroadcast {message}")).await
            }
            "chat_message" => {
                let message = cfg_rendered(&step.config, "message", ctx)?;
                let player = cfg_rendered(&step.config, "target_player", ctx)?;
                send_rcon(ctx, services, format!("AdminChatMessage \"{player}\" {message}")).await
            }
            "kick_player" => {
                let player = cfg_rendered(&step.config, "player_id", ctx)?;
                let reason = cfg_rendered_opt(&step.config, "reason", ctx).unwrap_or_default();
                let command = format!("AdminKick \"{player}\" {reason}");
                send_rcon(ctx, services, command.trim_end().to_string()).await
            }
            "ban_player" => {
                let player = cfg_rendered(&step.config, "player_id", ctx)?;
                let duration = step
                    .config
                    .resolve_path("duration")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| {
                        StepError::InvalidConfig("missing required field 'duration'".to_string())
                    })?;
                let reason = cfg_rendered_opt(&step.config, "reason", ctx).unwrap_or_default();
                let command = format!("AdminBan \"{player}\" {duration} {reason}");
                send_rcon(ctx, services, command.trim_end().to_string()).await
            }
            "warn_player" => {
                let player = cfg_rendered(&step.config, "player_id", ctx)?;
                let message = cfg_rendered(&step.config, "message", ctx)?;
                send_rcon(ctx, services, format!("AdminWarn \"{player}\" {message}")).await
            }
            "http_request" => http_request(step, ctx, services).await,
            "webhook" => webhook(step, ctx, services).await,
            "discord_message" => discord_message(step, ctx, services).await,
            "log_message" => log_message(step, ctx, services).await,
            "set_variable" => set_variable(step, ctx),
            "script" => run_script(step, ctx, services).await,
            unknown => Err(StepError::InvalidConfig(format!(
                "unknown action type '{unknown}'"
            ))),
        }
    }

    fn kind(&self) -> StepKind {
        StepKind::Action
    }
}

/// Send a command via RCON and store command/response as the step output
async fn send_rcon(
    ctx: &ExecutionContext,
    services: &StepServices,
    command: String,
) -> Result<StepOutcome, StepError> {
    if services.is_cancelled() {
        return Err(StepError::Cancelled);
    }

    let response = services
        .rcon
        .execute(&ctx.server_id, &command)
        .await
        .map_err(|e| StepError::ActionFailed(e.to_string()))?;

    let mut output = BTreeMap::new();
    output.insert("command".to_string(), Value::String(command));
    output.insert("response".to_string(), Value::String(response));
    Ok(StepOutcome::output(Value::Map(output)))
}

/// Execute an HTTP request with the configured method, headers, and body
async fn http_request(
    step: &StepConfig,
    ctx: &ExecutionContext,
    services: &StepServices,
) -> Result<StepOutcome, StepError> {
    let url = cfg_rendered(&step.config, "url", ctx)?;
    let method = cfg_rendered_opt(&step.config, "method", ctx)
        .unwrap_or_else(|| "GET".to_string())
        .to_uppercase();
    let fail_on_error = cfg_flag(&step.config, "fail_on_error");

    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| StepError::InvalidConfig(format!("invalid http method '{method}'")))?;

    let mut request = services.http.request(method, &url);
    request = apply_headers(request, &step.config, ctx);
    if let Some(body) = cfg_rendered_opt(&step.config, "body", ctx) {
        request = request.body(body);
    }

    let response = send_with_cancel(request, services).await?;
    let status = response.status().as_u16();

    let mut headers = BTreeMap::new();
    for (name, value) in response.headers() {
        headers.insert(
            name.to_string(),
            Value::String(value.to_str().unwrap_or_default().to_string()),
        );
    }
    let body = response.text().await.unwrap_or_default();

    if fail_on_error && !(200..300).contains(&status) {
        return Err(StepError::ActionFailed(format!(
            "http request returned status {status}"
        )));
    }

    let mut output = BTreeMap::new();
    output.insert("status".to_string(), Value::Int(i64::from(status)));
    output.insert("body".to_string(), Value::String(body));
    output.insert("headers".to_string(), Value::Map(headers));
    Ok(StepOutcome::output(Value::Map(output)))
}

/// POST a JSON payload merged over the default execution envelope
async fn webhook(
    step: &StepConfig,
    ctx: &ExecutionContext,
    services: &StepServices,
) -> Result<StepOutcome, StepError> {
    let url = cfg_rendered(&step.config, "url", ctx)?;

    let mut envelope = BTreeMap::new();
    envelope.insert(
        "workflow_id".to_string(),
        Value::String(ctx.workflow_id.to_string()),
    );
    envelope.insert(
        "execution_id".to_string(),
        Value::String(ctx.execution_id.to_string()),
    );
    envelope.insert(
        "server_id".to_string(),
        Value::String(ctx.server_id.to_string()),
    );
    envelope.insert("trigger_event".to_string(), ctx.trigger_event.clone());
    envelope.insert("variables".to_string(), ctx.variables_value());
    envelope.insert("metadata".to_string(), ctx.metadata.clone());
    envelope.insert(
        "timestamp".to_string(),
        Value::Int(chrono::Utc::now().timestamp()),
    );

    if let Some(payload) = step.config.resolve_path("payload").and_then(Value::as_map) {
        for (key, value) in payload {
            envelope.insert(key.clone(), render_strings(value, ctx));
        }
    }

    let request = apply_headers(services.http.post(&url), &step.config, ctx)
        .json(&Value::Map(envelope));
    let response = send_with_cancel(request, services).await?;
    let status = response.status().as_u16();

    if !(200..300).contains(&status) {
        return Err(StepError::ActionFailed(format!(
            "webhook returned status {status}"
        )));
    }

    let mut output = BTreeMap::new();
    output.insert("status".to_string(), Value::Int(i64::from(status)));
    Ok(StepOutcome::output(Value::Map(output)))
}

/// POST a message to a Discord webhook; success is status 200 or 204
async fn discord_message(
    step: &StepConfig,
    ctx: &ExecutionContext,
    services: &StepServices,
) -> Result<StepOutcome, StepError> {
    let url = cfg_rendered(&step.config, "webhook_url", ctx)?;
    let message = cfg_rendered(&step.config, "message", ctx)?;

    let mut payload = BTreeMap::new();
    payload.insert("content".to_string(), Value::String(message));
    if let Some(username) = cfg_rendered_opt(&step.config, "username", ctx) {
        payload.insert("username".to_string(), Value::String(username));
    }
    if let Some(avatar_url) = cfg_rendered_opt(&step.config, "avatar_url", ctx) {
        payload.insert("avatar_url".to_string(), Value::String(avatar_url));
    }

    let request = services.http.post(&url).json(&Value::Map(payload));
    let response = send_with_cancel(request, services).await?;
    let status = response.status().as_u16();

    if status != 200 && status != 204 {
        return Err(StepError::ActionFailed(format!(
            "discord webhook returned status {status}"
        )));
    }

    let mut output = BTreeMap::new();
    output.insert("status".to_string(), Value::Int(i64::from(status)));
    Ok(StepOutcome::output(Value::Map(output)))
}

/// Emit to the local logger and the execution message log
async fn log_message(
    step: &StepConfig,
    ctx: &ExecutionContext,
    services: &StepServices,
) -> Result<StepOutcome, StepError> {
    let message = cfg_rendered(&step.config, "message", ctx)?;
    let level = cfg_rendered_opt(&step.config, "level", ctx).unwrap_or_else(|| "info".to_string());

    match level.as_str() {
        "debug" => tracing::debug!(execution_id = %ctx.execution_id, "{message}"),
        "warn" => tracing::warn!(execution_id = %ctx.execution_id, "{message}"),
        "error" => tracing::error!(execution_id = %ctx.execution_id, "{message}"),
        _ => tracing::info!(execution_id = %ctx.execution_id, "{message}"),
    }

    services
        .sink
        .message(&ctx.execution_id, &ctx.workflow_id, &level, &message)
        .await;

    let mut output = BTreeMap::new();
    output.insert("message".to_string(), Value::String(message));
    output.insert("level".to_string(), Value::String(level));
    Ok(StepOutcome::output(Value::Map(output)))
}

/// Set an execution variable
fn set_variable(step: &StepConfig, ctx: &mut ExecutionContext) -> Result<StepOutcome, StepError> {
    let name = cfg_rendered(&step.config, "variable_name", ctx)?;
    let value = step
        .config
        .resolve_path("variable_value")
        .cloned()
        .unwrap_or(Value::Null);
    let value = render_strings(&value, ctx);

    ctx.variables.insert(name.clone(), value.clone());

    let mut output = BTreeMap::new();
    output.insert("variable".to_string(), Value::String(name));
    output.insert("value".to_string(), value);
    Ok(StepOutcome::output(Value::Map(output)))
}

/// Apply configured headers (template-resolved) to an outgoing request
fn apply_headers(
    mut request: reqwest::RequestBuilder,
    config: &Value,
    ctx: &ExecutionContext,
) -> reqwest::RequestBuilder {
    if let Some(headers) = config.resolve_path("headers").and_then(Value::as_map) {
        for (name, value) in headers {
            request = request.header(name, ctx.render(&value.canonical_string()));
        }
    }
    request
}

/// Send a request, honoring cancellation; client-level timeout caps at 30 s
async fn send_with_cancel(
    request: reqwest::RequestBuilder,
    services: &StepServices,
) -> Result<reqwest::Response, StepError> {
    let mut cancel = services.cancel.clone();
    tokio::select! {
        result = request.send() => result.map_err(|e| {
            if e.is_timeout() {
                StepError::TimedOut("http request timed out".to_string())
            } else {
                StepError::ActionFailed(format!("http request failed: {e}"))
            }
        }),
        _ = cancel.wait_for(|cancelled| *cancelled) => Err(StepError::Cancelled),
    }
}

/// Template-resolve every string leaf of a value
fn render_strings(value: &Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => Value::String(ctx.render(s)),
        Value::List(items) => Value::List(items.iter().map(|v| render_strings(v, ctx)).collect()),
        Value::Map(m) => Value::Map(
            m.iter()
                .map(|(k, v)| (k.clone(), render_strings(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context_with_event, harness, step};
    use super::*;

    #[tokio::test]
    async fn test_kick_player_renders_template() {
        let h = harness();
        let mut ctx = context_with_event(serde_json::json!({
            "steam_id": "76500001", "message": "you slur"
        }));
        let step = step(
            "action",
            serde_json::json!({
                "action_type": "kick_player",
                "player_id": "${trigger_event.steam_id}",
                "reason": "Language"
            }),
        );

        let outcome = ActionStepHandler
            .execute(&step, &mut ctx, &h.services)
            .await
            .unwrap();

        assert_eq!(h.rcon.commands(), vec!["AdminKick \"76500001\" Language"]);
        assert_eq!(
            outcome.output.resolve_path("command"),
            Some(&Value::from("AdminKick \"76500001\" Language"))
        );
    }

    #[tokio::test]
    async fn test_admin_broadcast_wraps_message() {
        let h = harness();
        let mut ctx = context_with_event(serde_json::json!({}));
        let step = step(
            "action",
            serde_json::json!({ "action_type": "admin_broadcast", "message": "map change soon" }),
        );

        ActionStepHandler
            .execute(&step, &mut ctx, &h.services)
            .await
            .unwrap();
        assert_eq!(h.rcon.commands(), vec!["AdminBroadcast map change soon"]);
    }

    #[tokio::test]
    async fn test_ban_player_command_shape() {
        let h = harness();
        let mut ctx = context_with_event(serde_json::json!({ "steam_id": "765" }));
        let step = step(
            "action",
            serde_json::json!({
                "action_type": "ban_player",
                "player_id": "${trigger_event.steam_id}",
                "duration": 7,
                "reason": "cheating"
            }),
        );

        ActionStepHandler
            .execute(&step, &mut ctx, &h.services)
            .await
            .unwrap();
        assert_eq!(h.rcon.commands(), vec!["AdminBan \"765\" 7 cheating"]);
    }

    #[tokio::test]
    async fn test_rcon_failure_is_retryable() {
        let h = harness();
        h.rcon.script_failures(1, "server offline");
        let mut ctx = context_with_event(serde_json::json!({}));
        let step = step(
            "action",
            serde_json::json!({ "action_type": "rcon_command", "command": "ListPlayers" }),
        );

        let err = ActionStepHandler
            .execute(&step, &mut ctx, &h.services)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unknown_action_type_fails_validation() {
        let h = harness();
        let mut ctx = context_with_event(serde_json::json!({}));
        let step = step("action", serde_json::json!({ "action_type": "teleport" }));

        let err = ActionStepHandler
            .execute(&step, &mut ctx, &h.services)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_set_variable_mutates_context() {
        let h = harness();
        let mut ctx = context_with_event(serde_json::json!({ "steam_id": "765" }));
        let step = step(
            "action",
            serde_json::json!({
                "action_type": "set_variable",
                "variable_name": "last_player",
                "variable_value": "${trigger_event.steam_id}"
            }),
        );

        ActionStepHandler
            .execute(&step, &mut ctx, &h.services)
            .await
            .unwrap();
        assert_eq!(ctx.variables.get("last_player"), Some(&Value::from("765")));
    }

    #[tokio::test]
    async fn test_log_message_reaches_sink() {
        let h = harness();
        let mut ctx = context_with_event(serde_json::json!({}));
        let step = step(
            "action",
            serde_json::json!({
                "action_type": "log_message",
                "message": "execution ${metadata.execution_id} running",
                "level": "warn"
            }),
        );

        ActionStepHandler
            .execute(&step, &mut ctx, &h.services)
            .await
            .unwrap();

        let messages = h.sink.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1, "warn");
        assert!(messages[0].2.contains(&ctx.execution_id.to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_rcon_step() {
        let h = harness();
        h.cancel_tx.send(true).unwrap();
        let mut ctx = context_with_event(serde_json::json!({}));
        let step = step(
            "action",
            serde_json::json!({ "action_type": "rcon_command", "command": "ping" }),
        );

        let err = ActionStepHandler
            .execute(&step, &mut ctx, &h.services)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Cancelled));
        assert!(!err.is_retryable());
    }
}
