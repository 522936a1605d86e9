//! Variable step handler
//!
//! Mutates execution variables: set / increment / decrement / append /
//! prepend / delete / copy / transform.

use std::collections::BTreeMap;

use async_trait::async_trait;

use garrison_domain::{StepConfig, StepKind, Value};

use crate::context::ExecutionContext;

use super::{cfg_rendered, cfg_str, StepError, StepHandler, StepOutcome, StepServices};

/// Handler for `variable` steps
pub struct VariableStepHandler;

#[async_trait]
impl StepHandler for VariableStepHandler {
    async fn execute(
        &self,
        step: &StepConfig,
        ctx: &mut ExecutionContext,
        _services: &StepServices,
    ) -> Result<StepOutcome, StepError> {
        let operation = cfg_str(&step.config, "operation")
            .ok_or_else(|| StepError::InvalidConfig("missing required field 'operation'".to_string()))?;
        let name = cfg_rendered(&step.config, "variable_name", ctx)?;

        let output = match operation.as_str() {
            "set" => op_set(step, ctx, &name)?,
            "increment" => op_numeric(step, ctx, &name, 1)?,
            "decrement" => op_numeric(step, ctx, &name, -1)?,
            "append" => op_append(step, ctx, &name)?,
            "prepend" => op_prepend(step, ctx, &name)?,
            "delete" => op_delete(ctx, &name),
            "copy" => op_copy(step, ctx, &name)?,
            "transform" => op_transform(step, ctx, &name)?,
            unknown => {
                return Err(StepError::InvalidConfig(format!(
                    "unknown variable operation '{unknown}'"
                )))
            }
        };

        Ok(StepOutcome::output(output))
    }

    fn kind(&self) -> StepKind {
        StepKind::Variable
    }
}

fn result_map(name: &str, operation: &str, entries: Vec<(&str, Value)>) -> Value {
    let mut map = BTreeMap::new();
    map.insert("variable".to_string(), Value::String(name.to_string()));
    map.insert(
        "operation".to_string(),
        Value::String(operation.to_string()),
    );
    for (key, value) in entries {
        map.insert(key.to_string(), value);
    }
    Value::Map(map)
}

/// `set`: from a literal value, a dotted source field, or an expression
fn op_set(step: &StepConfig, ctx: &mut ExecutionContext, name: &str) -> Result<Value, StepError> {
    let value = if let Some(value) = step.config.resolve_path("value") {
        match value {
            Value::String(s) => Value::String(ctx.render(s)),
            other => other.clone(),
        }
    } else if let Some(source) = cfg_str(&step.config, "source_field") {
        ctx.combined_view()
            .resolve_path(&source)
            .cloned()
            .unwrap_or(Value::Null)
    } else if let Some(expression) = cfg_str(&step.config, "expression") {
        coerce_scalar(&ctx.render(&expression))
    } else {
        return Err(StepError::InvalidConfig(
            "set requires one of 'value', 'source_field', or 'expression'".to_string(),
        ));
    };

    ctx.variables.insert(name.to_string(), value.clone());
    Ok(result_map(name, "set", vec![("value", value)]))
}

/// `increment` / `decrement`: numeric; a missing variable counts as 0
fn op_numeric(
    step: &StepConfig,
    ctx: &mut ExecutionContext,
    name: &str,
    sign: i64,
) -> Result<Value, StepError> {
    let amount = step
        .config
        .resolve_path("value")
        .map_or(Some(1.0), Value::as_f64)
        .ok_or_else(|| StepError::InvalidConfig("increment amount is not numeric".to_string()))?;

    let current = ctx.variables.get(name).cloned().unwrap_or(Value::Int(0));
    let old = current.as_f64().ok_or_else(|| {
        StepError::InvalidConfig(format!("variable '{name}' is not numeric"))
    })?;

    let new = old + (sign as f64) * amount;
    let new_value = if new.fract() == 0.0 && new.abs() < (i64::MAX as f64) {
        Value::Int(new as i64)
    } else {
        Value::Float(new)
    };

    ctx.variables.insert(name.to_string(), new_value.clone());
    let operation = if sign >= 0 { "increment" } else { "decrement" };
    Ok(result_map(
        name,
        operation,
        vec![
            ("old_value", current),
            ("new_value", new_value),
        ],
    ))
}

/// `append`: string concatenation or list push, by current type
fn op_append(step: &StepConfig, ctx: &mut ExecutionContext, name: &str) -> Result<Value, StepError> {
    let addition = appended_value(step, ctx)?;

    let new_value = match ctx.variables.get(name) {
        Some(Value::List(items)) => {
            let mut items = items.clone();
            items.push(addition);
            Value::List(items)
        }
        Some(current) => Value::String(format!(
            "{}{}",
            current.canonical_string(),
            addition.canonical_string()
        )),
        None => Value::String(addition.canonical_string()),
    };

    ctx.variables.insert(name.to_string(), new_value.clone());
    Ok(result_map(name, "append", vec![("new_value", new_value)]))
}

/// `prepend`: string-only
fn op_prepend(
    step: &StepConfig,
    ctx: &mut ExecutionContext,
    name: &str,
) -> Result<Value, StepError> {
    let addition = appended_value(step, ctx)?;

    let new_value = match ctx.variables.get(name) {
        Some(Value::List(_)) => {
            return Err(StepError::InvalidConfig(
                "prepend only supports string variables".to_string(),
            ))
        }
        Some(current) => Value::String(format!(
            "{}{}",
            addition.canonical_string(),
            current.canonical_string()
        )),
        None => Value::String(addition.canonical_string()),
    };

    ctx.variables.insert(name.to_string(), new_value.clone());
    Ok(result_map(name, "prepend", vec![("new_value", new_value)]))
}

fn appended_value(step: &StepConfig, ctx: &ExecutionContext) -> Result<Value, StepError> {
    let value = step
        .config
        .resolve_path("value")
        .ok_or_else(|| StepError::InvalidConfig("missing required field 'value'".to_string()))?;
    Ok(match value {
        Value::String(s) => Value::String(ctx.render(s)),
        other => other.clone(),
    })
}

/// `delete`: remove the variable, recording whether it existed
fn op_delete(ctx: &mut ExecutionContext, name: &str) -> Value {
    let existed = ctx.variables.remove(name).is_some();
    result_map(name, "delete", vec![("existed", Value::Bool(existed))])
}

/// `copy`: duplicate another variable's value
fn op_copy(step: &StepConfig, ctx: &mut ExecutionContext, name: &str) -> Result<Value, StepError> {
    let source = cfg_str(&step.config, "source_variable").ok_or_else(|| {
        StepError::InvalidConfig("missing required field 'source_variable'".to_string())
    })?;

    let value = ctx
        .variables
        .get(&source)
        .cloned()
        .ok_or_else(|| StepError::InvalidConfig(format!("source variable '{source}' not set")))?;

    ctx.variables.insert(name.to_string(), value.clone());
    Ok(result_map(
        name,
        "copy",
        vec![("source", Value::String(source)), ("value", value)],
    ))
}

/// `transform`: apply a named transform to the variable in place
fn op_transform(
    step: &StepConfig,
    ctx: &mut ExecutionContext,
    name: &str,
) -> Result<Value, StepError> {
    let transform = cfg_str(&step.config, "transform").ok_or_else(|| {
        StepError::InvalidConfig("missing required field 'transform'".to_string())
    })?;

    let current = ctx
        .variables
        .get(name)
        .cloned()
        .ok_or_else(|| StepError::InvalidConfig(format!("variable '{name}' not set")))?;

    let result = match transform.as_str() {
        "uppercase" => Value::String(current.canonical_string().to_uppercase()),
        "lowercase" => Value::String(current.canonical_string().to_lowercase()),
        "trim" => Value::String(current.canonical_string().trim().to_string()),
        "length" => match &current {
            Value::List(items) => Value::Int(items.len() as i64),
            Value::Map(m) => Value::Int(m.len() as i64),
            other => Value::Int(other.canonical_string().chars().count() as i64),
        },
        "reverse" => match &current {
            Value::List(items) => Value::List(items.iter().rev().cloned().collect()),
            other => Value::String(other.canonical_string().chars().rev().collect()),
        },
        "json_encode" => Value::String(
            serde_json::to_string(&current.to_json())
                .map_err(|e| StepError::InvalidConfig(format!("json_encode failed: {e}")))?,
        ),
        "json_decode" => {
            let text = current.canonical_string();
            let parsed: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| StepError::InvalidConfig(format!("json_decode failed: {e}")))?;
            Value::from_json(parsed)
        }
        unknown => {
            return Err(StepError::InvalidConfig(format!(
                "unknown transform '{unknown}'"
            )))
        }
    };

    ctx.variables.insert(name.to_string(), result.clone());
    Ok(result_map(
        name,
        "transform",
        vec![
            ("transform", Value::String(transform)),
            ("result", result),
        ],
    ))
}

/// Best-effort scalar coercion for `set` expressions
fn coerce_scalar(text: &str) -> Value {
    let trimmed = text.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Value::Int(n);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Value::Float(f);
    }
    Value::String(text.to_string())
}
