//! Condition evaluation over nested event and context data
//!
//! Evaluates field/operator/value predicates against a combined data view.
//! The evaluator never errors: unknown operators and failed coercions
//! evaluate to false so a bad condition cannot take down an execution.

use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

use garrison_domain::{ConditionConfig, Value};

/// How multiple conditions combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConditionLogic {
    /// All conditions must hold (short-circuits on first false)
    #[default]
    And,
    /// Any condition may hold (short-circuits on first true)
    Or,
}

impl ConditionLogic {
    /// Parse from a config string; anything but `OR`/`or` means AND
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("or") {
            Self::Or
        } else {
            Self::And
        }
    }
}

/// Evaluate a list of conditions against a data view.
///
/// An empty condition list is vacuously true.
#[must_use]
pub fn evaluate_conditions(
    conditions: &[ConditionConfig],
    data: &Value,
    logic: ConditionLogic,
) -> bool {
    if conditions.is_empty() {
        return true;
    }

    match logic {
        ConditionLogic::And => conditions.iter().all(|c| evaluate_condition(c, data)),
        ConditionLogic::Or => conditions.iter().any(|c| evaluate_condition(c, data)),
    }
}

/// Evaluate a single condition against a data view.
#[must_use]
pub fn evaluate_condition(condition: &ConditionConfig, data: &Value) -> bool {
    let field = data
        .resolve_path(&condition.field)
        .cloned()
        .unwrap_or(Value::Null);

    match condition.operator.as_str() {
        "equals" => eval_equals(&field, &condition.value),
        "not_equals" => !eval_equals(&field, &condition.value),
        "contains" => eval_substring(&field, &condition.value, |h, n| h.contains(n)),
        "not_contains" => !eval_substring(&field, &condition.value, |h, n| h.contains(n)),
        "starts_with" => eval_substring(&field, &condition.value, |h, n| h.starts_with(n)),
        "ends_with" => eval_substring(&field, &condition.value, |h, n| h.ends_with(n)),
        "regex" => eval_regex(&field, &condition.value),
        "greater_than" => eval_numeric(&field, &condition.value, |l, r| l > r),
        "less_than" => eval_numeric(&field, &condition.value, |l, r| l < r),
        "greater_or_equal" => eval_numeric(&field, &condition.value, |l, r| l >= r),
        "less_or_equal" => eval_numeric(&field, &condition.value, |l, r| l <= r),
        "in" => eval_membership(&field, &condition.value),
        "not_in" => !eval_membership(&field, &condition.value),
        "is_null" => field.is_null(),
        "is_not_null" => !field.is_null(),
        unknown => {
            tracing::warn!(operator = unknown, field = %condition.field,
                "unknown condition operator, evaluating to false");
            false
        }
    }
}

/// Canonical-string equality
fn eval_equals(field: &Value, value: &Value) -> bool {
    field.canonical_string() == value.canonical_string()
}

/// Substring-family operators; an empty side makes the positive form false
fn eval_substring(field: &Value, value: &Value, op: impl Fn(&str, &str) -> bool) -> bool {
    let haystack = field.canonical_string();
    let needle = value.canonical_string();
    if haystack.is_empty() || needle.is_empty() {
        return false;
    }
    op(&haystack, &needle)
}

/// Numeric comparison over f64 coercions; failed coercion is false
fn eval_numeric(field: &Value, value: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (field.as_f64(), value.as_f64()) {
        (Some(l), Some(r)) => op(l, r),
        _ => false,
    }
}

/// Membership against a list or a comma-separated string
fn eval_membership(field: &Value, value: &Value) -> bool {
    let needle = field.canonical_string();
    match value {
        Value::List(items) => items.iter().any(|v| v.canonical_string() == needle),
        Value::String(s) if s.is_empty() => false,
        Value::String(s) => s.split(',').any(|part| part.trim() == needle),
        Value::Null => false,
        other => other.canonical_string() == needle,
    }
}

/// Regex match; an empty or invalid pattern is false, invalid patterns are
/// logged once per pattern
fn eval_regex(field: &Value, value: &Value) -> bool {
    let pattern = value.canonical_string();
    if pattern.is_empty() {
        return false;
    }

    match regex::Regex::new(&pattern) {
        Ok(re) => re.is_match(&field.canonical_string()),
        Err(e) => {
            static WARNED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
            let warned = WARNED.get_or_init(|| Mutex::new(HashSet::new()));
            if let Ok(mut seen) = warned.lock() {
                if seen.insert(pattern.clone()) {
                    tracing::warn!(pattern = %pattern, error = %e, "invalid condition regex");
                }
            }
            false
        }
    }
}
