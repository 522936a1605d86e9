//! String templating over the combined context view
//!
//! Replaces `${dotted.path}` references with the canonical string form of the
//! resolved value. One pass, left to right; values substituted into the
//! output are not re-scanned.

use garrison_domain::Value;

/// Render a template string against a data view.
///
/// Missing or null paths render as the empty string. A `$` not followed by
/// `{` is literal, as is an unterminated `${`.
#[must_use]
pub fn render(text: &str, view: &Value) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let path = &after[..end];
                if let Some(value) = view.resolve_path(path.trim()) {
                    out.push_str(&value.canonical_string());
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated token stays literal
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> Value {
        Value::from_json(serde_json::json!({
            "name": "raven",
            "count": 3,
            "trigger_event": { "steam_id": "76500001" },
            "metadata": { "server_id": "srv-1" },
            "weird": "${name}"
        }))
    }

    #[test]
    fn test_basic_substitution() {
        assert_eq!(render("hello ${name}", &view()), "hello raven");
        assert_eq!(
            render("kick ${trigger_event.steam_id} now", &view()),
            "kick 76500001 now"
        );
    }

    #[test]
    fn test_missing_and_null_render_empty() {
        assert_eq!(render("x${nope}y", &view()), "xy");
        assert_eq!(render("x${trigger_event.absent.deep}y", &view()), "xy");
    }

    #[test]
    fn test_dollar_without_brace_is_literal() {
        assert_eq!(render("cost: $5", &view()), "cost: $5");
        assert_eq!(render("a$b${count}", &view()), "a$b3");
    }

    #[test]
    fn test_unterminated_token_is_literal() {
        assert_eq!(render("x${name", &view()), "x${name");
    }

    #[test]
    fn test_single_pass_no_recursion() {
        // The substituted value contains a token, which must not be expanded
        assert_eq!(render("v=${weird}", &view()), "v=${name}");
    }

    #[test]
    fn test_idempotent_on_static_output() {
        let v = view();
        let once = render("hi ${name}, id ${trigger_event.steam_id}", &v);
        assert_eq!(render(&once, &v), once);
    }

    #[test]
    fn test_multiple_tokens() {
        assert_eq!(
            render("${name}-${count}-${name}", &view()),
            "raven-3-raven"
        );
    }
}
