//! Span filter matching: dot-notation field extraction plus operator dispatch.

use serde_json::Value;
use tracing::warn;

use crate::model::{FilterClause, Operator, SpanEvent};

/// Walks a dot-notation path (`"metadata.user.id"`) into a JSON value.
/// Missing segments and non-object intermediates both yield `None`.
pub fn extract_field<'a>(payload: &'a Value, field: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in field.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn as_comparable_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Evaluates a single clause against a span's JSON payload.
///
/// An unknown operator (one that fails to parse) is treated as a non-match
/// filter that does not reject the span; per the graceful-degradation policy
/// the caller logs a warning and the evaluator simply matches fewer spans than
/// intended rather than crashing the worker.
fn is_empty_value(field_value: Option<&Value>) -> bool {
    match field_value {
        None => true,
        Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

fn string_compare(
    field_value: &Value,
    target: &Value,
    compare: impl Fn(&str, &str) -> bool,
    default_on_non_string: bool,
) -> bool {
    match (field_value.as_str(), target.as_str()) {
        (Some(haystack), Some(needle)) => compare(haystack, needle),
        _ => default_on_non_string,
    }
}

fn numeric_compare(field_value: &Value, target: &Value, compare: impl Fn(f64, f64) -> bool) -> bool {
    match (as_f64(field_value), as_f64(target)) {
        (Some(lhs), Some(rhs)) => compare(lhs, rhs),
        _ => false,
    }
}

/// A regex clause whose pattern fails to compile is treated as matched
/// (graceful degradation) rather than failing the whole batch; the
/// compile error is logged so the bad pattern is still observable.
fn regex_compare(field_value: &Value, clause: &FilterClause) -> bool {
    let Some(pattern) = clause.value.as_str() else {
        return false;
    };
    match regex::Regex::new(pattern) {
        Ok(re) => as_comparable_str(field_value).is_some_and(|candidate| re.is_match(&candidate)),
        Err(err) => {
            warn!(field = %clause.field, pattern = %pattern, error = %err, "regex filter failed to compile, treating clause as matched");
            true
        }
    }
}

pub fn matches_clause(payload: &Value, clause: &FilterClause) -> bool {
    let Some(operator) = clause.operator() else {
        return true;
    };

    let field_value = extract_field(payload, &clause.field);

    match operator {
        Operator::IsEmpty => return is_empty_value(field_value),
        Operator::IsNotEmpty => return !is_empty_value(field_value),
        _ => {}
    }

    let Some(field_value) = field_value else {
        // Missing field never satisfies a comparison operator.
        return false;
    };

    match operator {
        Operator::Equals => field_value == &clause.value,
        Operator::NotEquals => field_value != &clause.value,
        Operator::Contains => string_compare(field_value, &clause.value, str::contains, false),
        Operator::NotContains => {
            string_compare(field_value, &clause.value, |h, n| !h.contains(n), true)
        }
        Operator::StartsWith => {
            string_compare(field_value, &clause.value, str::starts_with, false)
        }
        Operator::EndsWith => string_compare(field_value, &clause.value, str::ends_with, false),
        Operator::Regex => regex_compare(field_value, clause),
        Operator::Gt => numeric_compare(field_value, &clause.value, |l, r| l > r),
        Operator::Gte => numeric_compare(field_value, &clause.value, |l, r| l >= r),
        Operator::Lt => numeric_compare(field_value, &clause.value, |l, r| l < r),
        Operator::Lte => numeric_compare(field_value, &clause.value, |l, r| l <= r),
        Operator::IsEmpty | Operator::IsNotEmpty => is_empty_value(Some(field_value)),
    }
}

/// Whether a span satisfies an evaluator's `span_names` allowlist and all of
/// its filter clauses (logical AND, empty filter list always matches).
pub fn span_matches(event: &SpanEvent, span_names: &[String], filter: &[FilterClause]) -> bool {
    if !span_names.is_empty() {
        let matches_name = event
            .span_name
            .as_deref()
            .is_some_and(|name| span_names.iter().any(|allowed| allowed == name));
        if !matches_name {
            return false;
        }
    }

    filter.iter().all(|clause| matches_clause(&event.payload, clause))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn clause(field: &str, op: &str, value: Value) -> FilterClause {
        FilterClause {
            field: field.to_string(),
            raw_operator: op.to_string(),
            value,
        }
    }

    fn span(payload: Value) -> SpanEvent {
        SpanEvent {
            event_type: "span".to_string(),
            trace_id: Uuid::now_v7(),
            span_id: Uuid::now_v7(),
            span_name: Some("llm_call".to_string()),
            payload,
        }
    }

    #[test]
    fn extracts_nested_field() {
        let payload = json!({ "metadata": { "user": { "id": "abc" } } });
        assert_eq!(
            extract_field(&payload, "metadata.user.id"),
            Some(&json!("abc"))
        );
        assert_eq!(extract_field(&payload, "metadata.user.missing"), None);
        assert_eq!(extract_field(&payload, "metadata.absent.id"), None);
    }

    #[test]
    fn equals_and_not_equals() {
        let payload = json!({ "status": "ok" });
        assert!(matches_clause(&payload, &clause("status", "equals", json!("ok"))));
        assert!(!matches_clause(&payload, &clause("status", "eq", json!("fail"))));
        assert!(matches_clause(&payload, &clause("status", "not_equals", json!("fail"))));
    }

    #[test]
    fn contains_requires_strings() {
        let payload = json!({ "text": "hello world" });
        assert!(matches_clause(&payload, &clause("text", "contains", json!("world"))));
        assert!(!matches_clause(&payload, &clause("text", "contains", json!("bye"))));
    }

    #[test]
    fn numeric_comparisons() {
        let payload = json!({ "score": 42 });
        assert!(matches_clause(&payload, &clause("score", "gt", json!(10))));
        assert!(!matches_clause(&payload, &clause("score", "lt", json!(10))));
        assert!(matches_clause(&payload, &clause("score", "gte", json!(42))));
    }

    #[test]
    fn is_empty_and_not_empty() {
        let payload = json!({ "tags": [] , "name": "x"});
        assert!(matches_clause(&payload, &clause("tags", "is_empty", Value::Null)));
        assert!(matches_clause(&payload, &clause("name", "is_not_empty", Value::Null)));
        assert!(matches_clause(&payload, &clause("missing", "is_empty", Value::Null)));
    }

    #[test]
    fn regex_match() {
        let payload = json!({ "text": "order #12345" });
        assert!(matches_clause(&payload, &clause("text", "regex", json!(r"#\d+"))));
        assert!(!matches_clause(&payload, &clause("text", "regex", json!(r"^\d+$"))));
    }

    #[test]
    fn invalid_regex_degrades_to_a_match_instead_of_erroring() {
        let payload = json!({ "text": "abc" });
        assert!(matches_clause(&payload, &clause("text", "regex", json!("("))));
    }

    #[test]
    fn unknown_operator_matches_without_erroring() {
        let payload = json!({ "text": "abc" });
        assert!(matches_clause(&payload, &clause("text", "soundex", json!("abc"))));
    }

    #[test]
    fn span_matches_combines_name_allowlist_and_filters() {
        let event = span(json!({ "status": "ok" }));
        assert!(span_matches(
            &event,
            &["llm_call".to_string()],
            &[clause("status", "equals", json!("ok"))]
        ));
        assert!(!span_matches(&event, &["other_span".to_string()], &[]));
    }

    #[test]
    fn span_matches_degrades_on_invalid_regex_without_aborting_remaining_clauses() {
        let event = span(json!({ "text": "abc", "status": "ok" }));
        assert!(span_matches(
            &event,
            &[],
            &[
                clause("text", "regex", json!("(")),
                clause("status", "equals", json!("ok")),
            ]
        ));
        assert!(!span_matches(
            &event,
            &[],
            &[
                clause("text", "regex", json!("(")),
                clause("status", "equals", json!("fail")),
            ]
        ));
    }
}
