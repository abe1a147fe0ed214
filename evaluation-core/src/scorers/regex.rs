//! Regular-expression scorer with ReDoS protection.

use regex::Regex;
use serde_json::Value;

use crate::model::{ScoreOutput, ScoreValueType};
use crate::scorers::error::ScorerError;

const MAX_PATTERN_LEN: usize = 200;
const MAX_STAR_COUNT: usize = 10;

fn guard_pattern(pattern: &str) -> Result<(), ScorerError> {
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(ScorerError::RedosRejected {
            reason: format!("pattern length {} exceeds {MAX_PATTERN_LEN}", pattern.len()),
        });
    }
    let star_count = pattern.matches('*').count();
    if star_count > MAX_STAR_COUNT {
        return Err(ScorerError::RedosRejected {
            reason: format!("pattern has {star_count} '*' characters, limit is {MAX_STAR_COUNT}"),
        });
    }
    Ok(())
}

/// Runs the regex scorer. Empty `text` is a successful no-op (no scores).
pub fn run(config: &Value, text: &str) -> Result<Vec<ScoreOutput>, ScorerError> {
    let pattern = config
        .get("pattern")
        .and_then(Value::as_str)
        .ok_or(ScorerError::MissingField("pattern"))?;
    guard_pattern(pattern)?;

    let score_name = config
        .get("score_name")
        .and_then(Value::as_str)
        .unwrap_or("regex_match");
    let match_score = config
        .get("match_score")
        .and_then(Value::as_f64)
        .unwrap_or(1.0);
    let no_match_score = config
        .get("no_match_score")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let capture_group = config
        .get("capture_group")
        .and_then(Value::as_u64)
        .map(|n| n as usize);

    if text.is_empty() {
        return Ok(vec![]);
    }

    let re = Regex::new(pattern)?;

    let Some(captures) = re.captures(text) else {
        return Ok(vec![ScoreOutput {
            name: score_name.to_string(),
            value_type: ScoreValueType::Numeric,
            numeric_value: Some(no_match_score),
            string_value: None,
            reason: Some(format!("no match for pattern `{pattern}`")),
        }]);
    };

    let Some(group) = capture_group else {
        return Ok(vec![ScoreOutput {
            name: score_name.to_string(),
            value_type: ScoreValueType::Numeric,
            numeric_value: Some(match_score),
            string_value: None,
            reason: Some(format!("matched pattern `{pattern}`")),
        }]);
    };

    let captured = captures.get(group).map(|m| m.as_str().to_string());
    let numeric_value = Some(
        captured
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(match_score),
    );

    Ok(vec![ScoreOutput {
        name: score_name.to_string(),
        value_type: ScoreValueType::Numeric,
        numeric_value,
        string_value: captured,
        reason: Some(format!("matched pattern `{pattern}`, captured group {group}")),
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn match_without_capture_group() {
        let out = run(&json!({ "pattern": "hello" }), "hello world").unwrap();
        assert_eq!(out[0].numeric_value, Some(1.0));
    }

    #[test]
    fn no_match_uses_no_match_score() {
        let out = run(&json!({ "pattern": "zzz", "no_match_score": 0.25 }), "hello").unwrap();
        assert_eq!(out[0].numeric_value, Some(0.25));
    }

    #[test]
    fn capture_group_parses_numeric_string() {
        let out = run(
            &json!({ "pattern": r"count: (\d+)", "capture_group": 1 }),
            "count: 42",
        )
        .unwrap();
        assert_eq!(out[0].numeric_value, Some(42.0));
        assert_eq!(out[0].string_value.as_deref(), Some("42"));
    }

    #[test]
    fn capture_group_keeps_match_score_when_not_numeric() {
        let out = run(
            &json!({ "pattern": r"name: (\w+)", "capture_group": 1, "match_score": 1.0 }),
            "name: alice",
        )
        .unwrap();
        assert_eq!(out[0].numeric_value, Some(1.0));
        assert_eq!(out[0].string_value.as_deref(), Some("alice"));
    }

    #[test]
    fn empty_text_is_a_no_op() {
        let out = run(&json!({ "pattern": "x" }), "").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn redos_guard_rejects_long_pattern() {
        let pattern = "a".repeat(201);
        let err = run(&json!({ "pattern": pattern }), "abc").unwrap_err();
        assert!(matches!(err, ScorerError::RedosRejected { .. }));
    }

    #[test]
    fn redos_guard_rejects_too_many_stars() {
        let pattern = "a*".repeat(11);
        let err = run(&json!({ "pattern": pattern }), "abc").unwrap_err();
        assert!(matches!(err, ScorerError::RedosRejected { .. }));
    }

    #[test]
    fn invalid_regex_syntax_fails() {
        let err = run(&json!({ "pattern": "(" }), "abc").unwrap_err();
        assert!(matches!(err, ScorerError::InvalidRegex(_)));
    }
}
