//! Deterministic string/length/JSON scorers.

use serde_json::Value;

use crate::model::{ScoreOutput, ScoreValueType};
use crate::scorers::error::ScorerError;

fn get_str<'a>(config: &'a Value, field: &str) -> Option<&'a str> {
    config.get(field).and_then(Value::as_str)
}

fn case_sensitive(config: &Value) -> bool {
    config
        .get("case_sensitive")
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

fn fold(text: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        text.to_string()
    } else {
        text.to_lowercase()
    }
}

fn bool_score(name: &str, matched: bool, reason: String) -> ScoreOutput {
    ScoreOutput {
        name: name.to_string(),
        value_type: ScoreValueType::Boolean,
        numeric_value: Some(if matched { 1.0 } else { 0.0 }),
        string_value: None,
        reason: Some(reason),
    }
}

/// Dispatches on `config.scorer_name`. `text` is the job's target text
/// already resolved by the caller (`crate::scorers::target_text`).
pub fn run(config: &Value, text: &str) -> Result<Vec<ScoreOutput>, ScorerError> {
    let scorer_name = get_str(config, "scorer_name")
        .ok_or(ScorerError::MissingField("scorer_name"))?
        .to_string();
    let score_name = get_str(config, "score_name").unwrap_or(&scorer_name);
    let case_sensitive = case_sensitive(config);

    let score = match scorer_name.as_str() {
        "contains" | "not_contains" => {
            let needle = get_str(config, "value").ok_or(ScorerError::MissingField("value"))?;
            let matched = fold(text, case_sensitive).contains(&fold(needle, case_sensitive));
            let matched = if scorer_name == "not_contains" {
                !matched
            } else {
                matched
            };
            bool_score(
                score_name,
                matched,
                format!("text {} contain \"{needle}\"", if matched { "does" } else { "does not" }),
            )
        }
        "starts_with" => {
            let needle = get_str(config, "value").ok_or(ScorerError::MissingField("value"))?;
            let matched = fold(text, case_sensitive).starts_with(&fold(needle, case_sensitive));
            bool_score(score_name, matched, format!("starts_with \"{needle}\": {matched}"))
        }
        "ends_with" => {
            let needle = get_str(config, "value").ok_or(ScorerError::MissingField("value"))?;
            let matched = fold(text, case_sensitive).ends_with(&fold(needle, case_sensitive));
            bool_score(score_name, matched, format!("ends_with \"{needle}\": {matched}"))
        }
        "equals" => {
            let expected = get_str(config, "value").ok_or(ScorerError::MissingField("value"))?;
            let matched = fold(text, case_sensitive) == fold(expected, case_sensitive);
            bool_score(score_name, matched, format!("equals \"{expected}\": {matched}"))
        }
        "not_empty" => {
            let matched = !text.trim().is_empty();
            bool_score(score_name, matched, format!("not_empty: {matched}"))
        }
        "json_valid" => {
            let matched = serde_json::from_str::<Value>(text).is_ok();
            bool_score(score_name, matched, format!("json_valid: {matched}"))
        }
        "length_check" => {
            let min_length = config.get("min_length").and_then(Value::as_i64);
            let max_length = config.get("max_length").and_then(Value::as_i64);
            let len = text.chars().count() as i64;
            let above_min = min_length.is_none_or(|min| len >= min);
            let below_max = max_length.is_none_or(|max| max < 0 || len <= max);
            let matched = above_min && below_max;
            bool_score(score_name, matched, format!("length {len} within bounds: {matched}"))
        }
        other => return Err(ScorerError::UnknownBuiltinScorer(other.to_string())),
    };

    Ok(vec![score])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contains_true() {
        let out = run(&json!({ "scorer_name": "contains", "value": "hello" }), "hello world")
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].numeric_value, Some(1.0));
    }

    #[test]
    fn not_contains_is_literal_negation() {
        let contains = run(&json!({ "scorer_name": "contains", "value": "zzz" }), "hello")
            .unwrap()[0]
            .numeric_value;
        let not_contains = run(&json!({ "scorer_name": "not_contains", "value": "zzz" }), "hello")
            .unwrap()[0]
            .numeric_value;
        assert_eq!(contains, Some(0.0));
        assert_eq!(not_contains, Some(1.0));
    }

    #[test]
    fn length_check_respects_unbounded_max() {
        let out = run(
            &json!({ "scorer_name": "length_check", "min_length": 3, "max_length": -1 }),
            "hello world this is long",
        )
        .unwrap();
        assert_eq!(out[0].numeric_value, Some(1.0));
    }

    #[test]
    fn case_insensitive_equals() {
        let out = run(
            &json!({ "scorer_name": "equals", "value": "HELLO", "case_sensitive": false }),
            "hello",
        )
        .unwrap();
        assert_eq!(out[0].numeric_value, Some(1.0));
    }

    #[test]
    fn unknown_scorer_name_errors() {
        let err = run(&json!({ "scorer_name": "frobnicate" }), "x").unwrap_err();
        assert!(matches!(err, ScorerError::UnknownBuiltinScorer(_)));
    }

    #[test]
    fn json_valid_detects_malformed_json() {
        let out = run(&json!({ "scorer_name": "json_valid" }), "{not json}").unwrap();
        assert_eq!(out[0].numeric_value, Some(0.0));
    }
}
