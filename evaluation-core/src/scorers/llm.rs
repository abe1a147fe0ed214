//! LLM-as-a-judge scorer: compiles a prompt, calls the external execution
//! service, and parses structured scores out of the model's response.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::model::{ScoreOutput, ScoreValueType};
use crate::scorers::error::ScorerError;
use crate::services::{
    CredentialsService, ExecutionOutcome, ModelConfig, PromptExecutionService, ServiceError,
};

#[derive(Debug, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SchemaFieldType {
    Numeric,
    Categorical,
    Boolean,
}

#[derive(Debug, Deserialize)]
struct SchemaField {
    name: String,
    #[serde(rename = "type")]
    field_type: SchemaFieldType,
}

#[derive(Debug, Deserialize)]
struct LlmConfig {
    credential_id: String,
    model: String,
    messages: Vec<Message>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default, rename = "output_schema")]
    output_schema: Vec<SchemaField>,
}

fn parse_config(config: &Value) -> Result<LlmConfig, ScorerError> {
    let parsed: LlmConfig =
        serde_json::from_value(config.clone()).map_err(|_| ScorerError::MissingField("model"))?;
    if parsed.messages.is_empty()
        || parsed
            .messages
            .iter()
            .any(|m| m.role.trim().is_empty() || m.content.trim().is_empty())
    {
        return Err(ScorerError::WrongFieldType {
            field: "messages",
            expected: "at least one message with non-empty role and content",
        });
    }
    Ok(parsed)
}

/// Joins messages as `<role>\ncontent\n</role>` blocks, then substitutes
/// `{var}` occurrences with literal text replacement (missing vars stay
/// literal).
fn compile_prompt(messages: &[Message], vars: &HashMap<String, String>) -> String {
    let joined = messages
        .iter()
        .map(|m| format!("<{role}>\n{content}\n</{role}>", role = m.role, content = m.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut compiled = joined;
    for (name, value) in vars {
        compiled = compiled.replace(&format!("{{{name}}}"), value);
    }
    compiled
}

/// Extracts a JSON value from a model response: direct parse, then fenced
/// ```json``` block, then fenced ``` ``` block, then the substring between
/// the first `{` and last `}`.
fn extract_json(content: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(content) {
        return Some(value);
    }

    if let Some(value) = extract_fenced(content, "```json") {
        return Some(value);
    }
    if let Some(value) = extract_fenced(content, "```") {
        return Some(value);
    }

    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end > start {
        serde_json::from_str(&content[start..=end]).ok()
    } else {
        None
    }
}

fn extract_fenced(content: &str, fence_open: &str) -> Option<Value> {
    let start = content.find(fence_open)? + fence_open.len();
    let rest = &content[start..];
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("```")?;
    serde_json::from_str(rest[..end].trim()).ok()
}

fn coerce_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn coerce_boolean(value: &Value) -> f64 {
    match value {
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => {
            if n.as_f64().unwrap_or(0.0) != 0.0 {
                1.0
            } else {
                0.0
            }
        }
        Value::String(s) => {
            if s == "true" || s == "1" {
                1.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

fn coerce_categorical(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn score_from_schema_field(field: &SchemaField, value: &Value, reason: Option<String>) -> ScoreOutput {
    match field.field_type {
        SchemaFieldType::Numeric => ScoreOutput {
            name: field.name.clone(),
            value_type: ScoreValueType::Numeric,
            numeric_value: Some(coerce_numeric(value).unwrap_or(0.0)),
            string_value: None,
            reason,
        },
        SchemaFieldType::Categorical => ScoreOutput {
            name: field.name.clone(),
            value_type: ScoreValueType::Categorical,
            numeric_value: None,
            string_value: Some(coerce_categorical(value)),
            reason,
        },
        SchemaFieldType::Boolean => ScoreOutput {
            name: field.name.clone(),
            value_type: ScoreValueType::Boolean,
            numeric_value: Some(coerce_boolean(value)),
            string_value: None,
            reason,
        },
    }
}

fn infer_type_and_score(key: &str, value: &Value, reason: Option<String>) -> ScoreOutput {
    match value {
        Value::Bool(b) => ScoreOutput {
            name: key.to_string(),
            value_type: ScoreValueType::Boolean,
            numeric_value: Some(if *b { 1.0 } else { 0.0 }),
            string_value: None,
            reason,
        },
        Value::Number(n) => ScoreOutput {
            name: key.to_string(),
            value_type: ScoreValueType::Numeric,
            numeric_value: n.as_f64(),
            string_value: None,
            reason,
        },
        other => ScoreOutput {
            name: key.to_string(),
            value_type: ScoreValueType::Categorical,
            numeric_value: None,
            string_value: Some(coerce_categorical(other)),
            reason,
        },
    }
}

fn scores_with_schema(parsed: &Value, schema: &[SchemaField]) -> Vec<ScoreOutput> {
    let single_field_reason_key = if schema.len() == 1 { Some("reason") } else { None };
    schema
        .iter()
        .filter_map(|field| {
            let value = parsed.get(&field.name)?;
            let reason = parsed
                .get(format!("{}_reason", field.name))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    single_field_reason_key
                        .and_then(|key| parsed.get(key))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
            Some(score_from_schema_field(field, value, reason))
        })
        .collect()
}

fn scores_without_schema(parsed: &Value) -> Vec<ScoreOutput> {
    let Value::Object(map) = parsed else {
        return vec![];
    };
    map.iter()
        .filter(|(key, _)| !key.ends_with("_reason"))
        .map(|(key, value)| {
            let reason = map
                .get(&format!("{key}_reason"))
                .and_then(Value::as_str)
                .map(str::to_string);
            infer_type_and_score(key, value, reason)
        })
        .collect()
}

/// Parses a model response into scores. Returns the degraded
/// `llm_response` categorical score when parsing fails entirely, never an
/// error: an unparseable LLM response is an observable outcome, not a job
/// failure.
fn parse_response(content: &str, schema: &[SchemaField]) -> Vec<ScoreOutput> {
    let Some(parsed) = extract_json(content) else {
        return vec![ScoreOutput {
            name: "llm_response".to_string(),
            value_type: ScoreValueType::Categorical,
            numeric_value: None,
            string_value: Some(content.to_string()),
            reason: Some("response content was not valid or extractable JSON".to_string()),
        }];
    };

    if schema.is_empty() {
        scores_without_schema(&parsed)
    } else {
        scores_with_schema(&parsed, schema)
    }
}

pub struct LlmScorerResult {
    pub outputs: Vec<ScoreOutput>,
    pub error: Option<String>,
}

/// Runs the LLM scorer end to end: decrypt credential, compile prompt,
/// invoke the execution service, parse the response.
pub async fn run(
    config: &Value,
    vars: &HashMap<String, String>,
    project_id: Uuid,
    credentials: &dyn CredentialsService,
    executor: &dyn PromptExecutionService,
) -> Result<LlmScorerResult, ScorerError> {
    let parsed = parse_config(config)?;

    let credential = credentials
        .get_decrypted_by_id(&parsed.credential_id, project_id)
        .await
        .map_err(|err| ScorerError::CredentialLookup(err.to_string()))?;

    let prompt = compile_prompt(&parsed.messages, vars);

    let model_config = ModelConfig {
        provider: credential.provider,
        model: parsed.model,
        temperature: parsed.temperature.unwrap_or(0.0),
        api_key: credential.api_key,
        base_url: credential.base_url,
        provider_config: credential.config,
        headers: credential.headers,
    };

    let outcome: ExecutionOutcome = executor
        .execute(&prompt, vars, &model_config)
        .await
        .map_err(|err| match err {
            ServiceError::Transport(msg) => ScorerError::Transport(msg),
            other => ScorerError::Transport(other.to_string()),
        })?;

    if let Some(error) = outcome.response.error.filter(|e| !e.is_empty()) {
        return Ok(LlmScorerResult {
            outputs: vec![],
            error: Some(error),
        });
    }

    let Some(content) = outcome.response.content.filter(|c| !c.is_empty()) else {
        return Ok(LlmScorerResult {
            outputs: vec![],
            error: None,
        });
    };

    Ok(LlmScorerResult {
        outputs: parse_response(&content, &parsed.output_schema),
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_prompt_substitutes_variables() {
        let messages = vec![Message {
            role: "user".to_string(),
            content: "Evaluate: {output}".to_string(),
        }];
        let mut vars = HashMap::new();
        vars.insert("output".to_string(), "the answer is 4".to_string());
        let prompt = compile_prompt(&messages, &vars);
        assert_eq!(prompt, "<user>\nEvaluate: the answer is 4\n</user>");
    }

    #[test]
    fn compile_prompt_leaves_missing_vars_literal() {
        let messages = vec![Message {
            role: "user".to_string(),
            content: "Hello {missing}".to_string(),
        }];
        let prompt = compile_prompt(&messages, &HashMap::new());
        assert_eq!(prompt, "<user>\nHello {missing}\n</user>");
    }

    #[test]
    fn extract_json_direct() {
        let value = extract_json(r#"{"score": 1}"#).unwrap();
        assert_eq!(value["score"], 1);
    }

    #[test]
    fn extract_json_fenced_json_block() {
        let content = "Here is my evaluation:\n```json\n{\"score\": 5, \"score_reason\": \"ok\"}\n```";
        let value = extract_json(content).unwrap();
        assert_eq!(value["score"], 5);
        assert_eq!(value["score_reason"], "ok");
    }

    #[test]
    fn extract_json_bare_fenced_block() {
        let content = "```\n{\"score\": 2}\n```";
        let value = extract_json(content).unwrap();
        assert_eq!(value["score"], 2);
    }

    #[test]
    fn extract_json_substring_fallback() {
        let content = "The result is {\"score\": 3} as computed.";
        let value = extract_json(content).unwrap();
        assert_eq!(value["score"], 3);
    }

    #[test]
    fn parse_response_with_schema_single_field_reason_fallback() {
        let content = "```json\n{\"score\": 5, \"reason\": \"ok\"}\n```";
        let schema = vec![SchemaField {
            name: "score".to_string(),
            field_type: SchemaFieldType::Numeric,
        }];
        let outputs = parse_response(content, &schema);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].numeric_value, Some(5.0));
        assert_eq!(outputs[0].reason.as_deref(), Some("ok"));
    }

    #[test]
    fn parse_response_without_schema_skips_reason_keys() {
        let content = r#"{"accuracy": true, "accuracy_reason": "matches", "notes": "fine"}"#;
        let outputs = parse_response(content, &[]);
        assert_eq!(outputs.len(), 2);
        let accuracy = outputs.iter().find(|o| o.name == "accuracy").unwrap();
        assert_eq!(accuracy.value_type, ScoreValueType::Boolean);
        assert_eq!(accuracy.reason.as_deref(), Some("matches"));
    }

    #[test]
    fn parse_response_matches_named_reason_key_over_schema_reason_fallback() {
        let content = "Here is my evaluation:\n```json\n{\"score\": 5, \"score_reason\": \"ok\"}\n```";
        let schema = vec![SchemaField {
            name: "score".to_string(),
            field_type: SchemaFieldType::Numeric,
        }];
        let outputs = parse_response(content, &schema);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, "score");
        assert_eq!(outputs[0].numeric_value, Some(5.0));
        assert_eq!(outputs[0].reason.as_deref(), Some("ok"));
    }

    #[test]
    fn parse_response_falls_back_to_raw_content_on_failure() {
        let outputs = parse_response("not json at all", &[]);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, "llm_response");
        assert_eq!(outputs[0].value_type, ScoreValueType::Categorical);
    }
}
