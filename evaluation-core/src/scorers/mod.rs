//! Scorer dispatch: three variants sharing one capability set, dispatched
//! through a static table rather than an open-world trait object, per the
//! pipeline's polymorphism design.

pub mod builtin;
pub mod error;
pub mod llm;
pub mod regex;

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::filter;
use crate::model::{EvaluationJob, ScoreOutput, ScorerType};
use crate::services::{CredentialsService, PromptExecutionService};

pub use error::ScorerError;

/// Result of running a scorer against one job: zero or more `ScoreOutput`s
/// plus an optional terminal, non-retryable error message (distinct from a
/// `ScorerError`, which is a hard failure the executor retries).
pub struct ScorerResult {
    pub outputs: Vec<ScoreOutput>,
    pub error: Option<String>,
}

/// Resolves the job's target text: the first non-empty of
/// `variables.output`, `variables.input`, `span_data.output`,
/// `span_data.input`.
pub fn target_text(job: &EvaluationJob) -> String {
    if let Some(v) = job.variables.get("output").filter(|s| !s.is_empty()) {
        return v.clone();
    }
    if let Some(v) = job.variables.get("input").filter(|s| !s.is_empty()) {
        return v.clone();
    }
    if let Some(v) = filter::extract_field(&job.span_payload, "output").and_then(as_text) {
        if !v.is_empty() {
            return v;
        }
    }
    if let Some(v) = filter::extract_field(&job.span_payload, "input").and_then(as_text) {
        if !v.is_empty() {
            return v;
        }
    }
    String::new()
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Dispatches a job to its scorer type. Builtin and regex are synchronous
/// and infallible with respect to I/O; LLM is the only variant that suspends
/// on external calls.
pub async fn execute(
    scorer_type: ScorerType,
    config: &Value,
    job: &EvaluationJob,
    vars: &HashMap<String, String>,
    project_id: Uuid,
    credentials: &dyn CredentialsService,
    prompt_executor: &dyn PromptExecutionService,
) -> Result<ScorerResult, ScorerError> {
    match scorer_type {
        ScorerType::Builtin => {
            let text = target_text(job);
            let outputs = builtin::run(config, &text)?;
            Ok(ScorerResult {
                outputs,
                error: None,
            })
        }
        ScorerType::Regex => {
            let text = target_text(job);
            let outputs = regex::run(config, &text)?;
            Ok(ScorerResult {
                outputs,
                error: None,
            })
        }
        ScorerType::Llm => {
            let result = llm::run(config, vars, project_id, credentials, prompt_executor).await?;
            Ok(ScorerResult {
                outputs: result.outputs,
                error: result.error,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Variables;
    use serde_json::json;

    fn job_with(variables: Variables, span_payload: Value) -> EvaluationJob {
        EvaluationJob {
            job_id: Uuid::now_v7(),
            evaluator_id: Uuid::now_v7(),
            project_id: Uuid::now_v7(),
            execution_id: None,
            span_payload,
            trace_id: Uuid::now_v7(),
            span_id: Uuid::now_v7(),
            scorer_type: ScorerType::Builtin,
            scorer_config: json!({}),
            variables,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn target_text_prefers_variables_output() {
        let mut vars = Variables::new();
        vars.insert("output".to_string(), "from variables".to_string());
        let job = job_with(vars, json!({ "output": "from span" }));
        assert_eq!(target_text(&job), "from variables");
    }

    #[test]
    fn target_text_falls_back_to_span_data() {
        let job = job_with(Variables::new(), json!({ "output": "from span" }));
        assert_eq!(target_text(&job), "from span");
    }

    #[test]
    fn target_text_empty_when_nothing_present() {
        let job = job_with(Variables::new(), json!({}));
        assert_eq!(target_text(&job), "");
    }
}
