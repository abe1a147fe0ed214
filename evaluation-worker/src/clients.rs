//! Thin reqwest-based implementations of `evaluation_core::services` traits,
//! talking to the host application's internal HTTP API. This is the
//! production wiring the library itself stays agnostic to.

use std::collections::HashMap;

use async_trait::async_trait;
use evaluation_core::model::{Evaluator, Score, Span};
use evaluation_core::services::{
    Credential, CredentialsService, EvaluatorService, ExecutionOutcome, ModelConfig,
    PromptExecutionService, ScoreSink, ServiceError, ServiceResult, SpanFilterParams, SpanStore,
};
use serde::Serialize;
use url::Url;
use uuid::Uuid;

/// Shared HTTP client and base URL for every internal-API-backed service.
#[derive(Clone)]
pub struct HttpServices {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpServices {
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        url.set_path(path);
        url
    }
}

fn to_service_error(err: reqwest::Error) -> ServiceError {
    if err.status().is_some_and(|status| status.as_u16() == 404) {
        ServiceError::NotFound
    } else {
        ServiceError::Transport(err.to_string())
    }
}

#[async_trait]
impl EvaluatorService for HttpServices {
    async fn get_active_by_project_id(&self, project_id: Uuid) -> ServiceResult<Vec<Evaluator>> {
        let response = self
            .client
            .get(self.url("/internal/evaluators"))
            .query(&[("project_id", project_id.to_string()), ("active", "true".to_string())])
            .send()
            .await
            .map_err(to_service_error)?
            .error_for_status()
            .map_err(to_service_error)?;
        response.json::<Vec<Evaluator>>().await.map_err(to_service_error)
    }
}

#[async_trait]
impl ScoreSink for HttpServices {
    async fn create_score_batch(&self, scores: Vec<Score>) -> ServiceResult<()> {
        self.client
            .post(self.url("/internal/scores/batch"))
            .json(&scores)
            .send()
            .await
            .map_err(to_service_error)?
            .error_for_status()
            .map_err(to_service_error)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialsService for HttpServices {
    async fn get_decrypted_by_id(&self, credential_id: &str, project_id: Uuid) -> ServiceResult<Credential> {
        let response = self
            .client
            .get(self.url(&format!("/internal/credentials/{credential_id}")))
            .query(&[("project_id", project_id.to_string())])
            .send()
            .await
            .map_err(to_service_error)?
            .error_for_status()
            .map_err(to_service_error)?;
        response.json::<Credential>().await.map_err(to_service_error)
    }
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    prompt: &'a str,
    vars: &'a HashMap<String, String>,
    model_config: &'a ModelConfig,
}

#[async_trait]
impl PromptExecutionService for HttpServices {
    async fn execute(
        &self,
        prompt: &str,
        vars: &HashMap<String, String>,
        model_config: &ModelConfig,
    ) -> ServiceResult<ExecutionOutcome> {
        let response = self
            .client
            .post(self.url("/internal/prompt-execution"))
            .json(&ExecuteRequest { prompt, vars, model_config })
            .send()
            .await
            .map_err(to_service_error)?
            .error_for_status()
            .map_err(to_service_error)?;
        response.json::<ExecutionOutcome>().await.map_err(to_service_error)
    }
}

#[async_trait]
impl SpanStore for HttpServices {
    async fn get_span_by_project(&self, span_id: Uuid, project_id: Uuid) -> ServiceResult<Span> {
        let response = self
            .client
            .get(self.url(&format!("/internal/spans/{span_id}")))
            .query(&[("project_id", project_id.to_string())])
            .send()
            .await
            .map_err(to_service_error)?
            .error_for_status()
            .map_err(to_service_error)?;
        response.json::<Span>().await.map_err(to_service_error)
    }

    async fn get_spans_by_filter(&self, params: SpanFilterParams) -> ServiceResult<Vec<Span>> {
        let mut query = vec![
            ("project_id".to_string(), params.project_id.to_string()),
            ("page".to_string(), params.page.to_string()),
            ("limit".to_string(), params.limit.to_string()),
        ];
        for span_name in &params.span_names {
            query.push(("span_name".to_string(), span_name.clone()));
        }
        if let Some(start) = params.start_time {
            query.push(("start_time".to_string(), start.to_rfc3339()));
        }
        if let Some(end) = params.end_time {
            query.push(("end_time".to_string(), end.to_rfc3339()));
        }

        let response = self
            .client
            .get(self.url("/internal/spans"))
            .query(&query)
            .send()
            .await
            .map_err(to_service_error)?
            .error_for_status()
            .map_err(to_service_error)?;
        response.json::<Vec<Span>>().await.map_err(to_service_error)
    }
}
