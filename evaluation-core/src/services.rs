//! External collaborator interfaces.
//!
//! Everything in this module is a boundary this crate calls out across but
//! never implements for production use: the HTTP/DB-backed implementations
//! live in the host application. Modeled on `EvaluationsInferenceExecutor`:
//! an `async_trait` over `Arc<dyn Trait>`, with an in-memory fake in
//! `crate::testing` for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Evaluator, Score, Span};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Other(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Fetches the active evaluator catalog for a project. Backed by
/// `EvaluatorCache` at the call site; this trait is the cache-miss path.
#[async_trait]
pub trait EvaluatorService: Send + Sync {
    async fn get_active_by_project_id(&self, project_id: Uuid) -> ServiceResult<Vec<Evaluator>>;
}

/// Persists scorer output. `create_score_batch` is called once per job with
/// all of that job's `Score`s.
#[async_trait]
pub trait ScoreSink: Send + Sync {
    async fn create_score_batch(&self, scores: Vec<Score>) -> ServiceResult<()>;
}

/// A decrypted model credential, scoped to the project that owns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub provider: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub config: serde_json::Value,
    pub headers: HashMap<String, String>,
}

#[async_trait]
pub trait CredentialsService: Send + Sync {
    async fn get_decrypted_by_id(
        &self,
        credential_id: &str,
        project_id: Uuid,
    ) -> ServiceResult<Credential>;
}

/// Provider/model configuration assembled from a decrypted credential plus
/// the LLM scorer's own config, handed to the execution service verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub api_key: String,
    pub base_url: Option<String>,
    pub provider_config: serde_json::Value,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptResponse {
    pub content: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionOutcome {
    pub response: PromptResponse,
}

/// Invokes an LLM provider with a fully compiled prompt. Transport failures
/// are surfaced as `Err` (retryable); application-level failures are carried
/// in `ExecutionOutcome::response::error`.
#[async_trait]
pub trait PromptExecutionService: Send + Sync {
    async fn execute(
        &self,
        prompt: &str,
        vars: &HashMap<String, String>,
        model_config: &ModelConfig,
    ) -> ServiceResult<ExecutionOutcome>;
}

#[derive(Debug, Clone, Default)]
pub struct SpanFilterParams {
    pub project_id: Uuid,
    pub span_names: Vec<String>,
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub page: u32,
    pub limit: u32,
}

/// Historical span lookups used by `BackfillWorker` Phase 1.
#[async_trait]
pub trait SpanStore: Send + Sync {
    async fn get_span_by_project(&self, span_id: Uuid, project_id: Uuid) -> ServiceResult<Span>;

    async fn get_spans_by_filter(&self, params: SpanFilterParams) -> ServiceResult<Vec<Span>>;
}
