//! In-memory fakes for every external collaborator trait, grounded on the
//! host application's own test-helpers convention of shipping a real public
//! module rather than hiding fakes behind `#[cfg(test)]`. Gated behind the
//! `test-support` feature so downstream crates can depend on it for their
//! own integration tests without pulling it into release builds.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{Evaluator, Execution, ExecutionState, Score, Span, TriggerType};
use crate::services::{
    Credential, CredentialsService, ExecutionOutcome, ModelConfig, PromptExecutionService,
    PromptResponse, ScoreSink, ServiceError, ServiceResult, SpanFilterParams, SpanStore,
};
use crate::tracker::{ExecutionTracker, TrackerError, TrackerResult};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Returns the active evaluators configured via `set_evaluators`, or an
/// empty catalog for any unknown project.
#[derive(Default)]
pub struct FakeEvaluatorService {
    by_project: Mutex<HashMap<Uuid, Vec<Evaluator>>>,
}

impl FakeEvaluatorService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_evaluators(&self, project_id: Uuid, evaluators: Vec<Evaluator>) {
        lock(&self.by_project).insert(project_id, evaluators);
    }
}

#[async_trait]
impl crate::services::EvaluatorService for FakeEvaluatorService {
    async fn get_active_by_project_id(&self, project_id: Uuid) -> ServiceResult<Vec<Evaluator>> {
        Ok(lock(&self.by_project).get(&project_id).cloned().unwrap_or_default())
    }
}

/// Accumulates every score handed to it for assertions; `fail_next` forces
/// the next `create_score_batch` call to return a transport error.
#[derive(Default)]
pub struct FakeScoreSink {
    scores: Mutex<Vec<Score>>,
    fail_next: Mutex<bool>,
}

impl FakeScoreSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scores(&self) -> Vec<Score> {
        lock(&self.scores).clone()
    }

    pub fn fail_next_call(&self) {
        *lock(&self.fail_next) = true;
    }
}

#[async_trait]
impl ScoreSink for FakeScoreSink {
    async fn create_score_batch(&self, scores: Vec<Score>) -> ServiceResult<()> {
        let mut fail_next = lock(&self.fail_next);
        if *fail_next {
            *fail_next = false;
            return Err(ServiceError::Transport("fake score sink failure".to_string()));
        }
        drop(fail_next);
        lock(&self.scores).extend(scores);
        Ok(())
    }
}

/// Serves credentials registered via `set_credential`; unknown ids return
/// `ServiceError::NotFound`.
#[derive(Default)]
pub struct FakeCredentialsService {
    credentials: Mutex<HashMap<String, Credential>>,
}

impl FakeCredentialsService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_credential(&self, credential_id: &str, credential: Credential) {
        lock(&self.credentials).insert(credential_id.to_string(), credential);
    }
}

#[async_trait]
impl CredentialsService for FakeCredentialsService {
    async fn get_decrypted_by_id(&self, credential_id: &str, _project_id: Uuid) -> ServiceResult<Credential> {
        lock(&self.credentials).get(credential_id).cloned().ok_or(ServiceError::NotFound)
    }
}

/// Returns a canned `ExecutionOutcome` for every call via `set_response`,
/// recording the prompts it was invoked with for assertions.
#[derive(Default)]
pub struct FakePromptExecutionService {
    response: Mutex<Option<ExecutionOutcome>>,
    calls: Mutex<Vec<String>>,
}

impl FakePromptExecutionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_response(&self, outcome: ExecutionOutcome) {
        *lock(&self.response) = Some(outcome);
    }

    pub fn set_content(&self, content: &str) {
        self.set_response(ExecutionOutcome {
            response: PromptResponse {
                content: Some(content.to_string()),
                error: None,
            },
        });
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl PromptExecutionService for FakePromptExecutionService {
    async fn execute(
        &self,
        prompt: &str,
        _vars: &HashMap<String, String>,
        _model_config: &ModelConfig,
    ) -> ServiceResult<ExecutionOutcome> {
        lock(&self.calls).push(prompt.to_string());
        Ok(lock(&self.response).clone().unwrap_or_default())
    }
}

/// In-memory span catalog keyed by `(project_id, span_id)`, with a separate
/// ordered list for `get_spans_by_filter` pagination.
#[derive(Default)]
pub struct FakeSpanStore {
    spans: Mutex<Vec<Span>>,
}

impl FakeSpanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_span(&self, span: Span) {
        lock(&self.spans).push(span);
    }
}

#[async_trait]
impl SpanStore for FakeSpanStore {
    async fn get_span_by_project(&self, span_id: Uuid, project_id: Uuid) -> ServiceResult<Span> {
        lock(&self.spans)
            .iter()
            .find(|span| span.span_id == span_id && span.project_id == project_id)
            .cloned()
            .ok_or(ServiceError::NotFound)
    }

    async fn get_spans_by_filter(&self, params: SpanFilterParams) -> ServiceResult<Vec<Span>> {
        let spans = lock(&self.spans);
        let matching: Vec<Span> = spans
            .iter()
            .filter(|span| span.project_id == params.project_id)
            .filter(|span| {
                params.span_names.is_empty()
                    || span
                        .span_name
                        .as_deref()
                        .is_some_and(|name| params.span_names.iter().any(|allowed| allowed == name))
            })
            .cloned()
            .collect();

        let start = (params.page as usize) * (params.limit as usize);
        Ok(matching.into_iter().skip(start).take(params.limit as usize).collect())
    }
}

/// In-memory `ExecutionTracker` mirroring `RedisExecutionTracker`'s
/// semantics without a Redis dependency, for unit-testing the workers.
#[derive(Default)]
pub struct FakeExecutionTracker {
    executions: Mutex<HashMap<Uuid, Execution>>,
}

impl FakeExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, execution_id: Uuid) -> Option<Execution> {
        lock(&self.executions).get(&execution_id).cloned()
    }
}

#[async_trait]
impl ExecutionTracker for FakeExecutionTracker {
    async fn start_execution_with_count(
        &self,
        evaluator_id: Uuid,
        project_id: Uuid,
        trigger: TriggerType,
        initial_spans_matched: u64,
    ) -> TrackerResult<Execution> {
        let execution = Execution {
            id: Uuid::now_v7(),
            evaluator_id,
            project_id,
            trigger_type: trigger,
            spans_matched: initial_spans_matched,
            spans_scored: 0,
            errors_count: 0,
            state: ExecutionState::Running,
            error_message: None,
        };
        lock(&self.executions).insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn update_spans_matched(&self, execution_id: Uuid, _project_id: Uuid, count: u64) -> TrackerResult<()> {
        let mut executions = lock(&self.executions);
        let execution = executions.get_mut(&execution_id).ok_or(TrackerError::NotFound(execution_id))?;
        execution.spans_matched = count;
        Ok(())
    }

    async fn increment_and_check_completion(
        &self,
        execution_id: Uuid,
        _project_id: Uuid,
        delta_scored: u64,
        delta_errors: u64,
    ) -> TrackerResult<bool> {
        let mut executions = lock(&self.executions);
        let execution = executions.get_mut(&execution_id).ok_or(TrackerError::NotFound(execution_id))?;
        if execution.state != ExecutionState::Running {
            return Ok(false);
        }
        execution.spans_scored += delta_scored;
        execution.errors_count += delta_errors;
        if execution.is_complete() {
            execution.state = ExecutionState::Completed;
            return Ok(true);
        }
        Ok(false)
    }

    async fn complete_execution(
        &self,
        execution_id: Uuid,
        _project_id: Uuid,
        spans_matched: u64,
        spans_scored: u64,
        errors_count: u64,
    ) -> TrackerResult<()> {
        let mut executions = lock(&self.executions);
        let execution = executions.get_mut(&execution_id).ok_or(TrackerError::NotFound(execution_id))?;
        execution.spans_matched = spans_matched;
        execution.spans_scored = spans_scored;
        execution.errors_count = errors_count;
        execution.state = ExecutionState::Completed;
        Ok(())
    }

    async fn fail_execution(&self, execution_id: Uuid, _project_id: Uuid, error_message: &str) -> TrackerResult<()> {
        let mut executions = lock(&self.executions);
        let execution = executions.get_mut(&execution_id).ok_or(TrackerError::NotFound(execution_id))?;
        execution.state = ExecutionState::Failed;
        execution.error_message = Some(error_message.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::EvaluatorService;

    #[tokio::test]
    async fn fake_evaluator_service_returns_configured_catalog() {
        let service = FakeEvaluatorService::new();
        let project_id = Uuid::now_v7();
        assert!(service.get_active_by_project_id(project_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fake_tracker_reports_completion_once() {
        let tracker = FakeExecutionTracker::new();
        let execution = tracker
            .start_execution_with_count(Uuid::now_v7(), Uuid::now_v7(), TriggerType::Automatic, 2)
            .await
            .unwrap();

        let first = tracker
            .increment_and_check_completion(execution.id, execution.project_id, 1, 0)
            .await
            .unwrap();
        assert!(!first);

        let second = tracker
            .increment_and_check_completion(execution.id, execution.project_id, 1, 0)
            .await
            .unwrap();
        assert!(second);

        let third = tracker
            .increment_and_check_completion(execution.id, execution.project_id, 0, 1)
            .await
            .unwrap();
        assert!(!third);
    }

    /// Mirrors the backfill partial-enqueue-failure scenario: 3 spans
    /// selected, target set before any enqueue, one of three enqueues fails
    /// so the backfill worker folds that failure into `errors_count`, then
    /// the executor scores the two jobs that made it onto the stream.
    #[tokio::test]
    async fn tracker_completes_after_target_set_then_partial_enqueue_failure_and_scoring() {
        let tracker = FakeExecutionTracker::new();
        let execution = tracker
            .start_execution_with_count(Uuid::now_v7(), Uuid::now_v7(), TriggerType::Manual, 0)
            .await
            .unwrap();

        tracker
            .update_spans_matched(execution.id, execution.project_id, 3)
            .await
            .unwrap();

        let after_enqueue_failure = tracker
            .increment_and_check_completion(execution.id, execution.project_id, 0, 1)
            .await
            .unwrap();
        assert!(!after_enqueue_failure);

        let after_first_score = tracker
            .increment_and_check_completion(execution.id, execution.project_id, 1, 0)
            .await
            .unwrap();
        assert!(!after_first_score);

        let after_second_score = tracker
            .increment_and_check_completion(execution.id, execution.project_id, 1, 0)
            .await
            .unwrap();
        assert!(after_second_score);

        let final_state = tracker.get(execution.id).unwrap();
        assert_eq!(final_state.spans_matched, 3);
        assert_eq!(final_state.spans_scored, 2);
        assert_eq!(final_state.errors_count, 1);
    }

    /// Mirrors the zero-span backfill completion: no enqueue happens, the
    /// execution is completed directly with all counters at zero.
    #[tokio::test]
    async fn tracker_completes_zero_span_execution_directly() {
        let tracker = FakeExecutionTracker::new();
        let execution = tracker
            .start_execution_with_count(Uuid::now_v7(), Uuid::now_v7(), TriggerType::Manual, 0)
            .await
            .unwrap();

        tracker
            .complete_execution(execution.id, execution.project_id, 0, 0, 0)
            .await
            .unwrap();

        let final_state = tracker.get(execution.id).unwrap();
        assert_eq!(final_state.state, ExecutionState::Completed);
        assert_eq!(final_state.spans_matched, 0);
        assert_eq!(final_state.spans_scored, 0);
        assert_eq!(final_state.errors_count, 0);
    }
}
