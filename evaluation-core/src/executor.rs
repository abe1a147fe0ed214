//! `ExecutorWorker`: consumes evaluation jobs, dispatches to the right
//! scorer with bounded concurrency and retry, writes scores, and updates
//! execution progress atomically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::model::{EvaluationJob, Score, ScorerType};
use crate::scorers::{self, ScorerError};
use crate::services::{CredentialsService, PromptExecutionService, ScoreSink};
use crate::stats::{Stats, StatsSnapshot};
use crate::streams::RedisStreams;
use crate::tracker::ExecutionTracker;

const JOBS_STREAM: &str = "evaluation:jobs";

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor worker is already running")]
    AlreadyRunning,
}

/// Outcome of a successfully completed scorer attempt: either score outputs
/// to persist, or a terminal, non-retryable error message from the scorer
/// itself (see `ScorerResult::error`).
enum RetryOutcome {
    Outputs(Vec<crate::model::ScoreOutput>),
    ResultError(String),
}

/// Consumes `evaluation:jobs`, dispatches to the matching scorer under a
/// bounded semaphore, and persists resulting scores.
pub struct ExecutorWorker {
    config: WorkerConfig,
    streams: RedisStreams,
    score_sink: Arc<dyn ScoreSink>,
    credentials: Arc<dyn CredentialsService>,
    prompt_executor: Arc<dyn PromptExecutionService>,
    tracker: Arc<dyn ExecutionTracker>,
    semaphore: Arc<Semaphore>,
    stats: Arc<Stats>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    started: AtomicBool,
}

impl ExecutorWorker {
    pub fn new(
        config: WorkerConfig,
        streams: RedisStreams,
        score_sink: Arc<dyn ScoreSink>,
        credentials: Arc<dyn CredentialsService>,
        prompt_executor: Arc<dyn PromptExecutionService>,
        tracker: Arc<dyn ExecutionTracker>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            config,
            streams,
            score_sink,
            credentials,
            prompt_executor,
            tracker,
            semaphore,
            stats: Arc::new(Stats::default()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn start(self: &Arc<Self>) -> Result<(), ExecutorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ExecutorError::AlreadyRunning);
        }
        let worker = Arc::clone(self);
        self.tasks.spawn(async move { worker.run_loop().await });
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn run_loop(self: &Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let read = self
                .streams
                .xreadgroup(
                    &[JOBS_STREAM],
                    &[">"],
                    &self.config.consumer_group_jobs,
                    &self.config.consumer_id,
                    self.config.batch_size_executor,
                    self.config.block_duration.as_millis() as usize,
                )
                .await;

            match read {
                Ok(reply) => {
                    for stream_key in &reply.keys {
                        for message in &stream_key.ids {
                            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                                continue;
                            };
                            let worker = Arc::clone(self);
                            let message_id = message.id.clone();
                            let data = message_data(message);
                            self.tasks.spawn(async move {
                                worker.process_message(&message_id, data).await;
                                if let Err(err) = worker
                                    .streams
                                    .xack(JOBS_STREAM, &worker.config.consumer_group_jobs, &message_id)
                                    .await
                                {
                                    warn!(error = %err, "failed to ack evaluation job message");
                                }
                                drop(permit);
                            });
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "evaluation job read failed");
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            }
        }
    }

    #[instrument(skip_all, fields(message_id = %message_id))]
    async fn process_message(&self, message_id: &str, data: Option<String>) {
        let Some(data) = data else {
            warn!("evaluation job message missing data field");
            self.stats.errors_count.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let job: EvaluationJob = match serde_json::from_str(&data) {
            Ok(job) => job,
            Err(err) => {
                warn!(error = %err, "failed to decode evaluation job");
                self.stats.errors_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        self.process_job(job).await;
        self.stats.jobs_processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn process_job(&self, job: EvaluationJob) {
        self.count_scorer_call(job.scorer_type);

        let outcome = self.run_with_retry(&job).await;

        let (delta_scored, delta_errors) = match outcome {
            Ok(RetryOutcome::ResultError(error)) => {
                warn!(job_id = %job.job_id, error = %error, "scorer returned a non-retryable result error");
                self.stats.errors_count.fetch_add(1, Ordering::Relaxed);
                (0, 1)
            }
            Ok(RetryOutcome::Outputs(outputs)) => {
                if outputs.is_empty() {
                    (1, 0)
                } else {
                    match self.persist_scores(&job, outputs).await {
                        Ok(()) => (1, 0),
                        Err(err) => {
                            warn!(error = %err, job_id = %job.job_id, "failed to persist scores");
                            self.stats.errors_count.fetch_add(1, Ordering::Relaxed);
                            (0, 1)
                        }
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, job_id = %job.job_id, "scorer execution failed after retries");
                self.stats.errors_count.fetch_add(1, Ordering::Relaxed);
                (0, 1)
            }
        };

        if let Some(execution_id) = job.execution_id
            && let Err(err) = self
                .tracker
                .increment_and_check_completion(execution_id, job.project_id, delta_scored, delta_errors)
                .await
        {
            warn!(error = %err, execution_id = %execution_id, "failed to update execution progress");
        }
    }

    fn count_scorer_call(&self, scorer_type: ScorerType) {
        match scorer_type {
            ScorerType::Builtin => self.stats.builtin_calls.fetch_add(1, Ordering::Relaxed),
            ScorerType::Regex => self.stats.regex_calls.fetch_add(1, Ordering::Relaxed),
            ScorerType::Llm => self.stats.llm_calls.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Executes the job's scorer with linearly growing backoff
    /// (`attempt * retry_backoff_base`) across `max_retries` attempts.
    async fn run_with_retry(&self, job: &EvaluationJob) -> Result<RetryOutcome, ScorerError> {
        let mut last_err = None;
        for attempt in 1..=self.config.max_retries {
            let result = scorers::execute(
                job.scorer_type,
                &job.scorer_config,
                job,
                &job.variables,
                job.project_id,
                self.credentials.as_ref(),
                self.prompt_executor.as_ref(),
            )
            .await;

            match result {
                Ok(scorer_result) => {
                    if let Some(error) = scorer_result.error {
                        return Ok(RetryOutcome::ResultError(error));
                    }
                    return Ok(RetryOutcome::Outputs(scorer_result.outputs));
                }
                Err(err) => {
                    last_err = Some(err);
                    if attempt < self.config.max_retries {
                        let backoff = self.config.retry_backoff_base * attempt;
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(ScorerError::Transport("retries exhausted".to_string())))
    }

    async fn persist_scores(
        &self,
        job: &EvaluationJob,
        outputs: Vec<crate::model::ScoreOutput>,
    ) -> Result<(), crate::services::ServiceError> {
        let now = chrono::Utc::now();
        let scores: Vec<Score> = outputs
            .into_iter()
            .map(|output| Score::from_output(output, job, Uuid::now_v7(), now))
            .collect();
        let count = scores.len() as u64;
        self.score_sink.create_score_batch(scores).await?;
        self.stats.scores_created.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }
}

fn message_data(message: &redis::streams::StreamId) -> Option<String> {
    message
        .map
        .get("data")
        .and_then(|value| redis::from_redis_value::<String>(value).ok())
}
