//! `MatcherWorker`: discovers telemetry streams, matches spans against
//! cached evaluators, and emits evaluation jobs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::cache::EvaluatorCache;
use crate::config::WorkerConfig;
use crate::filter;
use crate::model::{EvaluationJob, Evaluator, SpanEvent, TelemetryBatch, TriggerType};
use crate::services::EvaluatorService;
use crate::stats::{Stats, StatsSnapshot};
use crate::streams::RedisStreams;
use crate::tracker::ExecutionTracker;
use crate::variables::extract_variables;

const TELEMETRY_STREAM_PATTERN: &str = "telemetry:batches:*";
const JOBS_STREAM: &str = "evaluation:jobs";

#[derive(Debug, Error)]
pub enum MatcherError {
    #[error("matcher worker is already running")]
    AlreadyRunning,
}

struct JobBucket {
    evaluator: Evaluator,
    jobs: Vec<EvaluationJob>,
}

/// Continuously consumes every `telemetry:batches:*` stream and emits one
/// evaluation job per matching (evaluator, span) pair.
pub struct MatcherWorker {
    config: WorkerConfig,
    streams: RedisStreams,
    evaluator_service: Arc<dyn EvaluatorService>,
    tracker: Arc<dyn ExecutionTracker>,
    cache: EvaluatorCache,
    stats: Arc<Stats>,
    active_streams: Arc<RwLock<Vec<String>>>,
    rotation_offset: Arc<RwLock<usize>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    started: AtomicBool,
}

impl MatcherWorker {
    pub fn new(
        config: WorkerConfig,
        streams: RedisStreams,
        evaluator_service: Arc<dyn EvaluatorService>,
        tracker: Arc<dyn ExecutionTracker>,
    ) -> Self {
        let cache = EvaluatorCache::new(config.evaluator_cache_ttl);
        Self {
            config,
            streams,
            evaluator_service,
            tracker,
            cache,
            stats: Arc::new(Stats::default()),
            active_streams: Arc::new(RwLock::new(Vec::new())),
            rotation_offset: Arc::new(RwLock::new(0)),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Idempotent start-once: launches the discovery and consumption loops as
    /// background tasks tracked by `TaskTracker`.
    pub fn start(self: &Arc<Self>) -> Result<(), MatcherError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MatcherError::AlreadyRunning);
        }

        let discovery = Arc::clone(self);
        self.tasks.spawn(async move { discovery.run_discovery_loop().await });

        let consumption = Arc::clone(self);
        self.tasks.spawn(async move { consumption.run_consumption_loop().await });

        Ok(())
    }

    /// Signals quit, waits for both loops to exit, and leaves final counters
    /// readable via `stats()`.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn run_discovery_loop(&self) {
        let mut backoff = Duration::from_secs(1);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.config.discovery_interval) => {}
            }

            match self.streams.scan_keys(TELEMETRY_STREAM_PATTERN).await {
                Ok(discovered) => {
                    backoff = Duration::from_secs(1);
                    self.reconcile_streams(discovered).await;
                }
                Err(err) => {
                    warn!(error = %err, "stream discovery failed, backing off");
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    async fn reconcile_streams(&self, discovered: Vec<String>) {
        for stream in &discovered {
            if let Err(err) = self
                .streams
                .ensure_group(stream, &self.config.consumer_group_telemetry, "$")
                .await
            {
                warn!(stream = %stream, error = %err, "failed to ensure consumer group");
            }
        }

        let mut active = self.active_streams.write().await;
        *active = discovered;
        self.stats
            .active_streams
            .store(active.len() as u64, Ordering::Relaxed);
    }

    async fn run_consumption_loop(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let selected = self.select_streams().await;
            if selected.is_empty() {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
                continue;
            }

            let refs: Vec<&str> = selected.iter().map(String::as_str).collect();
            let ids: Vec<&str> = refs.iter().map(|_| ">").collect();

            let read = self
                .streams
                .xreadgroup(
                    &refs,
                    &ids,
                    &self.config.consumer_group_telemetry,
                    &self.config.consumer_id,
                    self.config.batch_size_matcher,
                    self.config.block_duration.as_millis() as usize,
                )
                .await;

            match read {
                Ok(reply) => {
                    for stream_key in &reply.keys {
                        for message in &stream_key.ids {
                            self.handle_message(&stream_key.key, &message.id, message_data(message))
                                .await;
                            if let Err(err) = self
                                .streams
                                .xack(&stream_key.key, &self.config.consumer_group_telemetry, &message.id)
                                .await
                            {
                                warn!(error = %err, "failed to ack telemetry message");
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "telemetry read failed");
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            }

            self.advance_rotation(selected.len()).await;
        }
    }

    async fn select_streams(&self) -> Vec<String> {
        let active = self.active_streams.read().await;
        if active.is_empty() {
            return Vec::new();
        }
        let offset = *self.rotation_offset.read().await % active.len();
        let take = self.config.max_streams_per_read.min(active.len());
        (0..take)
            .map(|i| active[(offset + i) % active.len()].clone())
            .collect()
    }

    async fn advance_rotation(&self, selected_count: usize) {
        let active_len = self.active_streams.read().await.len();
        if active_len == 0 {
            return;
        }
        let mut offset = self.rotation_offset.write().await;
        *offset = (*offset + selected_count) % active_len;
    }

    #[instrument(skip_all, fields(stream = %stream, message_id = %message_id))]
    async fn handle_message(&self, stream: &str, message_id: &str, data: Option<String>) {
        let Some(data) = data else {
            warn!("telemetry message missing data field");
            self.stats.errors_count.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let batch: TelemetryBatch = match serde_json::from_str(&data) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "failed to decode telemetry batch");
                self.stats.errors_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        self.match_batch(batch).await;
    }

    async fn active_evaluators(&self, project_id: Uuid) -> Arc<Vec<Evaluator>> {
        if let Some(cached) = self.cache.get(project_id) {
            return cached;
        }
        let fetched = match self.evaluator_service.get_active_by_project_id(project_id).await {
            Ok(evaluators) => evaluators,
            Err(err) => {
                warn!(error = %err, "evaluator service fetch failed");
                Vec::new()
            }
        };
        self.cache.set(project_id, fetched);
        self.cache.get(project_id).unwrap_or_else(|| Arc::new(Vec::new()))
    }

    async fn match_batch(&self, batch: TelemetryBatch) {
        let evaluators = self.active_evaluators(batch.project_id).await;

        let mut buckets: HashMap<Uuid, JobBucket> = HashMap::new();

        for event in &batch.events {
            if !event.is_span() {
                continue;
            }
            self.stats.spans_processed.fetch_add(1, Ordering::Relaxed);

            for evaluator in evaluators.iter().filter(|e| e.active) {
                if !filter::span_matches(event, &evaluator.span_names, &evaluator.filter) {
                    continue;
                }

                self.stats.evaluators_matched.fetch_add(1, Ordering::Relaxed);

                if evaluator.sampling_rate < 1.0 {
                    let draw: f64 = rand::rng().random();
                    if draw >= evaluator.sampling_rate {
                        continue;
                    }
                }

                let variables = extract_variables(&event.payload, &evaluator.variable_mapping);
                let job = EvaluationJob {
                    job_id: Uuid::now_v7(),
                    evaluator_id: evaluator.id,
                    project_id: batch.project_id,
                    execution_id: None,
                    span_payload: event.payload.clone(),
                    trace_id: event.trace_id,
                    span_id: event.span_id,
                    scorer_type: evaluator.scorer_type,
                    scorer_config: evaluator.scorer_config.clone(),
                    variables,
                    created_at: chrono::Utc::now(),
                };

                buckets
                    .entry(evaluator.id)
                    .or_insert_with(|| JobBucket {
                        evaluator: evaluator.clone(),
                        jobs: Vec::new(),
                    })
                    .jobs
                    .push(job);
            }
        }

        for bucket in buckets.into_values() {
            self.emit_bucket(batch.project_id, bucket).await;
        }
    }

    async fn emit_bucket(&self, project_id: Uuid, bucket: JobBucket) {
        let JobBucket {
            evaluator,
            mut jobs,
        } = bucket;
        if jobs.is_empty() {
            return;
        }

        let execution = match self
            .tracker
            .start_execution_with_count(evaluator.id, project_id, TriggerType::Automatic, jobs.len() as u64)
            .await
        {
            Ok(execution) => Some(execution),
            Err(err) => {
                warn!(error = %err, evaluator_id = %evaluator.id, "failed to create execution for batch, emitting jobs untracked");
                None
            }
        };

        if let Some(execution) = &execution {
            for job in &mut jobs {
                job.execution_id = Some(execution.id);
            }
        }

        let mut enqueue_errors: u64 = 0;
        for job in &jobs {
            if let Err(err) = self.emit_job(job).await {
                warn!(error = %err, job_id = %job.job_id, "failed to enqueue evaluation job");
                enqueue_errors += 1;
                self.stats.errors_count.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.jobs_emitted.fetch_add(1, Ordering::Relaxed);
            }
        }

        if enqueue_errors > 0
            && let Some(execution) = &execution
            && let Err(err) = self
                .tracker
                .increment_and_check_completion(execution.id, project_id, 0, enqueue_errors)
                .await
        {
            warn!(error = %err, execution_id = %execution.id, "failed to record enqueue errors on execution");
        }
    }

    async fn emit_job(&self, job: &EvaluationJob) -> Result<(), crate::streams::StreamError> {
        let data = serde_json::to_string(job).unwrap_or_default();
        self.streams
            .xadd(
                JOBS_STREAM,
                &[
                    ("job_id", job.job_id.to_string()),
                    ("evaluator_id", job.evaluator_id.to_string()),
                    ("project_id", job.project_id.to_string()),
                    ("span_id", job.span_id.to_string()),
                    ("timestamp", job.created_at.to_rfc3339()),
                    ("data", data),
                ],
            )
            .await
    }
}

fn message_data(message: &redis::streams::StreamId) -> Option<String> {
    message
        .map
        .get("data")
        .and_then(|value| redis::from_redis_value::<String>(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FilterClause, ScorerType};
    use serde_json::json;

    fn evaluator(span_names: Vec<String>, filter: Vec<FilterClause>, sampling_rate: f64) -> Evaluator {
        Evaluator {
            id: Uuid::now_v7(),
            project_id: Uuid::now_v7(),
            active: true,
            span_names,
            filter,
            sampling_rate,
            scorer_type: ScorerType::Builtin,
            scorer_config: json!({ "scorer_name": "not_empty" }),
            variable_mapping: vec![],
        }
    }

    fn span_event(span_name: &str, payload: serde_json::Value) -> SpanEvent {
        SpanEvent {
            event_type: "span".to_string(),
            trace_id: Uuid::now_v7(),
            span_id: Uuid::now_v7(),
            span_name: Some(span_name.to_string()),
            payload,
        }
    }

    #[test]
    fn evaluator_matches_name_and_filter() {
        let e = evaluator(
            vec!["llm_call".to_string()],
            vec![FilterClause {
                field: "status".to_string(),
                raw_operator: "equals".to_string(),
                value: json!("ok"),
            }],
            1.0,
        );
        let matching = span_event("llm_call", json!({ "status": "ok" }));
        let wrong_name = span_event("other", json!({ "status": "ok" }));
        let wrong_status = span_event("llm_call", json!({ "status": "fail" }));

        assert!(filter::span_matches(&matching, &e.span_names, &e.filter));
        assert!(!filter::span_matches(&wrong_name, &e.span_names, &e.filter));
        assert!(!filter::span_matches(&wrong_status, &e.span_names, &e.filter));
    }
}
