//! `BackfillWorker`: the manual-trigger path, implementing the race-free
//! "set target before enqueue" protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::filter;
use crate::model::{EvaluationJob, ManualTrigger, Span};
use crate::services::{SpanFilterParams, SpanStore};
use crate::stats::{Stats, StatsSnapshot};
use crate::streams::RedisStreams;
use crate::tracker::ExecutionTracker;

const TRIGGERS_STREAM: &str = "evaluation:manual-triggers";
const JOBS_STREAM: &str = "evaluation:jobs";

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("backfill worker is already running")]
    AlreadyRunning,
}

#[derive(Debug, Error)]
enum DiscoveryFailure {
    #[error("exhausted {pages} filter pages without matching {needed} spans; narrow the filter")]
    FilterPagesExhausted { pages: u32, needed: usize },
    #[error("span store error: {0}")]
    SpanStore(String),
}

/// Consumes manual-trigger messages, materializes historical spans, and
/// emits evaluation jobs against a pre-set execution target.
pub struct BackfillWorker {
    config: WorkerConfig,
    streams: RedisStreams,
    span_store: Arc<dyn SpanStore>,
    tracker: Arc<dyn ExecutionTracker>,
    stats: Arc<Stats>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    started: AtomicBool,
}

impl BackfillWorker {
    pub fn new(
        config: WorkerConfig,
        streams: RedisStreams,
        span_store: Arc<dyn SpanStore>,
        tracker: Arc<dyn ExecutionTracker>,
    ) -> Self {
        Self {
            config,
            streams,
            span_store,
            tracker,
            stats: Arc::new(Stats::default()),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Manual triggers are rare and processed one at a time so they never
    /// starve the matcher's automatic evaluations.
    pub fn start(self: &Arc<Self>) -> Result<(), BackfillError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BackfillError::AlreadyRunning);
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

    async fn run_loop(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            let read = self
                .streams
                .xreadgroup(
                    &[TRIGGERS_STREAM],
                    &[">"],
                    &self.config.consumer_group_triggers,
                    &self.config.consumer_id,
                    1,
                    self.config.block_duration.as_millis() as usize,
                )
                .await;

            match read {
                Ok(reply) => {
                    for stream_key in &reply.keys {
                        for message in &stream_key.ids {
                            self.handle_message(&message.id, message_data(message)).await;
                            if let Err(err) = self
                                .streams
                                .xack(TRIGGERS_STREAM, &self.config.consumer_group_triggers, &message.id)
                                .await
                            {
                                warn!(error = %err, "failed to ack manual trigger message");
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "manual trigger read failed");
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            }
        }
    }

    #[instrument(skip_all, fields(message_id = %message_id))]
    async fn handle_message(&self, message_id: &str, data: Option<String>) {
        let Some(data) = data else {
            warn!("manual trigger message missing data field");
            self.stats.errors_count.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let trigger: ManualTrigger = match serde_json::from_str(&data) {
            Ok(trigger) => trigger,
            Err(err) => {
                warn!(error = %err, "failed to decode manual trigger");
                self.stats.errors_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        self.process_trigger(trigger).await;
        self.stats.triggers_processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn process_trigger(&self, trigger: ManualTrigger) {
        let spans = match self.discover_spans(&trigger).await {
            Ok(spans) => spans,
            Err(err) => {
                warn!(error = %err, execution_id = %trigger.execution_id, "backfill discovery failed");
                if let Err(tracker_err) = self
                    .tracker
                    .fail_execution(trigger.execution_id, trigger.project_id, &err.to_string())
                    .await
                {
                    warn!(error = %tracker_err, "failed to mark execution failed");
                }
                return;
            }
        };

        let selected = self.apply_sampling(spans, &trigger);
        let job_count = selected.len();

        if job_count == 0 {
            if let Err(err) = self
                .tracker
                .complete_execution(trigger.execution_id, trigger.project_id, 0, 0, 0)
                .await
            {
                warn!(error = %err, "failed to complete zero-span execution");
            }
            return;
        }

        // Phase 2.5: the target must be set before the first enqueue, or the
        // executor could observe spans_scored=1 against spans_matched=0 and
        // declare completion prematurely.
        if let Err(err) = self
            .tracker
            .update_spans_matched(trigger.execution_id, trigger.project_id, job_count as u64)
            .await
        {
            warn!(error = %err, "failed to set execution target before enqueue");
            if let Err(tracker_err) = self
                .tracker
                .fail_execution(
                    trigger.execution_id,
                    trigger.project_id,
                    &format!("failed to set execution target: {err}"),
                )
                .await
            {
                warn!(error = %tracker_err, "failed to mark execution failed");
            }
            return;
        }

        let mut enqueue_errors: u64 = 0;
        for span in &selected {
            if let Err(err) = self.emit_job(&trigger, span).await {
                warn!(error = %err, span_id = %span.span_id, "failed to enqueue backfill job");
                enqueue_errors += 1;
                self.stats.errors_count.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.jobs_emitted.fetch_add(1, Ordering::Relaxed);
            }
        }

        if enqueue_errors as usize == job_count {
            if let Err(err) = self
                .tracker
                .fail_execution(
                    trigger.execution_id,
                    trigger.project_id,
                    &format!("all {job_count} job enqueue attempts failed"),
                )
                .await
            {
                warn!(error = %err, "failed to mark execution failed after total enqueue failure");
            }
            return;
        }

        if enqueue_errors > 0
            && let Err(err) = self
                .tracker
                .increment_and_check_completion(trigger.execution_id, trigger.project_id, 0, enqueue_errors)
                .await
        {
            warn!(error = %err, "failed to record backfill enqueue errors on execution");
        }
    }

    async fn discover_spans(&self, trigger: &ManualTrigger) -> Result<Vec<Span>, DiscoveryFailure> {
        if !trigger.span_ids.is_empty() {
            let mut spans = Vec::with_capacity(trigger.span_ids.len());
            for span_id in &trigger.span_ids {
                match self.span_store.get_span_by_project(*span_id, trigger.project_id).await {
                    Ok(span) => spans.push(span),
                    Err(err) => return Err(DiscoveryFailure::SpanStore(err.to_string())),
                }
            }
            return Ok(spans
                .into_iter()
                .filter(|span| matches_trigger(span, trigger))
                .collect());
        }

        self.scan_by_filter(trigger).await
    }

    async fn scan_by_filter(&self, trigger: &ManualTrigger) -> Result<Vec<Span>, DiscoveryFailure> {
        let start_time = trigger
            .time_range_start
            .unwrap_or_else(|| chrono::Utc::now() - chrono::Duration::hours(24));
        let end_time = trigger.time_range_end.unwrap_or_else(chrono::Utc::now);

        if trigger.filter.is_empty() {
            let params = SpanFilterParams {
                project_id: trigger.project_id,
                span_names: trigger.span_names.clone(),
                start_time: Some(start_time),
                end_time: Some(end_time),
                page: 0,
                limit: trigger.sample_limit as u32,
            };
            return self
                .span_store
                .get_spans_by_filter(params)
                .await
                .map_err(|err| DiscoveryFailure::SpanStore(err.to_string()));
        }

        let mut matches = Vec::new();
        let mut page = 0u32;
        loop {
            let params = SpanFilterParams {
                project_id: trigger.project_id,
                span_names: trigger.span_names.clone(),
                start_time: Some(start_time),
                end_time: Some(end_time),
                page,
                limit: trigger.sample_limit as u32,
            };
            let spans = self
                .span_store
                .get_spans_by_filter(params)
                .await
                .map_err(|err| DiscoveryFailure::SpanStore(err.to_string()))?;

            if spans.is_empty() {
                break;
            }

            for span in spans {
                if matches_trigger(&span, trigger) {
                    matches.push(span);
                }
                if matches.len() >= trigger.sample_limit {
                    break;
                }
            }

            if matches.len() >= trigger.sample_limit {
                break;
            }

            page += 1;
            if self.config.max_filter_pages > 0 && page >= self.config.max_filter_pages {
                return Err(DiscoveryFailure::FilterPagesExhausted {
                    pages: self.config.max_filter_pages,
                    needed: trigger.sample_limit,
                });
            }
        }

        Ok(matches)
    }

    fn apply_sampling(&self, mut spans: Vec<Span>, trigger: &ManualTrigger) -> Vec<Span> {
        if trigger.sampling_rate > 0.0 && trigger.sampling_rate < 1.0 {
            let mut sampled = Vec::new();
            for span in spans {
                if sampled.len() >= trigger.sample_limit {
                    break;
                }
                let draw: f64 = rand::rng().random();
                if draw < trigger.sampling_rate {
                    sampled.push(span);
                }
            }
            return sampled;
        }

        if spans.len() > trigger.sample_limit {
            spans.truncate(trigger.sample_limit);
        }
        spans
    }

    async fn emit_job(&self, trigger: &ManualTrigger, span: &Span) -> Result<(), crate::streams::StreamError> {
        let variables = crate::variables::extract_variables(&span.payload, &trigger.variable_mapping);
        let job = EvaluationJob {
            job_id: Uuid::now_v7(),
            evaluator_id: trigger.evaluator_id,
            project_id: trigger.project_id,
            execution_id: Some(trigger.execution_id),
            span_payload: span.payload.clone(),
            trace_id: span.trace_id,
            span_id: span.span_id,
            scorer_type: trigger.scorer_type,
            scorer_config: trigger.scorer_config.clone(),
            variables,
            created_at: chrono::Utc::now(),
        };

        let data = serde_json::to_string(&job).unwrap_or_default();
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

fn matches_trigger(span: &Span, trigger: &ManualTrigger) -> bool {
    if !trigger.span_names.is_empty() {
        let matches_name = span
            .span_name
            .as_deref()
            .is_some_and(|name| trigger.span_names.iter().any(|allowed| allowed == name));
        if !matches_name {
            return false;
        }
    }

    trigger.filter.iter().all(|clause| filter::matches_clause(&span.payload, clause))
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

    fn span(span_name: &str, payload: serde_json::Value) -> Span {
        Span {
            project_id: Uuid::now_v7(),
            trace_id: Uuid::now_v7(),
            span_id: Uuid::now_v7(),
            span_name: Some(span_name.to_string()),
            payload,
        }
    }

    fn trigger(span_names: Vec<String>, filter: Vec<FilterClause>, sample_limit: usize) -> ManualTrigger {
        ManualTrigger {
            execution_id: Uuid::now_v7(),
            evaluator_id: Uuid::now_v7(),
            project_id: Uuid::now_v7(),
            scorer_type: ScorerType::Builtin,
            scorer_config: json!({}),
            filter,
            span_names,
            sampling_rate: 1.0,
            variable_mapping: vec![],
            time_range_start: None,
            time_range_end: None,
            span_ids: vec![],
            sample_limit,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn matches_trigger_applies_name_and_filter() {
        let t = trigger(
            vec!["llm_call".to_string()],
            vec![FilterClause {
                field: "status".to_string(),
                raw_operator: "equals".to_string(),
                value: json!("ok"),
            }],
            10,
        );
        let good = span("llm_call", json!({ "status": "ok" }));
        let bad_name = span("other", json!({ "status": "ok" }));
        assert!(matches_trigger(&good, &t));
        assert!(!matches_trigger(&bad_name, &t));
    }
}
