//! Execution progress tracking: atomic counter updates with at-most-once
//! completion detection.
//!
//! The production implementation stores one hash per execution in Redis and
//! drives all counter transitions through Lua scripts so that concurrent
//! executors racing on the same execution id serialize on the key, mirroring
//! `ValkeyConnectionInfo::consume_tickets`'s atomic multi-key pattern.

use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Execution, ExecutionState, TriggerType};
use crate::streams::RedisStreams;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("execution {0} not found")]
    NotFound(Uuid),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// The execution-progress state machine consumed by the matcher, backfill,
/// and executor workers. See `model::Execution` for the completion invariant.
#[async_trait]
pub trait ExecutionTracker: Send + Sync {
    async fn start_execution_with_count(
        &self,
        evaluator_id: Uuid,
        project_id: Uuid,
        trigger: TriggerType,
        initial_spans_matched: u64,
    ) -> TrackerResult<Execution>;

    async fn update_spans_matched(
        &self,
        execution_id: Uuid,
        project_id: Uuid,
        count: u64,
    ) -> TrackerResult<()>;

    /// Atomically adds `delta_scored`/`delta_errors` and returns `true` iff
    /// this call is the one that transitioned `running` → `completed`.
    async fn increment_and_check_completion(
        &self,
        execution_id: Uuid,
        project_id: Uuid,
        delta_scored: u64,
        delta_errors: u64,
    ) -> TrackerResult<bool>;

    async fn complete_execution(
        &self,
        execution_id: Uuid,
        project_id: Uuid,
        spans_matched: u64,
        spans_scored: u64,
        errors_count: u64,
    ) -> TrackerResult<()>;

    async fn fail_execution(
        &self,
        execution_id: Uuid,
        project_id: Uuid,
        error_message: &str,
    ) -> TrackerResult<()>;
}

fn execution_key(execution_id: Uuid) -> String {
    format!("evaluation:execution:{execution_id}")
}

const INCREMENT_AND_CHECK_COMPLETION_SCRIPT: &str = r"
local key = KEYS[1]
local delta_scored = tonumber(ARGV[1])
local delta_errors = tonumber(ARGV[2])

local state = redis.call('HGET', key, 'state')
if state ~= 'running' then
    return 0
end

local scored = tonumber(redis.call('HINCRBY', key, 'spans_scored', delta_scored))
local errors = tonumber(redis.call('HINCRBY', key, 'errors_count', delta_errors))
local matched = tonumber(redis.call('HGET', key, 'spans_matched'))

if matched > 0 and (scored + errors) >= matched then
    redis.call('HSET', key, 'state', 'completed')
    return 1
end
return 0
";

/// Redis-hash-backed `ExecutionTracker`. Each execution is one hash at
/// `evaluation:execution:<id>`; completion detection is a single Lua script
/// so the check-then-set never races across executors.
#[derive(Clone)]
pub struct RedisExecutionTracker {
    streams: RedisStreams,
}

impl RedisExecutionTracker {
    pub fn new(streams: RedisStreams) -> Self {
        Self { streams }
    }
}

#[async_trait]
impl ExecutionTracker for RedisExecutionTracker {
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

        let mut conn = self.streams.connection().await?;
        let trigger_str = match trigger {
            TriggerType::Automatic => "automatic",
            TriggerType::Manual => "manual",
        };
        let () = conn
            .hset_multiple(
                execution_key(execution.id),
                &[
                    ("evaluator_id", evaluator_id.to_string()),
                    ("project_id", project_id.to_string()),
                    ("trigger_type", trigger_str.to_string()),
                    ("spans_matched", initial_spans_matched.to_string()),
                    ("spans_scored", "0".to_string()),
                    ("errors_count", "0".to_string()),
                    ("state", "running".to_string()),
                ],
            )
            .await?;

        Ok(execution)
    }

    async fn update_spans_matched(
        &self,
        execution_id: Uuid,
        _project_id: Uuid,
        count: u64,
    ) -> TrackerResult<()> {
        let mut conn = self.streams.connection().await?;
        let () = conn
            .hset(execution_key(execution_id), "spans_matched", count)
            .await?;
        Ok(())
    }

    async fn increment_and_check_completion(
        &self,
        execution_id: Uuid,
        _project_id: Uuid,
        delta_scored: u64,
        delta_errors: u64,
    ) -> TrackerResult<bool> {
        let mut conn = self.streams.connection().await?;
        let script = Script::new(INCREMENT_AND_CHECK_COMPLETION_SCRIPT);
        let completed: i64 = script
            .key(execution_key(execution_id))
            .arg(delta_scored)
            .arg(delta_errors)
            .invoke_async(&mut conn)
            .await?;
        Ok(completed == 1)
    }

    async fn complete_execution(
        &self,
        execution_id: Uuid,
        _project_id: Uuid,
        spans_matched: u64,
        spans_scored: u64,
        errors_count: u64,
    ) -> TrackerResult<()> {
        let mut conn = self.streams.connection().await?;
        let () = conn
            .hset_multiple(
                execution_key(execution_id),
                &[
                    ("spans_matched", spans_matched.to_string()),
                    ("spans_scored", spans_scored.to_string()),
                    ("errors_count", errors_count.to_string()),
                    ("state", "completed".to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn fail_execution(
        &self,
        execution_id: Uuid,
        _project_id: Uuid,
        error_message: &str,
    ) -> TrackerResult<()> {
        let mut conn = self.streams.connection().await?;
        let () = conn
            .hset_multiple(
                execution_key(execution_id),
                &[
                    ("state", "failed".to_string()),
                    ("error_message", error_message.to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}
