//! Data model shared by the matcher, backfill, and executor workers.
//!
//! Mirrors the wire shapes produced by the external evaluator/span/score
//! services (see `crate::services`); this crate never constructs the
//! database rows these are projected from, only the in-flight job shapes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Span filter operator. Aliases `eq`/`neq` are normalized to `Equals`/`NotEquals`
/// at deserialization time; see `FilterClause::operator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
    IsEmpty,
    IsNotEmpty,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    /// Parses an operator name, accepting the `eq`/`neq` aliases. Returns `None`
    /// for anything else so the caller can apply the "unknown operator matches" rule.
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "equals" | "eq" => Self::Equals,
            "not_equals" | "neq" => Self::NotEquals,
            "contains" => Self::Contains,
            "not_contains" => Self::NotContains,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            "regex" => Self::Regex,
            "is_empty" => Self::IsEmpty,
            "is_not_empty" => Self::IsNotEmpty,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            _ => return None,
        })
    }
}

/// `(field, operator, value)` triple. `field` is a dot-notation path into the
/// span payload. Deserialized from the raw operator string via `raw_operator`
/// so that unknown operators survive parsing instead of rejecting the evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterClause {
    pub field: String,
    #[serde(rename = "operator")]
    pub raw_operator: String,
    pub value: Value,
}

impl FilterClause {
    pub fn operator(&self) -> Option<Operator> {
        Operator::parse(&self.raw_operator)
    }
}

/// Where a `VariableMap` entry pulls its value from within a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableSource {
    SpanInput,
    SpanOutput,
    SpanMetadata,
    SpanAttributes,
    TraceInput,
    Direct,
}

/// `(variable_name, source, json_path)` triple describing how to pull a prompt
/// variable out of a span payload for scorer consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableMap {
    pub variable_name: String,
    pub source: VariableSource,
    #[serde(default)]
    pub json_path: Option<String>,
}

/// Scorer implementations this pipeline knows how to dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerType {
    Builtin,
    Regex,
    Llm,
}

/// A scoring definition owned by a project. Mutations to an evaluator (via the
/// external evaluator service) do not retroactively change in-flight jobs:
/// the matcher copies `scorer_type`/`scorer_config` onto each job at emission
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluator {
    pub id: Uuid,
    pub project_id: Uuid,
    pub active: bool,
    #[serde(default)]
    pub span_names: Vec<String>,
    #[serde(default)]
    pub filter: Vec<FilterClause>,
    pub sampling_rate: f64,
    pub scorer_type: ScorerType,
    pub scorer_config: Value,
    #[serde(default)]
    pub variable_mapping: Vec<VariableMap>,
}

/// A single event inside a `TelemetryBatch`. Only `event_type == "span"` events
/// are matched; everything else is skipped by the matcher before it is even
/// counted in `spans_processed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub event_type: String,
    pub trace_id: Uuid,
    pub span_id: Uuid,
    #[serde(default)]
    pub span_name: Option<String>,
    pub payload: Value,
}

impl SpanEvent {
    pub fn is_span(&self) -> bool {
        self.event_type == "span"
    }
}

/// A batch of span events produced by the external ingester on a
/// `telemetry:batches:<suffix>` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryBatch {
    pub project_id: Uuid,
    pub events: Vec<SpanEvent>,
}

/// Which component originated an `Execution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Automatic,
    Manual,
}

/// Extracted prompt variables, keyed by `VariableMap::variable_name`. Scalar
/// strings are kept verbatim; any other JSON shape is re-serialized to a string
/// per the variable-mapping extraction rule.
pub type Variables = HashMap<String, String>;

/// Emitted by the matcher or backfill worker, consumed by the executor.
/// `scorer_type`/`scorer_config` are snapshotted from the evaluator at
/// emission time, per the "evaluator edit during in-flight batch" open
/// question resolved in DESIGN.md.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationJob {
    pub job_id: Uuid,
    pub evaluator_id: Uuid,
    pub project_id: Uuid,
    #[serde(default)]
    pub execution_id: Option<Uuid>,
    pub span_payload: Value,
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub scorer_type: ScorerType,
    pub scorer_config: Value,
    #[serde(default)]
    pub variables: Variables,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// The declared type of a `Score`'s value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScoreValueType {
    Numeric,
    Categorical,
    Boolean,
}

/// A single scorer output, before it has been attached to a span/job and
/// turned into a persisted `Score`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutput {
    pub name: String,
    pub value_type: ScoreValueType,
    pub numeric_value: Option<f64>,
    pub string_value: Option<String>,
    pub reason: Option<String>,
}

/// Metadata stamped onto every persisted score, per the round-trip invariant
/// in the spec's testable properties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreMetadata {
    pub evaluator_id: Uuid,
    pub scorer_type: ScorerType,
    pub job_id: Uuid,
}

/// Source tag on every score this pipeline writes. There is only ever one
/// value today, but it is kept as a type (rather than a bare constant) so a
/// future human-feedback source can share the `Score` shape.
pub const SCORE_SOURCE: &str = "eval";

/// A persisted evaluation result, written by the executor via the score sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub id: Uuid,
    pub project_id: Uuid,
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub name: String,
    pub value_type: ScoreValueType,
    pub numeric_value: Option<f64>,
    pub string_value: Option<String>,
    pub reason: Option<String>,
    pub source: String,
    pub metadata: ScoreMetadata,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Score {
    pub fn from_output(
        output: ScoreOutput,
        job: &EvaluationJob,
        score_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            id: score_id,
            project_id: job.project_id,
            trace_id: job.trace_id,
            span_id: job.span_id,
            name: output.name,
            value_type: output.value_type,
            numeric_value: output.numeric_value,
            string_value: output.string_value,
            reason: output.reason,
            source: SCORE_SOURCE.to_string(),
            metadata: ScoreMetadata {
                evaluator_id: job.evaluator_id,
                scorer_type: job.scorer_type,
                job_id: job.job_id,
            },
            timestamp,
        }
    }
}

/// Terminal state of an `Execution`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Running,
    Completed,
    Failed,
}

/// A tracked unit of evaluation work. See `crate::tracker` for the atomic
/// counter-update protocol that drives `state` transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub evaluator_id: Uuid,
    pub project_id: Uuid,
    pub trigger_type: TriggerType,
    pub spans_matched: u64,
    pub spans_scored: u64,
    pub errors_count: u64,
    pub state: ExecutionState,
    pub error_message: Option<String>,
}

impl Execution {
    /// The completion invariant from the spec: `spans_scored + errors_count >=
    /// spans_matched > 0`.
    pub fn is_complete(&self) -> bool {
        self.spans_matched > 0 && self.spans_scored + self.errors_count >= self.spans_matched
    }
}

/// A manual-trigger message consumed from `evaluation:manual-triggers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualTrigger {
    pub execution_id: Uuid,
    pub evaluator_id: Uuid,
    pub project_id: Uuid,
    pub scorer_type: ScorerType,
    pub scorer_config: Value,
    #[serde(default)]
    pub filter: Vec<FilterClause>,
    #[serde(default)]
    pub span_names: Vec<String>,
    pub sampling_rate: f64,
    #[serde(default)]
    pub variable_mapping: Vec<VariableMap>,
    #[serde(default)]
    pub time_range_start: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub time_range_end: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub span_ids: Vec<Uuid>,
    pub sample_limit: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A span as returned by the external span store, scoped to one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub project_id: Uuid,
    pub trace_id: Uuid,
    pub span_id: Uuid,
    #[serde(default)]
    pub span_name: Option<String>,
    pub payload: Value,
}
