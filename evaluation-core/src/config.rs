//! Worker configuration: a TOML file merged with environment-variable
//! overrides, the way `evaluations::cli::Args` layers `clap` env vars over
//! defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables shared by `MatcherWorker`, `BackfillWorker`, and `ExecutorWorker`.
/// Defaults match the spec's stated defaults exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub consumer_group_telemetry: String,
    pub consumer_group_jobs: String,
    pub consumer_group_triggers: String,
    pub consumer_id: String,
    pub batch_size_matcher: usize,
    pub batch_size_executor: usize,
    pub block_duration: Duration,
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub discovery_interval: Duration,
    pub max_streams_per_read: usize,
    pub evaluator_cache_ttl: Duration,
    pub max_concurrency: usize,
    pub max_filter_pages: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            consumer_group_telemetry: "evaluation-evaluator-workers".to_string(),
            consumer_group_jobs: "evaluation-execution-workers".to_string(),
            consumer_group_triggers: "manual-trigger-workers".to_string(),
            consumer_id: "evaluation-worker-1".to_string(),
            batch_size_matcher: 50,
            batch_size_executor: 10,
            block_duration: Duration::from_secs(1),
            max_retries: 3,
            retry_backoff_base: Duration::from_millis(500),
            discovery_interval: Duration::from_secs(30),
            max_streams_per_read: 10,
            evaluator_cache_ttl: Duration::from_secs(30),
            max_concurrency: 5,
            max_filter_pages: 0,
        }
    }
}

impl WorkerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: "<string>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `TENSORZERO_EVAL_*` environment overrides on top of whatever
    /// was loaded from file/defaults.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("TENSORZERO_EVAL_REDIS_URL") {
            self.redis_url = url;
        }
        if let Ok(consumer_id) = std::env::var("TENSORZERO_EVAL_CONSUMER_ID") {
            self.consumer_id = consumer_id;
        }
        if let Ok(raw) = std::env::var("TENSORZERO_EVAL_MAX_CONCURRENCY")
            && let Ok(parsed) = raw.parse()
        {
            self.max_concurrency = parsed;
        }
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_streams_per_read == 0 {
            return Err(ConfigError::Invalid(
                "max_streams_per_read must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = WorkerConfig::default();
        assert_eq!(config.batch_size_matcher, 50);
        assert_eq!(config.batch_size_executor, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.discovery_interval, Duration::from_secs(30));
        assert_eq!(config.evaluator_cache_ttl, Duration::from_secs(30));
    }

    #[test]
    fn parses_partial_toml_over_defaults() {
        let config = WorkerConfig::from_toml_str("max_concurrency = 20\n").unwrap();
        assert_eq!(config.max_concurrency, 20);
        assert_eq!(config.batch_size_matcher, 50);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = WorkerConfig::from_toml_str("max_concurrency = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
