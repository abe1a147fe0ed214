pub mod backfill;
pub mod cache;
pub mod config;
pub mod executor;
pub mod filter;
pub mod matcher;
pub mod model;
pub mod scorers;
pub mod services;
pub mod stats;
pub mod streams;
#[cfg(feature = "test-support")]
pub mod testing;
pub mod tracker;
pub mod variables;

pub use backfill::{BackfillError, BackfillWorker};
pub use config::{ConfigError, WorkerConfig};
pub use executor::{ExecutorError, ExecutorWorker};
pub use matcher::{MatcherError, MatcherWorker};
pub use stats::StatsSnapshot;
pub use streams::{RedisStreams, StreamError};
