mod cli;
mod clients;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Args, OutputFormat};
use clients::HttpServices;
use evaluation_core::tracker::RedisExecutionTracker;
use evaluation_core::{BackfillWorker, ExecutorWorker, MatcherWorker, RedisStreams, WorkerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn setup_logging(format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Jsonl => {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_writer(std::io::stderr)
                .json()
                .with_env_filter(EnvFilter::from_default_env())
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("failed to initialize tracing")
        }
        OutputFormat::Pretty => {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_writer(std::io::stderr)
                .with_env_filter(EnvFilter::from_default_env())
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("failed to initialize tracing")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.format)?;

    let config = match &args.config_file {
        Some(path) => WorkerConfig::from_file(path).context("failed to load worker config")?,
        None => WorkerConfig::default(),
    }
    .apply_env_overrides();

    let streams = RedisStreams::connect(&config.redis_url)
        .await
        .context("failed to connect to redis")?;
    let tracker = Arc::new(RedisExecutionTracker::new(streams.clone()));
    let http = Arc::new(HttpServices::new(args.api_base_url));

    let matcher = Arc::new(MatcherWorker::new(
        config.clone(),
        streams.clone(),
        http.clone(),
        tracker.clone(),
    ));
    let backfill = Arc::new(BackfillWorker::new(
        config.clone(),
        streams.clone(),
        http.clone(),
        tracker.clone(),
    ));
    let executor = Arc::new(ExecutorWorker::new(
        config,
        streams,
        http.clone(),
        http.clone(),
        http,
        tracker,
    ));

    if !args.no_matcher {
        matcher.start().context("matcher worker failed to start")?;
        info!("matcher worker started");
    }
    if !args.no_backfill {
        backfill.start().context("backfill worker failed to start")?;
        info!("backfill worker started");
    }
    if !args.no_executor {
        executor.start().context("executor worker failed to start")?;
        info!("executor worker started");
    }

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping workers");

    if !args.no_matcher {
        matcher.stop().await;
    }
    if !args.no_backfill {
        backfill.stop().await;
    }
    if !args.no_executor {
        executor.stop().await;
    }

    Ok(())
}
