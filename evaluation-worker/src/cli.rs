//! CLI argument definitions for the evaluation-worker binary.
//!
//! This file should remain minimal, containing only CLI argument struct definitions.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(clap::ValueEnum, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[clap(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Pretty,
    Jsonl,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to a worker config TOML file. Defaults are used for any field it omits.
    #[arg(long, env = "TENSORZERO_EVAL_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Base URL of the host application's internal evaluator/score/span API.
    #[arg(long, env = "TENSORZERO_EVAL_API_BASE_URL", default_value = "http://127.0.0.1:3000")]
    pub api_base_url: url::Url,

    #[arg(long, default_value = "pretty")]
    pub format: OutputFormat,

    /// Skip starting the automatic-evaluation matcher worker.
    #[arg(long)]
    pub no_matcher: bool,

    /// Skip starting the manual-trigger backfill worker.
    #[arg(long)]
    pub no_backfill: bool,

    /// Skip starting the job executor worker.
    #[arg(long)]
    pub no_executor: bool,
}
