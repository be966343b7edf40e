//! CLI surface: subcommand dispatch to the two worker processes, the
//! API-only mode, and one-shot CLI training.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "ci-sentinel",
    version,
    about = "CI log anomaly detection pipeline: Drain template mining, security-aware feature extraction, and Isolation Forest scoring."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Consume `raw_logs`, mine Drain templates, extract features, publish `features`.
    ParserWorker,

    /// Consume `features` and score builds, plus serve the HTTP API in the same process.
    DetectorWorker,

    /// Serve only the HTTP API, without consuming `features`.
    DetectorApi,

    /// One-shot training run from a CSV of feature rows.
    Train(TrainArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Path to a training CSV. An optional `label` column marks rows as
    /// "normal" or otherwise; unlabeled rows are all treated as normal.
    pub csv_path: PathBuf,
}
