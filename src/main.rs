//! Entry point: dispatches to the Parser Worker, the Detector Worker (which
//! also serves the HTTP API in the same process), API-only mode, or
//! one-shot CLI training.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser as _;
use tracing_subscriber::EnvFilter;

use ci_sentinel::api::{self, AppState};
use ci_sentinel::cli::{Cli, Commands, TrainArgs};
use ci_sentinel::config::Config;
use ci_sentinel::drain::DrainConfig;
use ci_sentinel::features::SuspiciousPatternConfig;
use ci_sentinel::model::{AnomalyDetector, DetectorConfig};
use ci_sentinel::queue::QueueClient;
use ci_sentinel::store::{DocumentStore, TimeseriesStore};
use ci_sentinel::workers::{DetectorWorker, ParserWorker};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::ParserWorker => run_parser_worker(config).await,
        Commands::DetectorWorker => run_detector_process(config, true).await,
        Commands::DetectorApi => run_detector_process(config, false).await,
        Commands::Train(args) => run_train(config, args).await,
    }
}

async fn build_parser_worker(config: &Config) -> Result<ParserWorker> {
    let docs = DocumentStore::connect(&config.mongo_uri, &config.mongo_database).await?;
    let timeseries = TimeseriesStore::connect(&config.postgres_dsn).await?;
    let queue = QueueClient::new(config.rabbitmq_uri.clone());
    let drain_config = DrainConfig {
        depth: config.drain_depth,
        sim_th: config.drain_sim_th,
        max_children: config.drain_max_children,
    };

    Ok(ParserWorker::new(
        queue,
        docs,
        timeseries,
        drain_config,
        SuspiciousPatternConfig::default(),
        config.raw_logs_queue.clone(),
        config.features_queue.clone(),
    ))
}

async fn run_parser_worker(config: Config) -> Result<()> {
    let mut worker = build_parser_worker(&config).await?;
    worker.connect().await?;
    tracing::info!(queue = %config.raw_logs_queue, "parser worker connected");

    tokio::select! {
        result = worker.serve() => result?,
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, exiting");
        }
    }

    Ok(())
}

/// Runs the Detector process. In `consume = true` mode this also spawns the
/// `features` consumer loop alongside the HTTP API; in `consume = false`
/// mode (`detector-api`) only the API is served. Either way the API needs a
/// connected Parser Worker handle too, since `/queue/process` and
/// `/status` expose manual control over both queues from the one process.
async fn run_detector_process(config: Config, consume: bool) -> Result<()> {
    let timeseries = TimeseriesStore::connect(&config.postgres_dsn).await?;
    let queue = QueueClient::new(config.rabbitmq_uri.clone());
    let detector_config = DetectorConfig {
        n_estimators: config.n_estimators,
        contamination: config.contamination,
        random_state: config.random_state,
    };

    let mut detector_worker = DetectorWorker::new(
        queue,
        timeseries,
        detector_config,
        config.model_path.clone(),
        config.training_data_path.clone(),
        config.raw_logs_queue.clone(),
        config.features_queue.clone(),
    );

    if consume {
        detector_worker.connect().await?;
    } else {
        detector_worker.bootstrap_model_only().await?;
    }

    let mut parser_worker = build_parser_worker(&config).await?;
    parser_worker.connect().await?;

    let detector_worker = Arc::new(detector_worker);
    let parser_worker = Arc::new(parser_worker);

    if consume {
        let detector_for_consumer = detector_worker.clone();
        tokio::spawn(async move {
            if let Err(e) = detector_for_consumer.serve().await {
                tracing::error!(error = %e, "detector worker consumer loop exited");
            }
        });
    }

    let model_dir = config
        .model_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let backups_dir = model_dir.join("backups");

    let state = Arc::new(AppState {
        parser: parser_worker,
        detector: detector_worker,
        model_dir,
        backups_dir,
    });

    tokio::select! {
        result = api::serve(state, &config.api_host, config.api_port) => result?,
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, exiting");
        }
    }

    Ok(())
}

async fn run_train(config: Config, args: TrainArgs) -> Result<()> {
    let detector_config = DetectorConfig {
        n_estimators: config.n_estimators,
        contamination: config.contamination,
        random_state: config.random_state,
    };
    let mut detector = AnomalyDetector::new(detector_config, config.model_path.clone());
    let stats = detector.train_from_csv(&args.csv_path)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
