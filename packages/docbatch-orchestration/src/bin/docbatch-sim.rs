//! Docbatch Simulator CLI
//!
//! Runs a batch through the simulated stage runner and prints progress.
//!
//! # Usage
//!
//! ```bash
//! # Three files, the second one failing extraction once
//! cargo run --bin docbatch-sim -- run a.pdf:2 b.pdf:5 c.pdf:1 --fail b.pdf:extraction:1
//!
//! # Persist snapshots and pick the batch up again later
//! cargo run --bin docbatch-sim -- run a.pdf:2 --state-db docbatch.db --step-delay-ms 200
//! cargo run --bin docbatch-sim -- resume --state-db docbatch.db
//!
//! # List saved batches
//! cargo run --bin docbatch-sim -- list --state-db docbatch.db
//! ```

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use docbatch_orchestration::{
    BatchController, BatchStatus, FailureRule, FileInput, MultiFileConfig, SimulatedStageRunner,
    Stage, UpdateKind, MB,
};
use docbatch_storage::{BatchStateStore, SqliteBatchStateStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "docbatch-sim")]
#[command(about = "Docbatch - simulated multi-file processing queue", long_about = None)]
struct Cli {
    /// YAML batch configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite file for batch snapshots
    #[arg(long, global = true)]
    state_db: Option<PathBuf>,

    /// Delay between simulated progress reports
    #[arg(long, global = true, default_value = "50")]
    step_delay_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit files and process them
    Run {
        /// Files as NAME[:SIZE_MB] (size defaults to 1)
        #[arg(required = true)]
        files: Vec<String>,

        /// Inject a failure as NAME:STAGE[:ATTEMPTS]
        #[arg(long = "fail")]
        failures: Vec<String>,

        /// Process several files at once
        #[arg(long)]
        concurrent: bool,
    },

    /// Restore a saved batch and finish it
    Resume {
        /// Batch id (latest saved batch when omitted)
        #[arg(long)]
        batch_id: Option<String>,
    },

    /// List saved batches
    List,
}

fn parse_file(spec: &str) -> anyhow::Result<FileInput> {
    let (name, size_mb) = match spec.rsplit_once(':') {
        Some((name, size)) => {
            let size: f64 = size
                .parse()
                .with_context(|| format!("invalid size in '{}'", spec))?;
            (name, size)
        }
        None => (spec, 1.0),
    };
    if name.is_empty() || size_mb < 0.0 {
        bail!("invalid file spec '{}'", spec);
    }

    let mime = if name.to_ascii_lowercase().ends_with(".pdf") {
        "application/pdf"
    } else {
        "application/octet-stream"
    };
    Ok(FileInput::new(name, (size_mb * MB as f64) as u64, mime))
}

fn parse_failure(spec: &str) -> anyhow::Result<FailureRule> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (name, stage) = match parts.as_slice() {
        [name, stage] | [name, stage, _] => (*name, Stage::from_str(stage)?),
        _ => bail!("invalid failure spec '{}', expected NAME:STAGE[:ATTEMPTS]", spec),
    };

    match parts.get(2) {
        Some(attempts) => {
            let attempts: u32 = attempts
                .parse()
                .with_context(|| format!("invalid attempt count in '{}'", spec))?;
            Ok(FailureRule::times(name, stage, attempts))
        }
        None => Ok(FailureRule::always(name, stage)),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<MultiFileConfig> {
    let mut config = match &cli.config {
        Some(path) => MultiFileConfig::from_yaml(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MultiFileConfig::default(),
    };
    config.persist_batch_state = cli.state_db.is_some();
    Ok(config)
}

fn open_store(cli: &Cli) -> anyhow::Result<Option<Arc<dyn BatchStateStore>>> {
    match &cli.state_db {
        Some(path) => {
            let store = SqliteBatchStateStore::open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            Ok(Some(Arc::new(store)))
        }
        None => Ok(None),
    }
}

fn build_controller(
    config: MultiFileConfig,
    runner: SimulatedStageRunner,
    store: Option<Arc<dyn BatchStateStore>>,
) -> anyhow::Result<BatchController> {
    let mut builder = BatchController::builder(Arc::new(runner)).config(config);
    if let Some(store) = store {
        builder = builder.persistence(store);
    }
    Ok(builder.build()?)
}

/// Print file-level updates until the batch ends (or Ctrl-C stops it)
async fn watch(controller: &BatchController) -> anyhow::Result<BatchStatus> {
    let (_id, mut updates) = controller.subscribe_channel();
    let printer = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            match update.kind {
                UpdateKind::FileUpdate => println!(
                    "[{:>5.1}%] {} -> {}{}",
                    update.overall_progress,
                    update.file_name.unwrap_or_default(),
                    update.file_status.map(|s| s.as_str()).unwrap_or("?"),
                    update.error.map(|e| format!(" ({})", e)).unwrap_or_default()
                ),
                UpdateKind::BatchUpdate => {
                    if let Some(status) = update.batch_status {
                        println!("[{:>5.1}%] batch {}", update.overall_progress, status);
                    }
                }
                UpdateKind::StageUpdate => {}
            }
        }
    });

    let status = tokio::select! {
        status = controller.wait_until_finished() => status,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping batch");
            controller.stop_processing().await?;
            controller.wait_until_finished().await
        }
    };
    printer.abort();

    status.ok_or_else(|| anyhow!("batch disappeared before finishing"))
}

fn print_summary(controller: &BatchController) {
    let progress = controller.progress();
    println!("{}", progress.progress_text);
    println!(
        "completed {} / failed {} / cancelled {} (total cost {:.4})",
        progress.completed_files, progress.failed_files, progress.cancelled_files, progress.total_cost
    );
    for record in controller.failed_files() {
        if let Some(error) = record.error() {
            println!("  {}", error);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = open_store(&cli)?;
    let delay = Duration::from_millis(cli.step_delay_ms);

    match &cli.command {
        Commands::Run {
            files,
            failures,
            concurrent,
        } => {
            let inputs = files
                .iter()
                .map(|f| parse_file(f))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let mut runner = SimulatedStageRunner::new().with_step_delay(delay);
            for spec in failures {
                runner = runner.with_failure(parse_failure(spec)?);
            }
            let config = MultiFileConfig {
                concurrent_processing: *concurrent || config.concurrent_processing,
                ..config
            };

            let controller = build_controller(config, runner, store)?;
            let (batch_id, report) = controller.submit(inputs).await?;
            for rejected in &report.rejected {
                warn!("Rejected {}: {}", rejected.file.name, rejected.reason);
            }
            if report.accepted.is_empty() {
                bail!("no acceptable files");
            }

            info!("Batch {} accepted {} files", batch_id, report.accepted.len());
            if controller.batch().map(|b| b.status) == Some(BatchStatus::Idle) {
                controller.start_processing().await?;
            }
            let status = watch(&controller).await?;
            print_summary(&controller);
            if status == BatchStatus::Failed {
                std::process::exit(2);
            }
        }
        Commands::Resume { batch_id } => {
            if store.is_none() {
                bail!("--state-db is required to resume");
            }
            let runner = SimulatedStageRunner::new().with_step_delay(delay);
            let controller = build_controller(config, runner, store)?;
            if !controller.load_state(batch_id.as_deref()).await? {
                bail!("no saved batch found");
            }

            match controller.batch().map(|b| b.status) {
                Some(BatchStatus::Idle) => controller.start_processing().await?,
                Some(BatchStatus::Paused) => controller.resume_processing().await?,
                _ => {}
            }
            watch(&controller).await?;
            print_summary(&controller);
        }
        Commands::List => {
            let store = store.ok_or_else(|| anyhow!("--state-db is required to list batches"))?;
            for summary in store.list().await? {
                println!(
                    "{}  {:<10}  {}",
                    summary.batch_id,
                    summary.status,
                    summary.saved_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}
