//! `pairflow` command line interface

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pairflow::config::PipelineConfigBuilder;
use pairflow::model::PairKey;
use pairflow::reducer::FlowRecordReducer;
use pairflow::table::daily;
use pairflow::{Pipeline, PipelineConfig};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "pairflow")]
#[command(version, about = "Incremental per-pair network flow statistics", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "PAIRFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Put the store and queues under this directory
    #[arg(long, env = "PAIRFLOW_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Deliveries fetched per poll
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Deliveries processed at the same time
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload every *.csv in a directory and queue it for summarization
    Upload {
        /// Directory holding raw flow files
        dir: PathBuf,
        /// Bucket name recorded in the notices
        #[arg(long)]
        bucket: Option<String>,
    },
    /// Reduce a local raw file and print its daily summary
    Reduce {
        /// Raw flow file
        file: PathBuf,
    },
    /// Process queued upload notices until the queue is empty
    Summarize,
    /// Consolidate one summary, or drain the consolidate queue
    Consolidate {
        /// Summary name under the summary prefix
        #[arg(long)]
        summary: Option<String>,
    },
    /// Run both workers until Ctrl-C
    Run,
    /// Export the history of one pair
    Export {
        /// Source address
        src: String,
        /// Destination address
        dst: String,
        /// Output file, defaults to export_<src>_<dst>.csv
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the aggregate table
    Show,
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let base = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    let mut builder = PipelineConfigBuilder::from_config(base);
    if let Some(dir) = &cli.data_dir {
        builder = builder.data_dir(dir);
    }
    if let Some(size) = cli.batch_size {
        builder = builder.batch_size(size);
    }
    if let Some(concurrency) = cli.concurrency {
        builder = builder.concurrency(concurrency);
    }
    Ok(builder.build()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    pairflow::init_tracing(cli.json_logs);

    let config = load_config(&cli)?;

    if let Command::Reduce { file } = &cli.command {
        let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        let summary = FlowRecordReducer::new(config.reducer.clone())
            .reduce_bytes(&bytes)
            .with_context(|| format!("reducing {}", file.display()))?;
        std::io::stdout().write_all(&daily::encode(&summary)?)?;
        return Ok(());
    }

    let pipeline = Pipeline::open(config).await?;

    match cli.command {
        Command::Upload { dir, bucket } => {
            let mut uploader = pipeline.uploader();
            if let Some(bucket) = bucket {
                uploader = uploader.with_bucket(bucket);
            }
            let report = uploader.upload_dir(&dir).await?;
            println!(
                "uploaded {} file(s), skipped {} already present",
                report.uploaded.len(),
                report.skipped.len()
            );
        }
        Command::Reduce { .. } => {}
        Command::Summarize => {
            let worker = pipeline.summarize_worker();
            let handled = worker.drain().await?;
            info!(handled, processed = worker.metrics().processed(), "Summarize queue drained");
        }
        Command::Consolidate { summary: Some(name) } => {
            let report = pipeline.consolidator().consolidate(&name).await?;
            println!("{}: {:?} after {} attempt(s)", report.summary, report.outcome, report.attempts);
        }
        Command::Consolidate { summary: None } => {
            let worker = pipeline.consolidate_worker();
            let handled = worker.drain().await?;
            info!(handled, processed = worker.metrics().processed(), "Consolidate queue drained");
        }
        Command::Run => pipeline.run().await?,
        Command::Export { src, dst, output } => {
            let export = pipeline.exporter().export(&PairKey::new(src, dst)).await?;
            let path = output.unwrap_or_else(|| PathBuf::from(export.file_name()));
            std::fs::write(&path, export.encode()?).with_context(|| format!("writing {}", path.display()))?;
            println!("exported {} day(s) to {}", export.days.len(), path.display());
        }
        Command::Show => {
            let table = pipeline.exporter().load_table().await?;
            std::io::stdout().write_all(&table.encode()?)?;
        }
    }

    Ok(())
}
