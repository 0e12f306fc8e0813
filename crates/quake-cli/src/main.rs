use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use quake_core::PartitionKey;
use quake_sync::{
    build_scheduler, combine, discover_partitions, split_master, CombineRequest, IngestPipeline,
    QuakeConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "quake-cli")]
#[command(about = "Harvest earthquake bulletins into monthly CSV partitions")]
struct Cli {
    /// YAML config file; QUAKE_* environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the latest events page once and append new rows.
    Ingest,
    /// Merge partitions (or the given files) into a deduplicated master CSV.
    Combine {
        inputs: Vec<PathBuf>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        parquet: bool,
    },
    /// Rewrite one year's monthly partitions from a master CSV.
    Split {
        master: PathBuf,
        #[arg(long)]
        year: i32,
    },
    /// Row count and time span of a partition (current month by default).
    Stats {
        /// Partition as YYYY_MM.
        #[arg(long)]
        month: Option<PartitionKey>,
    },
    /// Run ingest on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing(log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_ref())?;
    let config = QuakeConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = IngestPipeline::new(config)?.run_once().await?;
            println!(
                "ingest complete: run_id={} status={:?} scraped={} appended={} duplicates={} unparseable={} failed_partitions={}",
                summary.run_id,
                summary.status,
                summary.rows_scraped,
                summary.route.appended,
                summary.route.duplicates,
                summary.route.unparseable,
                summary.route.failed_partitions.len()
            );
            if let Some(stats) = summary.current_month {
                println!("current month {}: {} records", stats.key, stats.rows);
            }
        }
        Commands::Combine {
            inputs,
            year,
            label,
            output_dir,
            parquet,
        } => {
            let store = config.partition_store();
            let inputs = if inputs.is_empty() {
                discover_partitions(&store, year)?
            } else {
                inputs
            };
            let report = combine(&CombineRequest {
                inputs,
                output_dir: output_dir.unwrap_or_else(|| config.data_dir.clone()),
                output_prefix: config.partition_prefix.clone(),
                label: label.or_else(|| year.map(|y| y.to_string())),
                generated_at: Local::now().naive_local(),
                parquet,
            })?;
            println!(
                "combine complete: output={} records={} removed_duplicates={} skipped_files={}",
                report.output_path.display(),
                report.summary.total_records,
                report.duplicates_removed,
                report.skipped_files
            );
            if let (Some(earliest), Some(latest)) = (report.summary.earliest, report.summary.latest) {
                println!("date range: {earliest} to {latest}");
            }
            for bucket in &report.summary.magnitude_histogram {
                println!("  {:<16} {:>6} ({:.1}%)", bucket.label, bucket.count, bucket.percent);
            }
        }
        Commands::Split { master, year } => {
            let report = split_master(&master, year, &config.partition_store())
                .with_context(|| format!("splitting {}", master.display()))?;
            if report.files.is_empty() {
                println!("no {year} records in {}", master.display());
            }
            for file in &report.files {
                println!(
                    "{}: {} records ({} kept from the existing partition)",
                    file.path.display(),
                    file.rows,
                    file.carried_over
                );
            }
            println!(
                "split complete: matched={} carried_over={} unparseable={} failed_partitions={}",
                report.matched,
                report.carried_over,
                report.unparseable,
                report.failed_partitions.len()
            );
        }
        Commands::Stats { month } => {
            let key = month.unwrap_or_else(|| PartitionKey::of(&Local::now().naive_local()));
            match config.partition_store().stats(key)? {
                Some(stats) => {
                    println!("{}: {} records", stats.path.display(), stats.rows);
                    if let (Some(earliest), Some(latest)) = (stats.earliest, stats.latest) {
                        println!("date range: {earliest} to {latest}");
                    }
                }
                None => println!("no partition for {key}"),
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(IngestPipeline::new(config)?);
            let mut sched = build_scheduler(pipeline.clone()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().schedule_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
