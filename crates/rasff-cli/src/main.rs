use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rasff_sync::{CancelFlag, GapPolicy, IngestConfig, IngestPipeline, PeriodScanner, RunOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rasff-cli")]
#[command(about = "RASFF weekly bulletin ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and store every bulletin published since the latest stored week.
    Ingest {
        /// Treat this date as today (YYYY-MM-DD).
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// stop-on-first-gap or skip-and-continue.
        #[arg(long)]
        gap_policy: Option<GapPolicy>,
        #[arg(long)]
        no_report: bool,
    },
    /// Create or upgrade the rasff_data table.
    Migrate,
    /// List the weeks the next ingestion would fetch.
    Periods {
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Load a local bulletin file (xls, xlsx or csv).
    Import { file: PathBuf },
    /// Write a parquet snapshot and manifest of the whole table.
    Export { dir: PathBuf },
    Serve,
    /// Run ingestion on the RASFF_SYNC_CRON schedule until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn cancel_on_ctrl_c() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current week");
            flag.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = IngestConfig::from_env()?;

    let command = cli.command.unwrap_or(Commands::Ingest {
        as_of: None,
        gap_policy: None,
        no_report: false,
    });
    match command {
        Commands::Ingest {
            as_of,
            gap_policy,
            no_report,
        } => {
            if let Some(policy) = gap_policy {
                config.gap_policy = policy;
            }
            let summary = rasff_sync::run_ingest(
                &config,
                RunOptions {
                    as_of,
                    write_report: !no_report,
                    cancel: cancel_on_ctrl_c(),
                },
            )
            .await?;
            println!(
                "ingest complete: run_id={} periods={} rows={} stop={:?}",
                summary.run_id,
                summary.periods.len(),
                summary.rows_written,
                summary.stop_reason
            );
        }
        Commands::Migrate => {
            let store = config.open_store().await?;
            store.ensure_schema().await.context("migrating rasff_data")?;
            println!("schema ready: {} rows", store.count().await?);
        }
        Commands::Periods { as_of } => {
            let store = config.open_store().await?;
            let as_of = as_of.unwrap_or_else(|| Local::now().date_naive());
            let pending = PeriodScanner::new(config.epoch)
                .scan(&store, as_of)
                .await
                .context("reading latest stored period")?;
            for period in pending {
                println!("{period}");
            }
        }
        Commands::Import { file } => {
            let pipeline = IngestPipeline::from_config(&config).await?;
            let rows = pipeline.import_file(&file).await?;
            println!("imported {rows} rows from {}", file.display());
        }
        Commands::Export { dir } => {
            let pipeline = IngestPipeline::from_config(&config).await?;
            let manifest = pipeline.export_parquet_snapshot(&dir).await?;
            println!("snapshot written: {}", manifest.display());
        }
        Commands::Serve => {
            rasff_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let Some(mut sched) = rasff_sync::maybe_build_scheduler(&config).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
