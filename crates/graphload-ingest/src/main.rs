//! graphload - declarative graph ingestion tool

use anyhow::{Context, Result};
use clap::Parser;
use graphload_common::logging::{init_logging, LogConfig, LogLevel};
use graphload_ingest::sink::{GraphSink, Neo4jConfig, Neo4jHttpSink, RecordingSink};
use graphload_ingest::{Coordinator, IngestPlan, RunContext};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "graphload")]
#[command(author, version, about = "Load CSV and JSON sources into a graph database")]
struct Cli {
    /// Ingestion plan (YAML)
    config: PathBuf,

    /// Parse and map every source without writing to the store
    #[arg(long)]
    dry_run: bool,

    /// Target database, overriding the plan
    #[arg(short, long)]
    database: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        },
    }
}

async fn run() -> Result<bool> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    // environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("graphload")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let mut plan = IngestPlan::load(&cli.config)
        .with_context(|| format!("Failed to load plan {}", cli.config.display()))?;
    if let Some(database) = cli.database {
        plan.database = Some(database);
        plan.validate()?;
    }

    let sink: Arc<dyn GraphSink> = if cli.dry_run {
        info!("Dry run: nothing will be written");
        Arc::new(RecordingSink::new())
    } else {
        let config = Neo4jConfig::from_plan(&plan)?;
        info!(uri = %config.uri, "Connecting to graph store");
        Arc::new(Neo4jHttpSink::new(config)?)
    };

    let context = RunContext::new(sink);
    let cancel = context.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next chunk boundary");
            cancel.cancel();
        }
    });

    let report = Coordinator::new(Arc::new(plan), context).run().await;
    for source in report.failed_sources() {
        if let Some(e) = source.error() {
            error!(source = source.index, location = %source.location, "{}", e);
        }
    }
    if let Some(e) = &report.error {
        error!(stage = %e.stage(), "{}", e);
    }

    info!(
        run_id = %report.run_id,
        state = ?report.state,
        rows = report.rows_written(),
        batches = report.batches(),
        "Run finished"
    );
    Ok(report.is_success())
}
