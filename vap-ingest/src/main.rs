//! vap-ingest - VAT invoice ingestion and consolidation pipeline
//!
//! Single-host batch job: workbooks in, a deduplicated year-partitioned
//! invoice ledger (plus manifests, duplicate exports, and an error log) out.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vap_ingest::workbook::ExcelOpener;
use vap_ingest::{Pipeline, RunContext};

#[derive(Parser, Debug)]
#[command(name = "vap-ingest", version, about = "VAT invoice audit ingestion pipeline")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the configured input directory
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Override the configured business tag
    #[arg(long)]
    business_tag: Option<String>,

    /// Force sequential mode (direct database writes, one transaction per file)
    #[arg(long)]
    sequential: bool,

    /// Verbose (debug-level) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!("Starting vap-ingest");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = vap_common::config::load_config(&args.config)?;
    if let Some(input_dir) = args.input_dir {
        config.paths.input_dir = input_dir.display().to_string();
    }
    if let Some(tag) = args.business_tag {
        config.business.tag = tag;
    }
    if args.sequential {
        config.import.parallel = false;
    }
    vap_common::config::validate_config(&config)?;

    let ctx = RunContext::from_config(&config);
    let pipeline = Pipeline::new(ctx, Arc::new(ExcelOpener));
    let report = pipeline.run().await?;

    tracing::info!(
        total = report.summary.total_files,
        processed = report.summary.processed_files,
        errors = report.errors.len(),
        "Run finished"
    );
    Ok(())
}
