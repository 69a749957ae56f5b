//! CLI tool that ingests a data root of access logs into a master table.

mod error;
mod progress;

use std::path::PathBuf;
use std::time::Instant;

use analog_core::{
    CombineStrategy, MasterTable, Pipeline, PipelineConfig, analysis::Analysis,
};
use clap::{ArgAction, Parser};
use snafu::ResultExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    error::{AnalyzeSnafu, CliResult, CoverageSnafu, PipelineSnafu},
    progress::MonthBars,
};

#[derive(Debug, Parser)]
#[command(
    name = "analog",
    version,
    about = "Ingest monthly access logs into validated, enriched Parquet tables"
)]
struct Cli {
    /// Data root holding access-logs/ and location-db/
    #[arg(env = "ANALOG_ROOT", default_value = ".")]
    root: PathBuf,

    /// Delete enriched tables and combined outputs before ingesting
    #[arg(long, default_value_t = false)]
    clean: bool,

    /// Combine monthly tables into the master table one month at a time
    #[arg(long = "incr", default_value_t = false)]
    incremental: bool,

    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG wins when set
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(&self.root);
        config.clean = self.clean;
        if self.incremental {
            config.combine = CombineStrategy::Incremental;
        }
        config
    }
}

fn log_filter(verbose: u8) -> EnvFilter {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn init_logging(verbose: u8) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose))
        .with_writer(std::io::stderr)
        .try_init();
}

/// Coverage summary and monthly page views, one line each.
fn report(master: &MasterTable) -> CliResult<Vec<String>> {
    let summary = master.coverage().summary().context(CoverageSnafu)?;
    let mut lines = vec![format!(
        "{}: {} requests over {} months ({} days) from {} to {}",
        summary.domain, summary.requests, summary.months, summary.days, summary.begin, summary.end
    )];
    if let Some(missing) = &summary.missing {
        lines.push(format!("missing months: {missing}"));
    }

    let views = Analysis::new(master.table().clone())
        .successful()
        .get()
        .markup()
        .humans()
        .monthly_requests()
        .context(AnalyzeSnafu)?;
    lines.push("page views by humans:".to_string());
    for (month, count) in views.iter() {
        lines.push(format!("  {month}  {count:>8}"));
    }
    Ok(lines)
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let started = Instant::now();
    let mut pipeline = Pipeline::open(cli.config()).await.context(PipelineSnafu)?;
    let progress = MonthBars::new();
    let master = pipeline.run(&progress).await.context(PipelineSnafu)?;
    info!(
        rows = master.table().num_rows(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Pipeline finished"
    );

    for line in report(&master)? {
        println!("{line}");
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
