//! metricdiff - flag metrics that regressed between two sets of runs
//!
//! # Usage
//!
//! ```bash
//! metricdiff --before out/before --after out/after
//! metricdiff --before a --after b --strict --ignore '^memory_' --seed 1
//! metricdiff --before a --after b --format json
//! ```
//!
//! Exits with status 1 when any metric changed.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use droidlink_metrics::{
    compare, load_dataset_with, stats, DetectorConfig, JsonMetricsParser, MetricsParser,
    XmlMetricsParser,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Compare metrics from runs before and after a change
#[derive(Parser, Debug)]
#[command(name = "metricdiff", version, about)]
struct Args {
    /// Directory of metrics files from the baseline runs
    #[arg(long)]
    before: PathBuf,

    /// Directory of metrics files from the runs under test
    #[arg(long)]
    after: PathBuf,

    /// Metrics file format
    #[arg(long, value_enum, default_value_t = Format::Xml)]
    format: Format,

    /// Fail on inconsistent datasets instead of warning
    #[arg(long)]
    strict: bool,

    /// Skip metrics whose name matches this pattern (repeatable)
    #[arg(long = "ignore", value_name = "PATTERN")]
    ignore: Vec<String>,

    /// Outlier distance in standard deviations
    #[arg(long, default_value_t = stats::STD_DEV_THRESHOLD)]
    threshold: f64,

    /// Monte Carlo trials per false-positive estimate
    #[arg(long, default_value_t = stats::SAMPLES)]
    samples: usize,

    /// Seed for reproducible estimates
    #[arg(long)]
    seed: Option<u64>,
}

/// Metrics file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// metrics-*.xml test suite reports
    Xml,
    /// metrics-*.json run objects
    Json,
}

impl Format {
    fn parser(self) -> &'static dyn MetricsParser {
        match self {
            Format::Xml => &XmlMetricsParser,
            Format::Json => &JsonMetricsParser,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("metricdiff=info".parse()?)
                .add_directive("droidlink_metrics=warn".parse()?),
        )
        .init();

    let config = DetectorConfig {
        strict: args.strict,
        threshold: args.threshold,
        samples: args.samples,
        seed: args.seed,
        ..DetectorConfig::default()
    }
    .with_ignore_patterns(args.ignore.as_slice())
    .context("Invalid --ignore pattern")?;

    let parser = args.format.parser();
    let before = load_dataset_with(&args.before, parser)
        .with_context(|| format!("Failed to load {}", args.before.display()))?;
    let after = load_dataset_with(&args.after, parser)
        .with_context(|| format!("Failed to load {}", args.after.display()))?;

    let report = compare(&before, &after, &config).context("Comparison failed")?;
    print!("{}", report.render());

    if report.has_changes() {
        info!(changed = report.changed(), "Regressions found");
        process::exit(1);
    }
    Ok(())
}
