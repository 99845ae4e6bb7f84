//! Plain-text regression report.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::dataset::TestId;

/// One metric whose after samples were flagged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricChange {
    /// Owning test, or `None` for a run-level metric.
    pub test: Option<TestId>,
    pub name: String,
    pub before_mean: f64,
    pub before_stddev: f64,
    pub after_mean: f64,
    /// After samples outside the threshold.
    pub outliers: usize,
    pub after_samples: usize,
    /// Estimated chance of flagging this metric with no real change.
    pub false_positive: f64,
}

/// Result of comparing two datasets.
#[derive(Debug, Clone, Serialize)]
pub struct RegressionReport {
    pub generated_at: DateTime<Utc>,
    /// Run-level metrics present on both sides and compared.
    pub run_compared: usize,
    /// Per-test metrics present on both sides and compared.
    pub test_compared: usize,
    pub run_changes: Vec<MetricChange>,
    pub test_changes: BTreeMap<TestId, Vec<MetricChange>>,
}

const NAME_WIDTH: usize = 40;

impl RegressionReport {
    /// Number of flagged metrics.
    pub fn changed(&self) -> usize {
        self.run_changes.len() + self.test_changed()
    }

    /// Number of flagged per-test metrics.
    pub fn test_changed(&self) -> usize {
        self.test_changes.values().map(Vec::len).sum()
    }

    pub fn has_changes(&self) -> bool {
        self.changed() > 0
    }

    /// Renders the report as a text table.
    pub fn render(&self) -> String {
        let mut out = String::new();

        // Writing to a String cannot fail.
        let _ = writeln!(out, "Metrics regression report");
        let _ = writeln!(out, "Generated: {}", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"));

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Run metrics: {} compared, {} changed",
            self.run_compared,
            self.run_changes.len()
        );
        if !self.run_changes.is_empty() {
            render_table(&mut out, &self.run_changes);
        }

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Test metrics: {} compared, {} changed",
            self.test_compared,
            self.test_changed()
        );
        for (test, changes) in &self.test_changes {
            let _ = writeln!(out, "Test {test}:");
            render_table(&mut out, changes);
        }

        out
    }

    /// Emits the rendered report through `tracing`, one line per event.
    pub fn log(&self) {
        for line in self.render().lines() {
            info!("{line}");
        }
    }
}

fn render_table(out: &mut String, changes: &[MetricChange]) {
    let _ = writeln!(
        out,
        "  {:<NAME_WIDTH$} {:>14} {:>14} {:>15}",
        "metric", "before mean", "after mean", "false positive"
    );
    for change in changes {
        let _ = writeln!(
            out,
            "  {:<NAME_WIDTH$} {:>14.3} {:>14.3} {:>14.2}%",
            change.name,
            change.before_mean,
            change.after_mean,
            change.false_positive * 100.0
        );
    }
}
