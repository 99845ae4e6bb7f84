//! Metric samples collected over several runs of a test suite.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::error::{MetricsError, Result};

/// Identifier of a test case, e.g. `com.example.Suite#testScroll`.
pub type TestId = String;

/// Metrics reported by a single run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunMetrics {
    /// Number of tests the run executed.
    pub tests: u64,
    pub run_metrics: BTreeMap<String, f64>,
    pub test_metrics: BTreeMap<TestId, BTreeMap<String, f64>>,
}

/// Samples for every metric across all runs of one side (before or after).
///
/// Each metric holds one sample per run that reported it, in run order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsDataset {
    /// Number of runs added.
    pub runs: usize,
    /// Test count shared by every run; `None` until the first run is added.
    pub test_count: Option<u64>,
    pub run_metrics: BTreeMap<String, Vec<f64>>,
    pub test_metrics: BTreeMap<TestId, BTreeMap<String, Vec<f64>>>,
}

impl MetricsDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one run's samples.
    ///
    /// # Errors
    ///
    /// `MetricsError::Validation` if the run's test count differs from the
    /// runs already added.
    pub fn add_run(&mut self, run: RunMetrics) -> Result<()> {
        match self.test_count {
            Some(expected) if expected != run.tests => {
                return Err(MetricsError::Validation(format!(
                    "run {} reports {} tests, earlier runs reported {expected}",
                    self.runs + 1,
                    run.tests
                )));
            }
            _ => self.test_count = Some(run.tests),
        }

        for (name, value) in run.run_metrics {
            self.run_metrics.entry(name).or_default().push(value);
        }
        for (test, metrics) in run.test_metrics {
            let samples = self.test_metrics.entry(test).or_default();
            for (name, value) in metrics {
                samples.entry(name).or_default().push(value);
            }
        }

        self.runs += 1;
        Ok(())
    }

    /// Total number of distinct run-level and per-test metrics.
    pub fn metric_count(&self) -> usize {
        self.run_metrics.len() + self.test_metrics.values().map(BTreeMap::len).sum::<usize>()
    }

    /// Checks that every metric has one sample per run.
    ///
    /// Short sample lists are an error when `strict`, a warning otherwise.
    pub fn validate(&self, strict: bool) -> Result<()> {
        let run_level = self
            .run_metrics
            .iter()
            .map(|(name, samples)| (None::<&TestId>, name, samples.len()));
        let per_test = self.test_metrics.iter().flat_map(|(test, metrics)| {
            metrics
                .iter()
                .map(move |(name, samples)| (Some(test), name, samples.len()))
        });

        for (test, name, len) in run_level.chain(per_test) {
            if len == self.runs {
                continue;
            }
            let label = match test {
                Some(test) => format!("{test}/{name}"),
                None => name.clone(),
            };
            let message = format!("{label} has {len} samples, expected {}", self.runs);
            if strict {
                return Err(MetricsError::Validation(message));
            }
            warn!(metric = %label, samples = len, runs = self.runs, "Metric is missing samples");
        }
        Ok(())
    }
}

/// Checks that `before` and `after` are comparable.
///
/// Differing test counts are an error when `strict`, a warning otherwise.
/// Metrics present on only one side are always just a warning; the
/// comparison leaves them out.
pub fn validate_pair(before: &MetricsDataset, after: &MetricsDataset, strict: bool) -> Result<()> {
    if before.test_count != after.test_count {
        let message = format!(
            "before ran {} tests, after ran {}",
            display_count(before.test_count),
            display_count(after.test_count)
        );
        if strict {
            return Err(MetricsError::Validation(message));
        }
        warn!(%message, "Test counts differ");
    }

    warn_one_sided("run", before.run_metrics.keys(), after.run_metrics.keys());

    let before_tests: BTreeSet<&TestId> = before.test_metrics.keys().collect();
    let after_tests: BTreeSet<&TestId> = after.test_metrics.keys().collect();
    for test in before_tests.symmetric_difference(&after_tests) {
        warn!(test = %test, "Test reported on one side only");
    }
    for test in before_tests.intersection(&after_tests) {
        if let (Some(b), Some(a)) = (before.test_metrics.get(*test), after.test_metrics.get(*test)) {
            warn_one_sided(test.as_str(), b.keys(), a.keys());
        }
    }

    Ok(())
}

fn warn_one_sided<'a>(
    scope: &str,
    before: impl Iterator<Item = &'a String>,
    after: impl Iterator<Item = &'a String>,
) {
    let before: BTreeSet<&String> = before.collect();
    let after: BTreeSet<&String> = after.collect();
    for name in before.difference(&after) {
        warn!(scope, metric = %name, "Metric missing from after dataset");
    }
    for name in after.difference(&before) {
        warn!(scope, metric = %name, "Metric missing from before dataset");
    }
}

fn display_count(count: Option<u64>) -> String {
    count.map_or_else(|| "no".to_string(), |c| c.to_string())
}
