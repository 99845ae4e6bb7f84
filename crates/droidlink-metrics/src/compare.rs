//! Before/after comparison of two datasets.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::dataset::{validate_pair, MetricsDataset, TestId};
use crate::error::{MetricsError, Result};
use crate::report::{MetricChange, RegressionReport};
use crate::stats;

/// Knobs for [`compare`].
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Raise validation problems instead of logging them.
    pub strict: bool,
    /// Outlier distance in standard deviations.
    pub threshold: f64,
    /// Monte Carlo trials per false-positive estimate.
    pub samples: usize,
    /// Metric names to leave out of the comparison.
    pub ignore: Vec<Regex>,
    /// Seed for reproducible estimates; entropy when `None`.
    pub seed: Option<u64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            strict: false,
            threshold: stats::STD_DEV_THRESHOLD,
            samples: stats::SAMPLES,
            ignore: Vec::new(),
            seed: None,
        }
    }
}

impl DetectorConfig {
    /// Compiles `patterns` into the ignore list.
    pub fn with_ignore_patterns<S: AsRef<str>>(mut self, patterns: &[S]) -> Result<Self> {
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let regex = Regex::new(pattern).map_err(|e| MetricsError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
            self.ignore.push(regex);
        }
        Ok(self)
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignore.iter().any(|re| re.is_match(name))
    }
}

/// Compares `after` against `before` and reports the metrics that moved.
///
/// # Errors
///
/// `MetricsError::Validation` in strict mode when the datasets disagree on
/// test counts or a metric is missing samples.
pub fn compare(
    before: &MetricsDataset,
    after: &MetricsDataset,
    config: &DetectorConfig,
) -> Result<RegressionReport> {
    validate_pair(before, after, config.strict)?;
    before.validate(config.strict)?;
    after.validate(config.strict)?;

    let rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut detector = Detector {
        config,
        rng,
        estimates: HashMap::new(),
        compared: 0,
    };

    let run_changes = detector.compare_group(None, &before.run_metrics, &after.run_metrics);
    let run_compared = std::mem::take(&mut detector.compared);

    let mut test_changes = BTreeMap::new();
    for (test, before_metrics) in &before.test_metrics {
        let Some(after_metrics) = after.test_metrics.get(test) else {
            continue;
        };
        let changes = detector.compare_group(Some(test), before_metrics, after_metrics);
        if !changes.is_empty() {
            test_changes.insert(test.clone(), changes);
        }
    }

    let report = RegressionReport {
        generated_at: Utc::now(),
        run_compared,
        test_compared: detector.compared,
        run_changes,
        test_changes,
    };
    info!(
        run_compared = report.run_compared,
        test_compared = report.test_compared,
        changed = report.changed(),
        "Metrics comparison finished"
    );
    Ok(report)
}

struct Detector<'a> {
    config: &'a DetectorConfig,
    rng: StdRng,
    /// False-positive estimates by (before_len, after_len). The estimate
    /// does not depend on the baseline's location or scale.
    estimates: HashMap<(usize, usize), f64>,
    compared: usize,
}

impl Detector<'_> {
    fn compare_group(
        &mut self,
        test: Option<&TestId>,
        before: &BTreeMap<String, Vec<f64>>,
        after: &BTreeMap<String, Vec<f64>>,
    ) -> Vec<MetricChange> {
        let mut changes = Vec::new();

        for (name, before_samples) in before {
            if self.config.is_ignored(name) {
                debug!(metric = %name, "Ignoring metric");
                continue;
            }
            let Some(after_samples) = after.get(name) else {
                continue;
            };
            if before_samples.is_empty() || after_samples.is_empty() {
                warn!(metric = %name, "Metric has no samples on one side");
                continue;
            }

            self.compared += 1;
            if let Some(change) = self.compare_metric(test, name, before_samples, after_samples) {
                changes.push(change);
            }
        }

        changes
    }

    fn compare_metric(
        &mut self,
        test: Option<&TestId>,
        name: &str,
        before: &[f64],
        after: &[f64],
    ) -> Option<MetricChange> {
        let before_mean = stats::mean(before);
        let before_stddev = stats::population_stddev(before);
        let outliers = stats::count_outliers(before_mean, before_stddev, after, self.config.threshold);

        if !stats::is_regression(outliers, after.len()) {
            return None;
        }

        let false_positive = self.false_positive(before_mean, before_stddev, before.len(), after.len());
        debug!(
            test = test.map(String::as_str),
            metric = name,
            outliers,
            false_positive,
            "Metric changed"
        );

        Some(MetricChange {
            test: test.cloned(),
            name: name.to_string(),
            before_mean,
            before_stddev,
            after_mean: stats::mean(after),
            outliers,
            after_samples: after.len(),
            false_positive,
        })
    }

    fn false_positive(
        &mut self,
        before_mean: f64,
        before_stddev: f64,
        before_len: usize,
        after_len: usize,
    ) -> f64 {
        // Flat baselines are answered without simulation and not cached.
        if before_stddev <= 0.0 {
            return stats::false_positive_probability(
                before_mean,
                before_stddev,
                before_len,
                after_len,
                self.config.threshold,
                self.config.samples,
                &mut self.rng,
            );
        }
        if let Some(p) = self.estimates.get(&(before_len, after_len)) {
            return *p;
        }
        let p = stats::false_positive_probability(
            before_mean,
            before_stddev,
            before_len,
            after_len,
            self.config.threshold,
            self.config.samples,
            &mut self.rng,
        );
        self.estimates.insert((before_len, after_len), p);
        p
    }
}
