//! droidlink metrics - before/after regression detection
//!
//! Compares metric samples from runs before and after a change and flags
//! metrics whose after samples mostly fall outside the before distribution.
//! Each flagged metric carries a Monte Carlo estimate of how often the rule
//! fires on unchanged data.
//!
//! - `loader` - Reads `metrics-*.xml` (or `.json`) run files into a dataset
//! - `dataset` - Samples per metric, plus validation
//! - `stats` - Mean, standard deviation, outlier rule, false-positive estimate
//! - `compare` - Runs the rule over every metric both sides report
//! - `report` - Text rendering of the result
//!
//! ```no_run
//! use std::path::Path;
//! use droidlink_metrics::{compare, load_dataset, DetectorConfig};
//!
//! # fn main() -> Result<(), droidlink_metrics::MetricsError> {
//! let before = load_dataset(Path::new("out/before"))?;
//! let after = load_dataset(Path::new("out/after"))?;
//! let report = compare(&before, &after, &DetectorConfig::default())?;
//! println!("{}", report.render());
//! # Ok(())
//! # }
//! ```

pub mod compare;
pub mod dataset;
pub mod error;
pub mod loader;
pub mod report;
pub mod stats;

pub use compare::{compare, DetectorConfig};
pub use dataset::{validate_pair, MetricsDataset, RunMetrics, TestId};
pub use error::{MetricsError, Result};
pub use loader::{load_dataset, load_dataset_with, JsonMetricsParser, MetricsParser, XmlMetricsParser};
pub use report::{MetricChange, RegressionReport};
