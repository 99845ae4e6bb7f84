//! Reads a directory of per-run metrics files into a [`MetricsDataset`].
//!
//! Every file named `metrics-*.xml` is one run, in the layout test harness
//! metrics reporters write:
//!
//! ```xml
//! <testsuite name="PerfSuite" tests="12">
//!   <runmetric name="boot_time_ms" value="5321" />
//!   <testcase classname="com.example.Suite" testname="testScroll">
//!     <testmetric name="jank_frames" value="3" />
//!   </testcase>
//! </testsuite>
//! ```
//!
//! A per-test metric belongs to the test `classname#testname`.
//! [`JsonMetricsParser`] reads the same data from `metrics-*.json`:
//!
//! ```json
//! {
//!   "tests": 12,
//!   "run_metrics": { "boot_time_ms": 5321, "build": "user" },
//!   "test_metrics": { "com.example.Suite#testScroll": { "jank_frames": "3" } }
//! }
//! ```
//!
//! Values that are not numbers (or numeric strings) are skipped.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::dataset::{MetricsDataset, RunMetrics};
use crate::error::{MetricsError, Result};

/// File name prefix of a metrics file.
pub const METRICS_FILE_PREFIX: &str = "metrics-";

/// Turns one metrics file into a run.
pub trait MetricsParser {
    /// Returns true for file names this parser reads.
    fn accepts(&self, file_name: &str) -> bool;

    /// Parses the contents of `path`.
    fn parse(&self, path: &Path, text: &str) -> Result<RunMetrics>;
}

/// Parser for `metrics-*.xml` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlMetricsParser;

impl MetricsParser for XmlMetricsParser {
    fn accepts(&self, file_name: &str) -> bool {
        file_name.starts_with(METRICS_FILE_PREFIX) && file_name.ends_with(".xml")
    }

    fn parse(&self, path: &Path, text: &str) -> Result<RunMetrics> {
        let parse_error = |message: String| MetricsError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let doc = roxmltree::Document::parse(text).map_err(|e| parse_error(e.to_string()))?;
        let suite = doc.root_element();
        if suite.tag_name().name() != "testsuite" {
            return Err(parse_error(format!(
                "expected <testsuite>, found <{}>",
                suite.tag_name().name()
            )));
        }

        let tests = suite
            .attribute("tests")
            .ok_or_else(|| parse_error("<testsuite> has no tests attribute".to_string()))?
            .trim()
            .parse::<u64>()
            .map_err(|e| parse_error(format!("invalid tests attribute: {e}")))?;

        let mut run = RunMetrics {
            tests,
            ..Default::default()
        };

        for node in suite.children().filter(|n| n.is_element()) {
            match node.tag_name().name() {
                "runmetric" => {
                    if let Some((name, value)) = xml_metric(&node) {
                        run.run_metrics.insert(name, value);
                    }
                }
                "testcase" => {
                    let class = node.attribute("classname").unwrap_or_default();
                    let Some(test) = node.attribute("testname") else {
                        trace!(class, "Skipping testcase without testname");
                        continue;
                    };
                    let metrics = run.test_metrics.entry(format!("{class}#{test}")).or_default();
                    for metric in node.children().filter(|n| n.has_tag_name("testmetric")) {
                        if let Some((name, value)) = xml_metric(&metric) {
                            metrics.insert(name, value);
                        }
                    }
                }
                other => trace!(element = other, "Ignoring element"),
            }
        }

        Ok(run)
    }
}

fn xml_metric(node: &roxmltree::Node<'_, '_>) -> Option<(String, f64)> {
    let name = node.attribute("name")?;
    let raw = node.attribute("value").unwrap_or_default();
    match parse_number(raw) {
        Some(value) => Some((name.to_string(), value)),
        None => {
            trace!(metric = name, value = raw, "Skipping non-numeric metric");
            None
        }
    }
}

/// Parser for `metrics-*.json` files.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMetricsParser;

#[derive(Deserialize)]
struct RawRun {
    tests: u64,
    #[serde(default)]
    run_metrics: BTreeMap<String, Value>,
    #[serde(default)]
    test_metrics: BTreeMap<String, BTreeMap<String, Value>>,
}

impl MetricsParser for JsonMetricsParser {
    fn accepts(&self, file_name: &str) -> bool {
        file_name.starts_with(METRICS_FILE_PREFIX) && file_name.ends_with(".json")
    }

    fn parse(&self, path: &Path, text: &str) -> Result<RunMetrics> {
        let raw: RawRun = serde_json::from_str(text).map_err(|e| MetricsError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Ok(RunMetrics {
            tests: raw.tests,
            run_metrics: numeric_only(raw.run_metrics),
            test_metrics: raw
                .test_metrics
                .into_iter()
                .map(|(test, metrics)| (test, numeric_only(metrics)))
                .collect(),
        })
    }
}

fn numeric_only(values: BTreeMap<String, Value>) -> BTreeMap<String, f64> {
    values
        .into_iter()
        .filter_map(|(name, value)| match numeric_value(&value) {
            Some(number) => Some((name, number)),
            None => {
                trace!(metric = %name, %value, "Skipping non-numeric metric");
                None
            }
        })
        .collect()
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Loads every metrics file in `dir` with [`XmlMetricsParser`].
pub fn load_dataset(dir: &Path) -> Result<MetricsDataset> {
    load_dataset_with(dir, &XmlMetricsParser)
}

/// Loads every file in `dir` that `parser` accepts, in file name order.
///
/// # Errors
///
/// - `MetricsError::Io` if the directory or a file cannot be read
/// - `MetricsError::Parse` if a file is malformed
/// - `MetricsError::Validation` if runs disagree on the test count
pub fn load_dataset_with(dir: &Path, parser: &dyn MetricsParser) -> Result<MetricsDataset> {
    let files = metrics_files(dir, parser)?;
    let mut dataset = MetricsDataset::new();

    for path in &files {
        let text = fs::read_to_string(path).map_err(|e| MetricsError::io(path, e))?;
        let run = parser.parse(path, &text)?;
        debug!(path = %path.display(), tests = run.tests, "Loaded metrics run");
        dataset.add_run(run)?;
    }

    info!(
        dir = %dir.display(),
        runs = dataset.runs,
        metrics = dataset.metric_count(),
        "Loaded metrics dataset"
    );
    Ok(dataset)
}

fn metrics_files(dir: &Path, parser: &dyn MetricsParser) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| MetricsError::io(dir, e))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| MetricsError::io(dir, e))?;
        let path = entry.path();
        let accepted = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| parser.accepts(name));
        if accepted && path.is_file() {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accepts_metrics_files_only() {
        let parser = JsonMetricsParser;
        assert!(parser.accepts("metrics-001.json"));
        assert!(!parser.accepts("metrics-001.xml"));
        assert!(!parser.accepts("summary.json"));
    }

    #[test]
    fn test_parse_skips_non_numeric() {
        let text = json!({
            "tests": 2,
            "run_metrics": {"boot_ms": 1200, "build": "user", "cold_ms": "850.5", "flag": true},
            "test_metrics": {"Suite#a": {"frames": 60, "note": "n/a"}}
        })
        .to_string();

        let run = JsonMetricsParser.parse(Path::new("metrics-1.json"), &text).unwrap();

        assert_eq!(run.tests, 2);
        assert_eq!(run.run_metrics.len(), 2);
        assert_eq!(run.run_metrics["boot_ms"], 1200.0);
        assert_eq!(run.run_metrics["cold_ms"], 850.5);
        assert_eq!(run.test_metrics["Suite#a"].len(), 1);
    }

    #[test]
    fn test_parse_requires_test_count() {
        let err = JsonMetricsParser
            .parse(Path::new("metrics-1.json"), "{\"run_metrics\": {}}")
            .unwrap_err();
        assert!(matches!(err, MetricsError::Parse { .. }));
    }

    const SUITE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuite name="PerfSuite" tests="2" failures="0">
  <properties />
  <runmetric name="boot_ms" value="1200" />
  <runmetric name="build" value="user" />
  <testcase classname="com.example.Suite" testname="testScroll" time="1.5">
    <testmetric name="frames" value=" 60.5 " />
    <testmetric name="note" value="n/a" />
  </testcase>
  <testcase classname="com.example.Suite" testname="testOpen">
    <testmetric name="open_ms" value="340" />
  </testcase>
</testsuite>"#;

    #[test]
    fn test_xml_parser_reads_run_and_test_metrics() {
        let run = XmlMetricsParser.parse(Path::new("metrics-1.xml"), SUITE).unwrap();

        assert_eq!(run.tests, 2);
        assert_eq!(run.run_metrics.len(), 1);
        assert_eq!(run.run_metrics["boot_ms"], 1200.0);

        let scroll = &run.test_metrics["com.example.Suite#testScroll"];
        assert_eq!(scroll.len(), 1);
        assert_eq!(scroll["frames"], 60.5);
        assert_eq!(run.test_metrics["com.example.Suite#testOpen"]["open_ms"], 340.0);
    }

    #[test]
    fn test_xml_parser_accepts_xml_files_only() {
        assert!(XmlMetricsParser.accepts("metrics-001.xml"));
        assert!(!XmlMetricsParser.accepts("metrics-001.json"));
        assert!(!XmlMetricsParser.accepts("results.xml"));
    }

    #[test]
    fn test_xml_parser_rejects_bad_documents() {
        let path = Path::new("metrics-1.xml");

        let missing_count = XmlMetricsParser.parse(path, "<testsuite name=\"x\" />");
        assert!(matches!(missing_count, Err(MetricsError::Parse { .. })));

        let wrong_root = XmlMetricsParser.parse(path, "<results tests=\"1\" />");
        assert!(matches!(wrong_root, Err(MetricsError::Parse { .. })));

        let truncated = XmlMetricsParser.parse(path, "<testsuite tests=\"1\">");
        assert!(matches!(truncated, Err(MetricsError::Parse { .. })));
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let err = load_dataset(Path::new("/nonexistent/metrics/dir")).unwrap_err();
        assert!(matches!(err, MetricsError::Io { .. }));
    }
}
