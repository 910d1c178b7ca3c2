//! Data structures for tracked projects and their test runs.
//!
//! A `Project` is keyed by its directory path. `RunReport` is what the runner
//! produces for one run, `RunRecord` is what storage keeps of it, and
//! `TestResults` is the payload pushed to the UI when a run completes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary counters reported by the test runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    #[serde(default)]
    pub suites: u64,
    #[serde(default)]
    pub tests: u64,
    #[serde(default)]
    pub passes: u64,
    #[serde(default)]
    pub pending: u64,
    #[serde(default)]
    pub failures: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// Wall time of the run in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl RunStats {
    /// Returns `true` when every executed test passed.
    pub fn is_green(&self) -> bool {
        self.failures == 0
    }
}

/// A single test entry from the runner's JSON report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub title: String,
    #[serde(default)]
    pub full_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Failure details; an empty object for passing tests.
    #[serde(default)]
    pub err: serde_json::Value,
}

/// Parsed output of one test run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub stats: RunStats,
    #[serde(default)]
    pub tests: Vec<TestCase>,
    #[serde(default)]
    pub passes: Vec<TestCase>,
    #[serde(default)]
    pub failures: Vec<TestCase>,
    #[serde(default)]
    pub pending: Vec<TestCase>,
}

/// The part of a run that is persisted for a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub stats: RunStats,
    pub updated_at: DateTime<Utc>,
}

/// A tracked project directory and its most recent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<RunStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stats: None,
            updated_at: None,
        }
    }

    /// Replaces the last-run data with `record`.
    pub fn apply(&mut self, record: RunRecord) {
        self.stats = Some(record.stats);
        self.updated_at = Some(record.updated_at);
    }
}

/// Payload pushed to the UI when a run completes successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    pub project_path: PathBuf,
    #[serde(flatten)]
    pub report: RunReport,
    pub updated_at: DateTime<Utc>,
}

impl TestResults {
    pub fn new(project_path: &Path, report: RunReport, updated_at: DateTime<Utc>) -> Self {
        Self {
            project_path: project_path.to_path_buf(),
            report,
            updated_at,
        }
    }

    /// The record storage keeps for this run.
    pub fn record(&self) -> RunRecord {
        RunRecord {
            stats: self.report.stats.clone(),
            updated_at: self.updated_at,
        }
    }
}
