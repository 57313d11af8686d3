//! Report artifacts produced from a finalized run.
//!
//! Two formats are written side by side:
//! - `junit.xml`: JUnit XML, one testsuite per run, one testcase per job
//! - `summary.json`: per-job counters and status plus run totals

use crate::types::{ParsedTestResult, RunSummary, TestStatus};
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const JUNIT_FILE_NAME: &str = "junit.xml";
pub const SUMMARY_FILE_NAME: &str = "summary.json";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("error writing JUnit output to {path}")]
    Junit {
        path: PathBuf,
        #[source]
        source: quick_junit::SerializeError,
    },
}

pub type Result<T> = std::result::Result<T, ReportError>;

/// One job in `summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub name: String,
    pub passed_count: u32,
    pub failed_count: u32,
    pub skipped_count: u32,
    pub status: TestStatus,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failure_messages: Vec<String>,
}

impl From<&ParsedTestResult> for ReportRow {
    fn from(result: &ParsedTestResult) -> Self {
        Self {
            name: result.test_name.clone(),
            passed_count: result.passed,
            failed_count: result.failed,
            skipped_count: result.skipped,
            status: result.status,
            duration_seconds: result.duration.as_secs_f64(),
            exit_code: result.exit_code,
            failure_messages: result.failure_messages.clone(),
        }
    }
}

/// Run totals in `summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ReportTotals {
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub errored_tests: usize,
    pub passed_cases: u64,
    pub failed_cases: u64,
    pub skipped_cases: u64,
    pub total_duration_seconds: f64,
    pub exit_code: i32,
}

/// Top-level `summary.json` document.
#[derive(Debug, Clone, Serialize)]
pub struct JsonReport {
    pub run_id: String,
    pub suite: String,
    pub started_at: String,
    pub totals: ReportTotals,
    pub tests: Vec<ReportRow>,
}

impl JsonReport {
    pub fn from_summary(summary: &RunSummary) -> Self {
        Self {
            run_id: summary.run_id().to_string(),
            suite: summary.suite_name().to_string(),
            started_at: summary.started_at().to_rfc3339(),
            totals: ReportTotals {
                total_tests: summary.total_tests(),
                passed_tests: summary.passed_tests(),
                failed_tests: summary.failed_tests(),
                errored_tests: summary.errored_tests(),
                passed_cases: summary.passed_cases(),
                failed_cases: summary.failed_cases(),
                skipped_cases: summary.skipped_cases(),
                total_duration_seconds: summary.total_duration().as_secs_f64(),
                exit_code: summary.exit_code(),
            },
            tests: summary.results().iter().map(ReportRow::from).collect(),
        }
    }
}

/// Build the JUnit report for a run.
pub fn junit_report(summary: &RunSummary) -> Report {
    let mut suite = TestSuite::new(summary.suite_name());
    suite
        .set_timestamp(summary.started_at())
        .set_time(summary.total_duration());
    suite.add_property(("run-id", summary.run_id().as_ref()));

    for result in summary.results() {
        let status = match result.status {
            TestStatus::Passed => TestCaseStatus::success(),
            other => {
                let kind = if other == TestStatus::Failed {
                    NonSuccessKind::Failure
                } else {
                    NonSuccessKind::Error
                };
                let mut status = TestCaseStatus::non_success(kind);
                status.set_type(other.as_str());
                if let Some(first) = result.failure_messages.first() {
                    status.set_message(first.as_str());
                }
                if !result.failure_messages.is_empty() {
                    status.set_description(result.failure_messages.join("\n"));
                }
                status
            }
        };

        let mut testcase = TestCase::new(result.test_name.as_str(), status);
        testcase
            .set_classname(summary.suite_name())
            .set_time(result.duration);
        if !result.status.is_passed() && !result.output_tail.is_empty() {
            testcase.set_system_out(result.output_tail.join("\n"));
        }
        suite.add_test_case(testcase);
    }

    let mut report = Report::new(format!("testrun-{}", summary.suite_name()));
    report
        .set_timestamp(summary.started_at())
        .set_time(summary.total_duration())
        .add_test_suite(suite);
    report
}

/// Write `junit.xml`.
pub fn write_junit_report(path: &Path, summary: &RunSummary) -> Result<()> {
    let file = File::create(path).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    junit_report(summary)
        .serialize(BufWriter::new(file))
        .map_err(|source| ReportError::Junit {
            path: path.to_path_buf(),
            source,
        })
}

/// Write `summary.json`.
pub fn write_json_report(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(&JsonReport::from_summary(summary))?;
    let io_err = |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
    writer.write_all(json.as_bytes()).map_err(io_err)?;
    writer.flush().map_err(io_err)
}

/// Paths of the written report files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub junit: PathBuf,
    pub summary: PathBuf,
}

/// Write both report formats into `dir`, creating it if needed.
pub fn write_reports(dir: &Path, summary: &RunSummary) -> Result<ReportPaths> {
    std::fs::create_dir_all(dir).map_err(|source| ReportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let paths = ReportPaths {
        junit: dir.join(JUNIT_FILE_NAME),
        summary: dir.join(SUMMARY_FILE_NAME),
    };
    write_junit_report(&paths.junit, summary)?;
    write_json_report(&paths.summary, summary)?;
    Ok(paths)
}
