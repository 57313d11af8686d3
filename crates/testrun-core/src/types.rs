//! Core types for the test-run orchestrator.
//!
//! Jobs, raw execution results, parsed results and the run summary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Unique identifier for runs.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Severity tag for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Success => "SUCCESS",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

/// Final status of a single test job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    Exception,
    Timeout,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "Passed",
            Self::Failed => "Failed",
            Self::Error => "Error",
            Self::Exception => "Exception",
            Self::Timeout => "Timeout",
        }
    }

    /// Derive the status of a job from its raw result and parsed failure count.
    ///
    /// Order matters: a timeout wins over everything, then a job that never
    /// produced a verdict, then the exit code, then the failure counter.
    pub fn classify(raw: &RawExecutionResult, failed_count: u32) -> Self {
        if raw.timed_out {
            return Self::Timeout;
        }
        if !raw.completed {
            return Self::Exception;
        }
        match raw.exit_code {
            Some(0) if failed_count > 0 => Self::Failed,
            Some(0) => Self::Passed,
            _ => Self::Error,
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    /// Error, Exception and Timeout all count as errored jobs.
    pub fn is_errored(&self) -> bool {
        matches!(self, Self::Error | Self::Exception | Self::Timeout)
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work: a single test file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestJob {
    test_name: String,
    test_file_path: PathBuf,
    log_file_path: PathBuf,
}

impl TestJob {
    pub fn new(
        test_name: impl Into<String>,
        test_file_path: impl Into<PathBuf>,
        log_file_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            test_file_path: test_file_path.into(),
            log_file_path: log_file_path.into(),
        }
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn test_file_path(&self) -> &Path {
        &self.test_file_path
    }

    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }

    /// Return a copy of this job whose log lives under `logs_dir`.
    pub fn with_log_dir(&self, logs_dir: &Path) -> Self {
        Self {
            test_name: self.test_name.clone(),
            test_file_path: self.test_file_path.clone(),
            log_file_path: logs_dir.join(format!("{}.log", self.test_name)),
        }
    }
}

/// Raw outcome of running one job under a deadline.
///
/// At most one of `completed`, `timed_out` and `cancelled` is set. When none
/// is set the process never started and `execution_error` says why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExecutionResult {
    /// Exit code, `None` if the process was killed by a signal or never ran.
    pub exit_code: Option<i32>,
    /// Merged stdout/stderr lines in arrival order.
    pub output: Vec<String>,
    pub completed: bool,
    pub timed_out: bool,
    /// The run was interrupted while this job was in flight.
    pub cancelled: bool,
    pub execution_error: Option<String>,
    pub duration: Duration,
}

impl RawExecutionResult {
    pub fn completed(exit_code: Option<i32>, output: Vec<String>, duration: Duration) -> Self {
        Self {
            exit_code,
            output,
            completed: true,
            timed_out: false,
            cancelled: false,
            execution_error: None,
            duration,
        }
    }

    pub fn timed_out(output: Vec<String>, duration: Duration) -> Self {
        Self {
            exit_code: None,
            output,
            completed: false,
            timed_out: true,
            cancelled: false,
            execution_error: None,
            duration,
        }
    }

    pub fn cancelled(output: Vec<String>, duration: Duration) -> Self {
        Self {
            exit_code: None,
            output,
            completed: false,
            timed_out: false,
            cancelled: true,
            execution_error: Some("run interrupted before the job finished".to_string()),
            duration,
        }
    }

    pub fn failed_to_start(error: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            output: Vec::new(),
            completed: false,
            timed_out: false,
            cancelled: false,
            execution_error: Some(error.into()),
            duration: Duration::ZERO,
        }
    }
}

/// Structured result of one job, derived from a [`RawExecutionResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTestResult {
    pub test_name: String,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub status: TestStatus,
    /// Failure lines captured verbatim, in output order.
    pub failure_messages: Vec<String>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    /// Some counters were absent from the output and defaulted to zero.
    pub degraded: bool,
    /// Last lines of output, kept for failure diagnostics.
    pub output_tail: Vec<String>,
}

/// Accumulates per-job results into a [`RunSummary`].
#[derive(Debug)]
pub struct RunAggregator {
    run_id: Id,
    suite_name: String,
    started_at: DateTime<Utc>,
    started: Instant,
    results: Vec<ParsedTestResult>,
}

impl RunAggregator {
    pub fn new(run_id: Id, suite_name: impl Into<String>) -> Self {
        Self {
            run_id,
            suite_name: suite_name.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            results: Vec::new(),
        }
    }

    /// Fold one job result into the run.
    pub fn record(&mut self, result: ParsedTestResult) {
        self.results.push(result);
    }

    /// Finalize the run. The returned summary has no mutating methods.
    pub fn finish(self) -> RunSummary {
        let passed_tests = self.results.iter().filter(|r| r.status.is_passed()).count();
        let failed_tests = self
            .results
            .iter()
            .filter(|r| r.status == TestStatus::Failed)
            .count();
        let errored_tests = self.results.iter().filter(|r| r.status.is_errored()).count();

        RunSummary {
            run_id: self.run_id,
            suite_name: self.suite_name,
            started_at: self.started_at,
            total_duration: self.started.elapsed(),
            total_tests: self.results.len(),
            passed_tests,
            failed_tests,
            errored_tests,
            results: self.results,
        }
    }
}

/// Finalized aggregate result of one orchestrator invocation.
#[derive(Debug, Clone)]
pub struct RunSummary {
    run_id: Id,
    suite_name: String,
    started_at: DateTime<Utc>,
    total_duration: Duration,
    total_tests: usize,
    passed_tests: usize,
    failed_tests: usize,
    errored_tests: usize,
    results: Vec<ParsedTestResult>,
}

impl RunSummary {
    pub fn run_id(&self) -> &Id {
        &self.run_id
    }

    pub fn suite_name(&self) -> &str {
        &self.suite_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    pub fn total_tests(&self) -> usize {
        self.total_tests
    }

    pub fn passed_tests(&self) -> usize {
        self.passed_tests
    }

    pub fn failed_tests(&self) -> usize {
        self.failed_tests
    }

    pub fn errored_tests(&self) -> usize {
        self.errored_tests
    }

    /// Per-job results in discovery order.
    pub fn results(&self) -> &[ParsedTestResult] {
        &self.results
    }

    pub fn passed_cases(&self) -> u64 {
        self.results.iter().map(|r| u64::from(r.passed)).sum()
    }

    pub fn failed_cases(&self) -> u64 {
        self.results.iter().map(|r| u64::from(r.failed)).sum()
    }

    pub fn skipped_cases(&self) -> u64 {
        self.results.iter().map(|r| u64::from(r.skipped)).sum()
    }

    /// Informational only: jobs are never skipped as a whole, so this is the
    /// sum of their skipped counters.
    pub fn skipped_tests(&self) -> u64 {
        self.skipped_cases()
    }

    /// Jobs that did not pass, in discovery order.
    pub fn failures(&self) -> impl Iterator<Item = &ParsedTestResult> {
        self.results.iter().filter(|r| !r.status.is_passed())
    }

    pub fn is_success(&self) -> bool {
        self.failed_tests == 0 && self.errored_tests == 0
    }

    /// Process exit code: 0 iff nothing failed or errored.
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }
}
