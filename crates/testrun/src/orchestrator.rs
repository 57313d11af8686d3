//! Run orchestration.
//!
//! `execute` owns the whole lifecycle of one run:
//! 1. initialize the suite environment
//! 2. run every job under its deadline and fold results in discovery order
//! 3. write reports and archive logs when configured
//! 4. tear the environment down exactly once, also on error or panic

use crate::environment::{EnvironmentError, EnvironmentManager, TeardownReport, TestEnvironment};
use crate::executor::{Executor, ExecutorConfig};
use crate::logging::{LogError, LogRecorder};
use crate::runner::{RunnerConfig, TimeoutRunner};
use futures_util::stream::{self, StreamExt};
use std::ops::Deref;
use std::path::PathBuf;
use testrun_core::report::{self, ReportPaths};
use testrun_core::{
    Config, ParsedTestResult, RawExecutionResult, RunAggregator, RunSummary, Severity, TestJob,
    TestStatus,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),
    #[error("log error: {0}")]
    Log(#[from] LogError),
    #[error("run interrupted")]
    Interrupted { summary: Box<RunSummary> },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Everything a job needs from the run it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub config: &'a Config,
    pub env: &'a TestEnvironment,
    pub logs: &'a LogRecorder,
    pub cancel: &'a CancellationToken,
}

/// Result of a run that was not interrupted.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub reports: Option<ReportPaths>,
    pub log_archive: Option<PathBuf>,
    pub teardown: TeardownReport,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.summary.exit_code()
    }
}

/// Tears the environment down when dropped, unless [`teardown`] already did.
///
/// [`teardown`]: EnvironmentGuard::teardown
#[derive(Debug)]
struct EnvironmentGuard {
    env: Option<TestEnvironment>,
}

impl EnvironmentGuard {
    fn new(env: TestEnvironment) -> Self {
        Self { env: Some(env) }
    }

    fn teardown(mut self) -> TeardownReport {
        self.env.take().map(TestEnvironment::teardown).unwrap_or_default()
    }
}

impl Deref for EnvironmentGuard {
    type Target = TestEnvironment;

    fn deref(&self) -> &TestEnvironment {
        match &self.env {
            Some(env) => env,
            // Only `teardown` and `drop` take the environment, and both consume the guard.
            None => unreachable!("environment accessed after teardown"),
        }
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if let Some(env) = self.env.take() {
            warn!(suite = %env.suite_name(), "run ended early; tearing down environment");
            let _ = env.teardown();
        }
    }
}

/// Drives runs: environment lifecycle, job scheduling, aggregation.
#[derive(Debug)]
pub struct Orchestrator {
    config: Config,
    runner: TimeoutRunner,
    cancel: CancellationToken,
    force: bool,
}

impl Orchestrator {
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        let runner = TimeoutRunner::new(
            Executor::new(ExecutorConfig::from_config(&config)),
            RunnerConfig::from_config(&config),
        );
        Self {
            config,
            runner,
            cancel,
            force: false,
        }
    }

    /// Take over the suite's environment even if another live run holds it.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Override the deadline and grace period derived from the config.
    pub fn with_runner_config(mut self, runner_config: RunnerConfig) -> Self {
        self.runner = TimeoutRunner::new(
            Executor::new(ExecutorConfig::from_config(&self.config)),
            runner_config,
        );
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run a full lifecycle for `jobs`.
    pub async fn execute(&self, jobs: Vec<TestJob>) -> Result<RunOutcome> {
        let manager = EnvironmentManager::new(&self.config.env_base_dir);
        let env = EnvironmentGuard::new(manager.initialize(&self.config.suite, self.force)?);

        let logs = LogRecorder::new(env.logs_path())?;
        let ctx = RunContext {
            config: &self.config,
            env: &env,
            logs: &logs,
            cancel: &self.cancel,
        };

        let result = self.run_all(ctx, &jobs).await;

        let reports = match &result {
            Ok(summary) if self.config.generate_report => self.write_reports(&logs, summary),
            _ => None,
        };
        drop(logs);

        let log_archive = self.config.log_archive_dir.as_ref().and_then(|dir| {
            env.archive_logs(dir)
                .inspect_err(|e| warn!(error = %e, "failed to archive run logs"))
                .ok()
        });

        let teardown = env.teardown();
        if !teardown.is_clean() {
            warn!(errors = ?teardown.errors, "environment teardown was incomplete");
        }

        let summary = result?;
        Ok(RunOutcome {
            summary,
            reports,
            log_archive,
            teardown,
        })
    }

    /// Run every job and aggregate the results.
    ///
    /// Jobs run `max_parallel` at a time; results are recorded in the order
    /// of `jobs` regardless of completion order. A failing job never stops
    /// the run. Cancellation stops new jobs from starting, terminates the
    /// ones in flight and yields [`OrchestratorError::Interrupted`].
    pub async fn run_all(&self, ctx: RunContext<'_>, jobs: &[TestJob]) -> Result<RunSummary> {
        let parallel = ctx.config.max_parallel.max(1);
        info!(
            suite = %ctx.env.suite_name(),
            run_id = %ctx.env.run_id(),
            tests = jobs.len(),
            parallel,
            "starting run"
        );
        ctx.logs.append(
            &format!(
                "run {} started: suite {}, {} test(s)",
                ctx.env.run_id(),
                ctx.env.suite_name(),
                jobs.len()
            ),
            Severity::Info,
        );

        let mut aggregator = RunAggregator::new(ctx.env.run_id().clone(), ctx.env.suite_name());
        let mut results = stream::iter(jobs)
            .map(|job| self.run_job(ctx, job))
            .buffered(parallel);
        while let Some(result) = results.next().await {
            aggregator.record(result);
        }
        drop(results);

        let summary = aggregator.finish();
        ctx.logs.append(
            &format!(
                "run finished: {} passed, {} failed, {} errored of {} test(s)",
                summary.passed_tests(),
                summary.failed_tests(),
                summary.errored_tests(),
                summary.total_tests()
            ),
            if summary.is_success() {
                Severity::Success
            } else {
                Severity::Error
            },
        );

        if ctx.cancel.is_cancelled() {
            warn!(suite = %summary.suite_name(), "run interrupted");
            return Err(OrchestratorError::Interrupted {
                summary: Box::new(summary),
            });
        }
        Ok(summary)
    }

    async fn run_job(&self, ctx: RunContext<'_>, job: &TestJob) -> ParsedTestResult {
        let job = job.with_log_dir(ctx.logs.logs_dir());
        let name = job.test_name();
        ctx.logs.append(&format!("{name}: started"), Severity::Info);

        let raw = match ctx.logs.open_test_log(name) {
            Ok(log) => {
                let cancel = ctx.cancel.child_token();
                self.runner.run(&job, ctx.env, &log, &cancel).await
            }
            Err(e) => {
                warn!(test = %name, error = %e, "cannot open test log");
                RawExecutionResult::failed_to_start(e.to_string())
            }
        };

        let result = ParsedTestResult::from_raw(name, &raw);
        if result.degraded {
            warn!(test = %name, "output is missing one or more result counters");
            ctx.logs.append(
                &format!("{name}: output is missing one or more result counters"),
                Severity::Warning,
            );
        }

        let severity = match result.status {
            TestStatus::Passed => Severity::Success,
            TestStatus::Failed => Severity::Warning,
            _ => Severity::Error,
        };
        ctx.logs.append(
            &format!(
                "{name}: {} (passed {}, failed {}, skipped {}) in {:.1}s",
                result.status,
                result.passed,
                result.failed,
                result.skipped,
                result.duration.as_secs_f64()
            ),
            severity,
        );
        info!(
            test = %name,
            status = %result.status,
            exit_code = ?result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            "test finished"
        );
        result
    }

    fn write_reports(&self, logs: &LogRecorder, summary: &RunSummary) -> Option<ReportPaths> {
        match report::write_reports(&self.config.report_dir, summary) {
            Ok(paths) => {
                info!(dir = %self.config.report_dir.display(), "reports written");
                Some(paths)
            }
            Err(e) => {
                warn!(error = %e, "failed to write reports");
                logs.append(&format!("failed to write reports: {e}"), Severity::Error);
                None
            }
        }
    }
}
