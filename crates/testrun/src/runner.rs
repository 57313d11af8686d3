//! Timeout-bounded runner.
//!
//! Races a test process against its deadline and the run's cancellation
//! token in one `select!`. Whichever resolves first decides the outcome;
//! a process that loses the race is terminated as a whole process group
//! (SIGTERM, grace period, SIGKILL) so no descendant outlives the job.

use crate::environment::TestEnvironment;
use crate::executor::{Executor, ExecutorError, RunningTest};
use crate::logging::TestLog;
use std::time::Duration;
use testrun_core::{Config, RawExecutionResult, TestJob};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between "still running" log lines for long jobs.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Deadline and termination settings for each job.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Per-job deadline (`None` = unbounded).
    pub deadline: Option<Duration>,
    /// Time between the graceful and the forced termination signal.
    pub grace_period: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            deadline: Some(Duration::from_secs(30 * 60)),
            grace_period: Duration::from_secs(5),
        }
    }
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            deadline: config.job_timeout(),
            grace_period: config.kill_grace(),
        }
    }
}

/// How the wait loop ended.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(ExecutorError),
}

/// Runs single jobs under a deadline.
#[derive(Debug, Clone)]
pub struct TimeoutRunner {
    executor: Executor,
    config: RunnerConfig,
}

impl TimeoutRunner {
    pub fn new(executor: Executor, config: RunnerConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run one job to completion, deadline, or cancellation.
    ///
    /// Never fails: a job that cannot be started yields a result with
    /// `execution_error` set.
    pub async fn run(
        &self,
        job: &TestJob,
        env: &TestEnvironment,
        log: &TestLog,
        cancel: &CancellationToken,
    ) -> RawExecutionResult {
        let name = job.test_name();
        if cancel.is_cancelled() {
            log.warning("run interrupted before the test started");
            return RawExecutionResult::cancelled(Vec::new(), Duration::ZERO);
        }

        let mut running = match self.executor.spawn(job, env, log) {
            Ok(running) => running,
            Err(e) => {
                warn!(test = %name, error = %e, "test failed to start");
                log.error(&format!("failed to start: {e}"));
                return RawExecutionResult::failed_to_start(e.to_string());
            }
        };

        let deadline = async {
            match self.config.deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let first_beat = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
        let mut heartbeat = tokio::time::interval_at(first_beat, HEARTBEAT_INTERVAL);

        let outcome = loop {
            tokio::select! {
                result = running.wait_exit() => {
                    break match result {
                        Ok(status) => ProcessOutcome::Completed(status),
                        Err(e) => ProcessOutcome::WaitFailed(e),
                    };
                }
                () = &mut deadline => break ProcessOutcome::TimedOut,
                () = cancel.cancelled() => break ProcessOutcome::Cancelled,
                _ = heartbeat.tick() => {
                    let elapsed_sec = running.elapsed().as_secs();
                    info!(test = %name, elapsed_sec, "test still running");
                    log.info(&format!("still running after {elapsed_sec}s"));
                }
            }
        };

        let duration = running.elapsed();
        match outcome {
            ProcessOutcome::Completed(status) => {
                sweep_group(&running);
                let output = running.collect_output().await;
                debug!(
                    test = %name,
                    exit_code = ?status.code(),
                    duration_ms = duration.as_millis() as u64,
                    "test process exited"
                );
                RawExecutionResult::completed(status.code(), output, duration)
            }
            ProcessOutcome::TimedOut => {
                warn!(
                    test = %name,
                    duration_ms = duration.as_millis() as u64,
                    "test timed out; terminating"
                );
                log.error(&format!("timed out after {:.1}s", duration.as_secs_f64()));
                terminate(&mut running, self.config.grace_period).await;
                RawExecutionResult::timed_out(running.collect_output().await, duration)
            }
            ProcessOutcome::Cancelled => {
                info!(test = %name, "run interrupted; terminating test");
                log.warning("run interrupted; terminating");
                terminate(&mut running, self.config.grace_period).await;
                RawExecutionResult::cancelled(running.collect_output().await, duration)
            }
            ProcessOutcome::WaitFailed(e) => {
                warn!(test = %name, error = %e, "lost track of test process");
                log.error(&e.to_string());
                terminate(&mut running, self.config.grace_period).await;
                RawExecutionResult {
                    output: running.collect_output().await,
                    duration,
                    ..RawExecutionResult::failed_to_start(e.to_string())
                }
            }
        }
    }
}

/// Terminate the test's process group and reap the test process.
#[cfg(unix)]
async fn terminate(running: &mut RunningTest, grace_period: Duration) {
    let Some(pgid) = running.pid() else {
        return;
    };

    signal_group(pgid, libc::SIGTERM);
    match tokio::time::timeout(grace_period, running.wait_exit()).await {
        Ok(_) => debug!(test = %running.test_name(), "test exited after SIGTERM"),
        Err(_) => warn!(
            test = %running.test_name(),
            grace_ms = grace_period.as_millis() as u64,
            "test ignored SIGTERM; killing"
        ),
    }

    // Also sweeps descendants that outlived the group leader.
    signal_group(pgid, libc::SIGKILL);
    if let Err(e) = running.wait_exit().await {
        warn!(test = %running.test_name(), error = %e, "failed to reap test process");
    }
}

/// Kill whatever the test left behind in its process group after the
/// leader exited on its own. Those processes would otherwise outlive the
/// run and hold the output pipes open.
#[cfg(unix)]
fn sweep_group(running: &RunningTest) {
    if let Some(pgid) = running.pid() {
        signal_group(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn sweep_group(_running: &RunningTest) {}

#[cfg(not(unix))]
async fn terminate(running: &mut RunningTest, _grace_period: Duration) {
    if let Err(e) = running.child_mut().kill().await {
        warn!(test = %running.test_name(), error = %e, "failed to kill test process");
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: the test was spawned as leader of its own process group, so
    // the negative id addresses exactly that group.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, signal, error = %err, "failed to signal process group");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::environment::EnvironmentManager;
    use crate::executor::ExecutorConfig;
    use crate::executor::IO_CAPTURE_TIMEOUT;
    use crate::logging::LogRecorder;
    use std::time::Instant;
    use testrun_core::{ParsedTestResult, TestStatus};
    use tempfile::TempDir;

    /// Alive and not a zombie waiting to be reaped.
    fn process_alive(pid: i32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        if unsafe { libc::kill(pid, 0) } != 0 {
            return false;
        }
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
            Err(_) => !std::path::Path::new("/proc/self").exists(),
        }
    }

    struct Fixture {
        dir: TempDir,
        env: TestEnvironment,
        logs: LogRecorder,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let env = EnvironmentManager::new(dir.path().join("envs"))
                .initialize("Unit", false)
                .unwrap();
            let logs = LogRecorder::new(env.logs_path()).unwrap();
            Self { dir, env, logs }
        }

        fn job(&self, name: &str, script: &str) -> TestJob {
            let path = self.dir.path().join(format!("{name}.test.sh"));
            std::fs::write(&path, script).unwrap();
            TestJob::new(name, path, self.logs.test_log_path(name))
        }

        fn runner(&self, deadline: Option<Duration>) -> TimeoutRunner {
            TimeoutRunner::new(
                Executor::new(ExecutorConfig {
                    project_root: self.dir.path().to_path_buf(),
                    ..ExecutorConfig::default()
                }),
                RunnerConfig {
                    deadline,
                    grace_period: Duration::from_millis(500),
                },
            )
        }

        async fn run(
            &self,
            job: &TestJob,
            deadline: Option<Duration>,
            cancel: &CancellationToken,
        ) -> RawExecutionResult {
            let log = self.logs.open_test_log(job.test_name()).unwrap();
            self.runner(deadline).run(job, &self.env, &log, cancel).await
        }
    }

    #[tokio::test]
    async fn completed_job_keeps_exit_code_and_output() {
        let fx = Fixture::new();
        let job = fx.job("quick", "echo 'Passed: 1'\nexit 0\n");

        let raw = fx
            .run(&job, Some(Duration::from_secs(10)), &CancellationToken::new())
            .await;
        assert!(raw.completed);
        assert!(!raw.timed_out);
        assert_eq!(raw.exit_code, Some(0));
        assert_eq!(raw.output, vec!["Passed: 1"]);
    }

    #[tokio::test]
    async fn background_children_do_not_outlive_a_completed_job() {
        let fx = Fixture::new();
        let pid_file = fx.dir.path().join("bg.pid");
        let job = fx.job(
            "leaky",
            &format!(
                "sleep 60 &\necho $! > {}\necho 'Passed: 1'\nexit 0\n",
                pid_file.display()
            ),
        );

        let started = Instant::now();
        let raw = fx
            .run(&job, Some(Duration::from_secs(30)), &CancellationToken::new())
            .await;
        assert!(raw.completed);
        assert_eq!(raw.exit_code, Some(0));
        assert_eq!(raw.output, vec!["Passed: 1"]);
        assert!(started.elapsed() < IO_CAPTURE_TIMEOUT);

        let background: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while process_alive(background) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!process_alive(background), "background process survived the job");
    }

    #[tokio::test]
    async fn deadline_terminates_a_hanging_job() {
        let fx = Fixture::new();
        let job = fx.job("hang", "echo 'Passed: 3'\nsleep 10\n");

        let started = Instant::now();
        let raw = fx
            .run(&job, Some(Duration::from_millis(500)), &CancellationToken::new())
            .await;
        assert!(raw.timed_out);
        assert!(!raw.completed);
        assert_eq!(raw.output, vec!["Passed: 3"]);
        assert!(started.elapsed() < Duration::from_secs(5));

        let parsed = ParsedTestResult::from_raw("hang", &raw);
        assert_eq!(parsed.status, TestStatus::Timeout);
        assert_eq!(parsed.passed, 0);
    }

    #[tokio::test]
    async fn sigterm_is_escalated_to_sigkill() {
        let fx = Fixture::new();
        let job = fx.job("stubborn", "trap '' TERM\nwhile true; do sleep 0.1; done\n");

        let started = Instant::now();
        let raw = fx
            .run(&job, Some(Duration::from_millis(300)), &CancellationToken::new())
            .await;
        assert!(raw.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_terminates_the_job() {
        let fx = Fixture::new();
        let job = fx.job("cancelled", "sleep 10\n");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let raw = fx.run(&job, None, &cancel).await;
        assert!(raw.cancelled);
        assert!(!raw.completed);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            ParsedTestResult::from_raw("cancelled", &raw).status,
            TestStatus::Exception
        );
    }

    #[tokio::test]
    async fn cancelled_run_does_not_start_the_job() {
        let fx = Fixture::new();
        let marker = fx.dir.path().join("started");
        let job = fx.job("skipped", &format!("touch {}\n", marker.display()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let raw = fx.run(&job, None, &cancel).await;
        assert!(raw.cancelled);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn spawn_failure_becomes_failed_to_start() {
        let fx = Fixture::new();
        let job = TestJob::new("ghost", fx.dir.path().join("ghost.test.sh"), "ghost.log");

        let raw = fx.run(&job, None, &CancellationToken::new()).await;
        assert!(!raw.completed);
        assert!(!raw.timed_out);
        assert!(raw.execution_error.is_some());
        assert_eq!(
            ParsedTestResult::from_raw("ghost", &raw).status,
            TestStatus::Exception
        );
    }
}
