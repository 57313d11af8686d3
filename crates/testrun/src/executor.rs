//! Single-test executor.
//!
//! Launches the test engine for one job with the environment exported,
//! and captures stdout and stderr merged in arrival order. Every captured
//! line is also written to the job's log.

use crate::environment::TestEnvironment;
use crate::logging::TestLog;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use testrun_core::{Config, Severity, TestJob};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Timeout for draining stdout/stderr after the process exits or is killed.
///
/// A background process that inherited the pipes can keep them open after
/// the test itself is gone; capture gives up after this long.
pub const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes captured per stream. Later lines are drained and dropped.
pub const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("test file not found: {}", .path.display())]
    MissingTestFile { path: PathBuf },
    #[error("failed to spawn {engine}: {source}")]
    Spawn {
        engine: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for test process: {0}")]
    Wait(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// How test processes are launched.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Engine executable; the test file path is appended to its arguments.
    pub engine: String,
    pub engine_args: Vec<String>,
    /// Working directory of every test process.
    pub project_root: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            engine: "sh".to_string(),
            engine_args: Vec::new(),
            project_root: PathBuf::from("."),
        }
    }
}

impl ExecutorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            engine: config.engine.clone(),
            engine_args: config.engine_args.clone(),
            project_root: config.project_root.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Read one stream line by line and forward each line to the collector.
async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    stream: Stream,
    tx: mpsc::UnboundedSender<(Stream, String)>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let mut captured = 0usize;

    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            break;
        }

        // Past the limit: keep draining so the child never blocks on a full pipe.
        if captured >= MAX_OUTPUT_BYTES {
            continue;
        }
        captured += n;
        if captured >= MAX_OUTPUT_BYTES {
            warn!(
                stream = stream.as_str(),
                max_bytes = MAX_OUTPUT_BYTES,
                "output exceeded limit, truncating"
            );
        }

        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        if tx.send((stream, line)).is_err() {
            break;
        }
    }

    Ok(())
}

/// Merge forwarded lines into one ordered sequence and mirror them to the log.
async fn collect_lines(
    mut rx: mpsc::UnboundedReceiver<(Stream, String)>,
    log: TestLog,
    lines: Arc<Mutex<Vec<String>>>,
) {
    while let Some((stream, line)) = rx.recv().await {
        let severity = match stream {
            Stream::Stdout => Severity::Info,
            Stream::Stderr => Severity::Warning,
        };
        log.append(&line, severity);
        lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }
}

#[derive(Debug)]
struct OutputCapture {
    readers: Vec<JoinHandle<std::io::Result<()>>>,
    collector: JoinHandle<()>,
    lines: Arc<Mutex<Vec<String>>>,
}

impl OutputCapture {
    fn start(child: &mut Child, log: TestLog) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, Stream::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, Stream::Stderr, tx)));
        }

        let lines = Arc::new(Mutex::new(Vec::new()));
        let collector = tokio::spawn(collect_lines(rx, log, Arc::clone(&lines)));
        Self {
            readers,
            collector,
            lines,
        }
    }

    /// Wait for both streams to close, bounded by [`IO_CAPTURE_TIMEOUT`].
    /// Whatever was captured before the timeout is kept.
    async fn finish(self, test_name: &str) -> Vec<String> {
        let Self {
            readers,
            collector,
            lines,
        } = self;

        let aborts: Vec<_> = readers
            .iter()
            .map(JoinHandle::abort_handle)
            .chain(std::iter::once(collector.abort_handle()))
            .collect();

        let drain = async {
            for reader in readers {
                match reader.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(test = %test_name, error = %err, "output capture failed"),
                    Err(err) => warn!(test = %test_name, error = %err, "output capture task panicked"),
                }
            }
            if let Err(err) = collector.await {
                warn!(test = %test_name, error = %err, "output collector task panicked");
            }
        };

        if timeout(IO_CAPTURE_TIMEOUT, drain).await.is_err() {
            warn!(test = %test_name, "output capture timed out");
            for handle in aborts {
                handle.abort();
            }
        }

        let captured =
            std::mem::take(&mut *lines.lock().unwrap_or_else(PoisonError::into_inner));
        captured
    }
}

/// A launched test process whose output is being captured.
#[derive(Debug)]
pub struct RunningTest {
    test_name: String,
    child: Child,
    pid: Option<u32>,
    capture: OutputCapture,
    started: Instant,
}

impl RunningTest {
    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Pid of the process, which is also its process group id on unix.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Wait for the process to exit. Cancel-safe, and returns the cached
    /// status once the process has been reaped.
    pub async fn wait_exit(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.map_err(ExecutorError::Wait)
    }

    #[cfg(not(unix))]
    pub(crate) fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Stop capturing and return the merged output lines.
    pub async fn collect_output(self) -> Vec<String> {
        self.capture.finish(&self.test_name).await
    }

    /// Wait for exit and return the exit code (`None` when killed by a
    /// signal) with the merged output.
    pub async fn wait(mut self) -> Result<(Option<i32>, Vec<String>)> {
        let status = self.wait_exit().await?;
        let output = self.collect_output().await;
        Ok((status.code(), output))
    }
}

/// Launches the test engine for single jobs.
#[derive(Debug, Clone)]
pub struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Launch the engine on the job's test file.
    ///
    /// The process runs in the project root with stdin closed, in its own
    /// process group on unix, and is killed if the handle is dropped.
    pub fn spawn(&self, job: &TestJob, env: &TestEnvironment, log: &TestLog) -> Result<RunningTest> {
        let missing = || ExecutorError::MissingTestFile {
            path: job.test_file_path().to_path_buf(),
        };
        // Absolute, so the path stays valid from inside the project root.
        let test_file = job.test_file_path().canonicalize().map_err(|_| missing())?;
        if !test_file.is_file() {
            return Err(missing());
        }

        let mut cmd = Command::new(&self.config.engine);
        cmd.args(&self.config.engine_args)
            .arg(&test_file)
            .current_dir(&self.config.project_root)
            .envs(env.exported_vars())
            .env("TESTRUN_TEST_NAME", job.test_name())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            engine: self.config.engine.clone(),
            source,
        })?;
        let pid = child.id();

        debug!(
            test = %job.test_name(),
            pid = ?pid,
            engine = %self.config.engine,
            file = %test_file.display(),
            "spawned test process"
        );
        log.info(&format!(
            "running {} {}",
            self.config.engine,
            test_file.display()
        ));

        let capture = OutputCapture::start(&mut child, log.clone());
        Ok(RunningTest {
            test_name: job.test_name().to_string(),
            child,
            pid,
            capture,
            started: Instant::now(),
        })
    }

    /// Spawn and wait with no time limit.
    pub async fn run(
        &self,
        job: &TestJob,
        env: &TestEnvironment,
        log: &TestLog,
    ) -> Result<(Option<i32>, Vec<String>)> {
        self.spawn(job, env, log)?.wait().await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::environment::EnvironmentManager;
    use crate::logging::LogRecorder;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        env: TestEnvironment,
        logs: LogRecorder,
        executor: Executor,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let env = EnvironmentManager::new(dir.path().join("envs"))
                .initialize("Unit", false)
                .unwrap();
            let logs = LogRecorder::new(env.logs_path()).unwrap();
            let executor = Executor::new(ExecutorConfig {
                project_root: dir.path().to_path_buf(),
                ..ExecutorConfig::default()
            });
            Self {
                dir,
                env,
                logs,
                executor,
            }
        }

        fn job(&self, name: &str, script: &str) -> TestJob {
            let path = self.dir.path().join(format!("{name}.test.sh"));
            std::fs::write(&path, script).unwrap();
            TestJob::new(name, path, self.logs.test_log_path(name))
        }

        async fn run(&self, job: &TestJob) -> Result<(Option<i32>, Vec<String>)> {
            let log = self.logs.open_test_log(job.test_name()).unwrap();
            self.executor.run(job, &self.env, &log).await
        }
    }

    fn log_contents(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn captures_exit_code_and_stdout() {
        let fx = Fixture::new();
        let job = fx.job("counts", "echo 'Passed: 2'\necho 'Failed: 0'\nexit 3\n");

        let (code, output) = fx.run(&job).await.unwrap();
        assert_eq!(code, Some(3));
        assert_eq!(output, vec!["Passed: 2", "Failed: 0"]);
    }

    #[tokio::test]
    async fn merges_streams_in_arrival_order() {
        let fx = Fixture::new();
        let job = fx.job(
            "merged",
            "echo one\nsleep 0.2\necho two >&2\nsleep 0.2\necho three\n",
        );

        let (code, output) = fx.run(&job).await.unwrap();
        assert_eq!(code, Some(0));
        assert_eq!(output, vec!["one", "two", "three"]);

        let log = log_contents(job.log_file_path());
        assert!(log.contains("[INFO] one"));
        assert!(log.contains("[WARNING] two"));
    }

    #[tokio::test]
    async fn exports_environment_paths() {
        let fx = Fixture::new();
        let job = fx.job(
            "vars",
            "echo \"suite=$TESTRUN_SUITE\"\necho \"name=$TESTRUN_TEST_NAME\"\necho \"mock=$TESTRUN_MOCK_DATA_DIR\"\n",
        );

        let (_, output) = fx.run(&job).await.unwrap();
        assert_eq!(output[0], "suite=Unit");
        assert_eq!(output[1], "name=vars");
        assert_eq!(output[2], format!("mock={}", fx.env.mock_data_path().display()));
    }

    #[tokio::test]
    async fn runs_in_project_root() {
        let fx = Fixture::new();
        let job = fx.job("cwd", "pwd\n");

        let (_, output) = fx.run(&job).await.unwrap();
        let reported = Path::new(&output[0]).canonicalize().unwrap();
        assert_eq!(reported, fx.dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn missing_test_file_is_reported() {
        let fx = Fixture::new();
        let job = TestJob::new("ghost", fx.dir.path().join("ghost.test.sh"), "ghost.log");

        let err = fx.run(&job).await.unwrap_err();
        assert!(matches!(err, ExecutorError::MissingTestFile { .. }));
    }

    #[tokio::test]
    async fn missing_engine_is_a_spawn_error() {
        let mut fx = Fixture::new();
        fx.executor = Executor::new(ExecutorConfig {
            engine: "testrun-no-such-engine".to_string(),
            ..fx.executor.config().clone()
        });
        let job = fx.job("any", "exit 0\n");

        let err = fx.run(&job).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn non_utf8_output_is_kept() {
        let fx = Fixture::new();
        let job = fx.job("bytes", "printf 'ok \\377\\n'\n");

        let (_, output) = fx.run(&job).await.unwrap();
        assert_eq!(output.len(), 1);
        assert!(output[0].starts_with("ok "));
    }
}
