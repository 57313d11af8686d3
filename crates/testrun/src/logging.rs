//! Log recorder for per-test logs and the aggregate run log.
//!
//! Each test gets its own append-only stream at `<logs>/<test-name>.log`;
//! the run as a whole writes to `<logs>/run.log`. Every line carries a
//! timestamp and a severity tag.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use testrun_core::Severity;
use thiserror::Error;
use tracing::warn;

/// File name of the aggregate run log.
pub const RUN_LOG_FILE: &str = "run.log";

const RUN_LOG_NAME: &str = "run";

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to open log {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("test name {0:?} cannot be used as a log file name")]
    InvalidName(String),
}

pub type Result<T> = std::result::Result<T, LogError>;

/// Format one log line (without the trailing newline).
pub fn format_line(message: &str, severity: Severity) -> String {
    format!(
        "[{}] [{}] {}",
        Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        severity.as_str(),
        message.trim_end_matches(['\r', '\n'])
    )
}

#[derive(Debug)]
struct LogSink {
    path: PathBuf,
    writer: LineWriter<File>,
}

impl LogSink {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| LogError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: LineWriter::new(file),
        })
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(path = %self.path.display(), error = %e, "failed to flush log");
        }
    }
}

/// Append-only log handle.
///
/// Clones share one stream and appends through any clone are serialized.
/// The stream is flushed and closed when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct TestLog {
    name: Arc<str>,
    path: Arc<Path>,
    sink: Arc<Mutex<LogSink>>,
}

impl TestLog {
    fn open(name: &str, path: &Path) -> Result<Self> {
        Ok(Self {
            name: Arc::from(name),
            path: Arc::from(path),
            sink: Arc::new(Mutex::new(LogSink::open(path)?)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one timestamped line. Write failures are reported through
    /// tracing rather than returned: losing a log line must not fail a test.
    pub fn append(&self, message: &str, severity: Severity) {
        let line = format_line(message, severity);
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(sink.writer, "{line}") {
            warn!(log = %self.name, error = %e, "failed to append log line");
        }
    }

    pub fn info(&self, message: &str) {
        self.append(message, Severity::Info);
    }

    pub fn warning(&self, message: &str) {
        self.append(message, Severity::Warning);
    }

    pub fn error(&self, message: &str) {
        self.append(message, Severity::Error);
    }
}

/// Owns the logs directory and the run log for one run.
#[derive(Debug, Clone)]
pub struct LogRecorder {
    logs_dir: PathBuf,
    run_log: TestLog,
}

impl LogRecorder {
    /// Open the run log under `logs_dir`, which must already exist.
    pub fn new(logs_dir: impl Into<PathBuf>) -> Result<Self> {
        let logs_dir = logs_dir.into();
        let run_log = TestLog::open(RUN_LOG_NAME, &logs_dir.join(RUN_LOG_FILE))?;
        Ok(Self { logs_dir, run_log })
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Where the log for `test_name` lives.
    pub fn test_log_path(&self, test_name: &str) -> PathBuf {
        self.logs_dir.join(format!("{test_name}.log"))
    }

    /// Open the dedicated log stream for one test.
    pub fn open_test_log(&self, test_name: &str) -> Result<TestLog> {
        let valid = !test_name.is_empty()
            && test_name != RUN_LOG_NAME
            && !test_name.starts_with('.')
            && !test_name.contains(['/', '\\']);
        if !valid {
            return Err(LogError::InvalidName(test_name.to_string()));
        }
        TestLog::open(test_name, &self.test_log_path(test_name))
    }

    /// Append to the run log.
    pub fn append(&self, message: &str, severity: Severity) {
        self.run_log.append(message, severity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn format_line_has_timestamp_and_severity() {
        let line = format_line("restore started\n", Severity::Warning);
        assert!(line.starts_with('['));
        assert!(line.contains("] [WARNING] restore started"));
        assert!(!line.ends_with('\n'));
    }

    #[test]
    fn run_log_is_created() {
        let dir = TempDir::new().unwrap();
        let recorder = LogRecorder::new(dir.path()).unwrap();
        recorder.append("run started", Severity::Info);

        let lines = read_lines(&dir.path().join(RUN_LOG_FILE));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("[INFO] run started"));
    }

    #[test]
    fn test_logs_are_separate_files() {
        let dir = TempDir::new().unwrap();
        let recorder = LogRecorder::new(dir.path()).unwrap();

        let backup = recorder.open_test_log("backup").unwrap();
        let restore = recorder.open_test_log("restore").unwrap();
        backup.info("backup line");
        restore.error("restore line");
        assert_eq!(backup.path(), recorder.test_log_path("backup"));
        drop(backup);
        drop(restore);

        let backup_lines = read_lines(&dir.path().join("backup.log"));
        let restore_lines = read_lines(&dir.path().join("restore.log"));
        assert_eq!(backup_lines.len(), 1);
        assert!(backup_lines[0].ends_with("[INFO] backup line"));
        assert_eq!(restore_lines.len(), 1);
        assert!(restore_lines[0].ends_with("[ERROR] restore line"));
    }

    #[test]
    fn concurrent_appends_to_same_handle_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let recorder = LogRecorder::new(dir.path()).unwrap();
        let log = recorder.open_test_log("shared").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let log = log.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        log.info(&format!("worker-{worker} message-{i} {}", "x".repeat(64)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        drop(log);

        let lines = read_lines(&dir.path().join("shared.log"));
        assert_eq!(lines.len(), 400);
        for line in &lines {
            assert!(line.contains("[INFO] worker-"), "corrupt line: {line}");
            assert!(line.ends_with(&"x".repeat(64)), "corrupt line: {line}");
        }
    }

    #[test]
    fn concurrent_appends_to_different_handles_stay_in_their_own_files() {
        let dir = TempDir::new().unwrap();
        let recorder = LogRecorder::new(dir.path()).unwrap();
        let names = ["backup", "restore", "registry", "services"];

        let handles: Vec<_> = names
            .iter()
            .map(|name| {
                let log = recorder.open_test_log(name).unwrap();
                let name = (*name).to_string();
                thread::spawn(move || {
                    for i in 0..200 {
                        log.info(&format!("{name} message-{i} {}", "y".repeat(64)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for name in names {
            let lines = read_lines(&dir.path().join(format!("{name}.log")));
            assert_eq!(lines.len(), 200, "{name}.log");
            for (i, line) in lines.iter().enumerate() {
                assert!(
                    line.ends_with(&format!("[INFO] {name} message-{i} {}", "y".repeat(64))),
                    "unexpected line in {name}.log: {line}"
                );
            }
        }
    }

    #[test]
    fn reopening_a_log_appends() {
        let dir = TempDir::new().unwrap();
        let recorder = LogRecorder::new(dir.path()).unwrap();
        recorder.open_test_log("backup").unwrap().info("first");
        recorder.open_test_log("backup").unwrap().info("second");

        let lines = read_lines(&dir.path().join("backup.log"));
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn invalid_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let recorder = LogRecorder::new(dir.path()).unwrap();
        for name in ["", "run", "../escape", "a/b", ".hidden"] {
            assert!(
                matches!(recorder.open_test_log(name), Err(LogError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn missing_logs_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = LogRecorder::new(dir.path().join("does-not-exist"));
        assert!(matches!(result, Err(LogError::Open { .. })));
    }
}
