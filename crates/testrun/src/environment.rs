//! Environment manager for isolated per-suite directory trees.
//!
//! Layout under the base directory:
//! - `<suite>/{restore,backup,temp,mock-data,logs}/`
//! - `<suite>.lock`: run id and pid of the run that owns the tree
//!
//! Every run starts from a clean slate: an existing tree for the suite is
//! wiped on initialization. The lock keeps two live runs of the same suite
//! from sharing a root.

use std::ffi::OsStr;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use testrun_core::Id;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("invalid suite name: {0:?}")]
    InvalidSuiteName(String),
    #[error("suite {suite} is in use by another run (lock file {})", .lock.display())]
    InUse { suite: String, lock: PathBuf },
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, EnvironmentError>;

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> EnvironmentError {
    let path = path.to_path_buf();
    move |source| EnvironmentError::Io {
        action,
        path,
        source,
    }
}

/// An initialized environment. Owned by the orchestrator for one run.
#[derive(Debug)]
pub struct TestEnvironment {
    suite_name: String,
    run_id: Id,
    root: PathBuf,
    restore: PathBuf,
    backup: PathBuf,
    temp: PathBuf,
    mock_data: PathBuf,
    logs: PathBuf,
    lock_path: PathBuf,
}

impl TestEnvironment {
    pub fn suite_name(&self) -> &str {
        &self.suite_name
    }

    pub fn run_id(&self) -> &Id {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn restore_path(&self) -> &Path {
        &self.restore
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn mock_data_path(&self) -> &Path {
        &self.mock_data
    }

    pub fn logs_path(&self) -> &Path {
        &self.logs
    }

    /// Variables exported to every test process of this run.
    pub fn exported_vars(&self) -> Vec<(&'static str, &OsStr)> {
        vec![
            ("TESTRUN_SUITE", OsStr::new(&self.suite_name)),
            ("TESTRUN_ROOT", self.root.as_os_str()),
            ("TESTRUN_RESTORE_DIR", self.restore.as_os_str()),
            ("TESTRUN_BACKUP_DIR", self.backup.as_os_str()),
            ("TESTRUN_TEMP_DIR", self.temp.as_os_str()),
            ("TESTRUN_MOCK_DATA_DIR", self.mock_data.as_os_str()),
            ("TESTRUN_LOGS_DIR", self.logs.as_os_str()),
        ]
    }

    /// Copy the logs directory to `<archive_dir>/run-<run_id>/`.
    pub fn archive_logs(&self, archive_dir: &Path) -> Result<PathBuf> {
        let dest = archive_dir.join(format!("run-{}", self.run_id));
        copy_dir(&self.logs, &dest)?;
        info!(dest = %dest.display(), "archived run logs");
        Ok(dest)
    }

    /// Remove the environment and release its lock.
    ///
    /// Consumes the environment, so it runs at most once. Failures are logged
    /// and reported but never raised: a teardown problem must not mask the
    /// run's own result.
    pub fn teardown(self) -> TeardownReport {
        let mut report = TeardownReport::default();

        if let Some(owner) = lock_owner(&self.lock_path) {
            if owner != self.run_id.0 {
                warn!(
                    suite = %self.suite_name,
                    owner = %owner,
                    "environment was taken over by another run; leaving it in place"
                );
                report
                    .errors
                    .push(format!("lock now owned by run {owner}"));
                return report;
            }
        }

        match fs::remove_dir_all(&self.root) {
            Ok(()) => report.root_removed = true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => report.root_removed = true,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "failed to remove environment root");
                report
                    .errors
                    .push(format!("remove {}: {e}", self.root.display()));
            }
        }

        match fs::remove_file(&self.lock_path) {
            Ok(()) => report.lock_released = true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => report.lock_released = true,
            Err(e) => {
                warn!(lock = %self.lock_path.display(), error = %e, "failed to release environment lock");
                report
                    .errors
                    .push(format!("remove {}: {e}", self.lock_path.display()));
            }
        }

        debug!(suite = %self.suite_name, clean = report.is_clean(), "environment torn down");
        report
    }
}

/// Outcome of [`TestEnvironment::teardown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub root_removed: bool,
    pub lock_released: bool,
    pub errors: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.root_removed && self.lock_released && self.errors.is_empty()
    }
}

/// Creates and wipes environments under a base directory.
#[derive(Debug, Clone)]
pub struct EnvironmentManager {
    base_dir: PathBuf,
}

impl EnvironmentManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Create a fresh environment for `suite_name`.
    ///
    /// Any existing tree for the suite is wiped. A lock held by a live run is
    /// an error unless `force` is set; a lock whose process is gone is taken
    /// over with a warning.
    pub fn initialize(&self, suite_name: &str, force: bool) -> Result<TestEnvironment> {
        let dir_name = sanitize_suite_name(suite_name)?;
        fs::create_dir_all(&self.base_dir).map_err(io_error("create", &self.base_dir))?;

        let root = self.base_dir.join(&dir_name);
        let lock_path = self.base_dir.join(format!("{dir_name}.lock"));
        let run_id = Id::new();

        acquire_lock(&lock_path, &run_id, suite_name, force)?;

        let env = TestEnvironment {
            suite_name: suite_name.to_string(),
            run_id,
            restore: root.join("restore"),
            backup: root.join("backup"),
            temp: root.join("temp"),
            mock_data: root.join("mock-data"),
            logs: root.join("logs"),
            root,
            lock_path,
        };

        if let Err(e) = prepare_tree(&env) {
            let _ = fs::remove_file(&env.lock_path);
            return Err(e);
        }

        info!(
            suite = %env.suite_name,
            run_id = %env.run_id,
            root = %env.root.display(),
            "environment initialized"
        );
        Ok(env)
    }
}

/// Map a suite name onto a safe directory name.
fn sanitize_suite_name(suite_name: &str) -> Result<String> {
    let name: String = suite_name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();

    if name.chars().all(|c| c == '-') {
        return Err(EnvironmentError::InvalidSuiteName(suite_name.to_string()));
    }
    Ok(name)
}

fn acquire_lock(lock_path: &Path, run_id: &Id, suite: &str, force: bool) -> Result<()> {
    // One takeover attempt at most; a second collision means a live race.
    for _ in 0..2 {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(mut file) => {
                writeln!(file, "{run_id} {}", std::process::id())
                    .map_err(io_error("write lock", lock_path))?;
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let observed = fs::read_to_string(lock_path).ok();
                let holder = observed.as_deref().and_then(parse_lock_pid);
                let stale = matches!(holder, Some(pid) if !process_alive(pid));
                if !force && !stale {
                    break;
                }
                warn!(
                    suite = %suite,
                    holder = ?holder,
                    force,
                    "taking over environment lock"
                );
                if !take_over_lock(lock_path, observed.as_deref(), run_id)? {
                    break;
                }
            }
            Err(e) => return Err(io_error("create lock", lock_path)(e)),
        }
    }

    Err(EnvironmentError::InUse {
        suite: suite.to_string(),
        lock: lock_path.to_path_buf(),
    })
}

/// Move the lock aside, but only keep it removed if it is still the lock
/// that was `observed`. A lock written by a concurrent starter in between is
/// put back and `false` is returned.
fn take_over_lock(lock_path: &Path, observed: Option<&str>, run_id: &Id) -> Result<bool> {
    let aside = lock_path.with_extension(format!("lock.{run_id}"));
    match fs::rename(lock_path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(io_error("move lock", lock_path)(e)),
    }

    let moved = fs::read_to_string(&aside).ok();
    if moved.is_some() && moved.as_deref() == observed {
        if let Err(e) = fs::remove_file(&aside) {
            warn!(path = %aside.display(), error = %e, "failed to remove old lock");
        }
        return Ok(true);
    }

    // hard_link never replaces an existing lock.
    if let Err(e) = fs::hard_link(&aside, lock_path) {
        warn!(lock = %lock_path.display(), error = %e, "failed to restore concurrent lock");
    }
    if let Err(e) = fs::remove_file(&aside) {
        warn!(path = %aside.display(), error = %e, "failed to remove moved lock");
    }
    Ok(false)
}

/// Run id recorded in a lock file.
fn lock_owner(lock_path: &Path) -> Option<String> {
    let content = fs::read_to_string(lock_path).ok()?;
    content.split_whitespace().next().map(str::to_string)
}

/// Pid recorded in lock file contents.
fn parse_lock_pid(content: &str) -> Option<u32> {
    content.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the permission and existence check only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

fn prepare_tree(env: &TestEnvironment) -> Result<()> {
    if env.root.exists() {
        info!(root = %env.root.display(), "wiping previous environment");
        fs::remove_dir_all(&env.root).map_err(io_error("remove", &env.root))?;
    }

    for dir in [
        &env.restore,
        &env.backup,
        &env.temp,
        &env.mock_data,
        &env.logs,
    ] {
        fs::create_dir_all(dir).map_err(io_error("create", dir))?;
    }
    Ok(())
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(io_error("create", dest))?;
    for entry in fs::read_dir(src).map_err(io_error("read", src))? {
        let entry = entry.map_err(io_error("read", src))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(io_error("copy", &from))?;
        }
    }
    Ok(())
}
