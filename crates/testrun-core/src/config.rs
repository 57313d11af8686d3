//! Configuration for test runs.
//!
//! Reads the key=value format from `.testrun/config`.
//! Precedence: CLI flags > `--config` file > `.testrun/config` > defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default config file location, relative to the project root.
pub const DEFAULT_CONFIG_PATH: &str = ".testrun/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Run configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Discovery
    pub tests_dir: PathBuf,
    /// File name suffix that marks a test file (e.g. `.test.sh`).
    pub test_suffix: String,

    // Execution
    /// Working directory for every test process.
    pub project_root: PathBuf,
    /// Test engine executable; the test file path is appended to its args.
    pub engine: String,
    pub engine_args: Vec<String>,
    /// Per-job deadline in minutes (0 = no deadline).
    pub timeout_minutes: u32,
    /// Seconds between SIGTERM and SIGKILL when a job is terminated.
    pub kill_grace_sec: u32,
    /// Maximum jobs in flight at once (1 = sequential).
    pub max_parallel: usize,

    // Environment
    pub suite: String,
    /// Directory under which per-suite environments are created.
    pub env_base_dir: PathBuf,

    // Reports and logs
    pub generate_report: bool,
    pub report_dir: PathBuf,
    /// Copy the environment's logs here before teardown (optional).
    pub log_archive_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tests_dir: PathBuf::from("tests"),
            test_suffix: ".test.sh".to_string(),
            project_root: PathBuf::from("."),
            engine: "sh".to_string(),
            engine_args: Vec::new(),
            timeout_minutes: 30,
            kill_grace_sec: 5,
            max_parallel: 1,
            suite: "Unit".to_string(),
            env_base_dir: std::env::temp_dir().join("testrun"),
            generate_report: false,
            report_dir: PathBuf::from("test-results"),
            log_archive_dir: None,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "tests_dir" => self.tests_dir = PathBuf::from(value),
            "test_suffix" => self.test_suffix = value.to_string(),
            "project_root" => self.project_root = PathBuf::from(value),
            "engine" => self.engine = value.to_string(),
            "engine_args" => {
                self.engine_args = value.split_whitespace().map(str::to_string).collect();
            }
            "timeout_minutes" => self.timeout_minutes = Self::parse_int(key, value)?,
            "kill_grace_sec" => self.kill_grace_sec = Self::parse_int(key, value)?,
            "max_parallel" => {
                self.max_parallel = Self::parse_int(key, value)?;
                if self.max_parallel == 0 {
                    return Err(ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
            }
            "suite" => self.suite = value.to_string(),
            "env_base_dir" => self.env_base_dir = PathBuf::from(value),
            "generate_report" => self.generate_report = Self::parse_bool(key, value)?,
            "report_dir" => self.report_dir = PathBuf::from(value),
            "log_archive_dir" => {
                self.log_archive_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            _ => {
                // Warn but don't fail for unknown keys.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against the project root.
    pub fn resolve_paths(&mut self) {
        let root = self.project_root.clone();
        if self.tests_dir.is_relative() {
            self.tests_dir = root.join(&self.tests_dir);
        }
        if self.env_base_dir.is_relative() {
            self.env_base_dir = root.join(&self.env_base_dir);
        }
        if self.report_dir.is_relative() {
            self.report_dir = root.join(&self.report_dir);
        }
        if let Some(ref archive) = self.log_archive_dir {
            if archive.is_relative() {
                self.log_archive_dir = Some(root.join(archive));
            }
        }
    }

    /// Per-job deadline, `None` when disabled.
    pub fn job_timeout(&self) -> Option<Duration> {
        (self.timeout_minutes > 0).then(|| Duration::from_secs(u64::from(self.timeout_minutes) * 60))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(u64::from(self.kill_grace_sec))
    }
}
