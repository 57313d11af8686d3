//! Test job discovery.

use std::fs;
use std::path::{Path, PathBuf};
use testrun_core::TestJob;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to read tests directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unknown test {name:?} (available: {})", .available.join(", "))]
    UnknownTest { name: String, available: Vec<String> },
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// List the test files in `tests_dir` whose name ends with `suffix`.
///
/// Jobs are sorted by file name and named after it with the suffix removed.
/// With a `filter`, only the job of that name is returned (the full file
/// name is accepted too). Log paths are placeholders until the run binds
/// them to its logs directory.
pub fn discover(tests_dir: &Path, suffix: &str, filter: Option<&str>) -> Result<Vec<TestJob>> {
    let read_err = |source| DiscoveryError::ReadDir {
        path: tests_dir.to_path_buf(),
        source,
    };

    let mut found: Vec<(String, PathBuf)> = Vec::new();
    for entry in fs::read_dir(tests_dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match file_name.strip_suffix(suffix) {
            Some(name) if !name.is_empty() => found.push((name.to_string(), path)),
            _ => {}
        }
    }
    found.sort_by(|a, b| a.1.file_name().cmp(&b.1.file_name()));

    if let Some(wanted) = filter {
        let wanted_name = wanted.strip_suffix(suffix).unwrap_or(wanted);
        return match found.iter().position(|(name, _)| name == wanted_name) {
            Some(index) => {
                let (name, path) = found.swap_remove(index);
                Ok(vec![job(name, path)])
            }
            None => Err(DiscoveryError::UnknownTest {
                name: wanted.to_string(),
                available: found.into_iter().map(|(name, _)| name).collect(),
            }),
        };
    }

    debug!(dir = %tests_dir.display(), count = found.len(), "discovered tests");
    Ok(found.into_iter().map(|(name, path)| job(name, path)).collect())
}

fn job(name: String, path: PathBuf) -> TestJob {
    let log = PathBuf::from(format!("{name}.log"));
    TestJob::new(name, path, log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tests_dir(files: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for file in files {
            fs::write(dir.path().join(file), "exit 0\n").unwrap();
        }
        dir
    }

    fn names(jobs: &[TestJob]) -> Vec<&str> {
        jobs.iter().map(TestJob::test_name).collect()
    }

    #[test]
    fn discovers_matching_files_sorted() {
        let dir = tests_dir(&[
            "restore.test.sh",
            "backup.test.sh",
            "helpers.sh",
            "README.md",
            "config.test.sh",
        ]);
        fs::create_dir(dir.path().join("nested.test.sh")).unwrap();

        let jobs = discover(dir.path(), ".test.sh", None).unwrap();
        assert_eq!(names(&jobs), vec!["backup", "config", "restore"]);
        assert_eq!(jobs[0].test_file_path(), dir.path().join("backup.test.sh"));
    }

    #[test]
    fn bare_suffix_is_not_a_test() {
        let dir = tests_dir(&[".test.sh", "a.test.sh"]);
        let jobs = discover(dir.path(), ".test.sh", None).unwrap();
        assert_eq!(names(&jobs), vec!["a"]);
    }

    #[test]
    fn filter_selects_one_job() {
        let dir = tests_dir(&["backup.test.sh", "restore.test.sh"]);

        let jobs = discover(dir.path(), ".test.sh", Some("restore")).unwrap();
        assert_eq!(names(&jobs), vec!["restore"]);

        let jobs = discover(dir.path(), ".test.sh", Some("backup.test.sh")).unwrap();
        assert_eq!(names(&jobs), vec!["backup"]);
    }

    #[test]
    fn unknown_filter_lists_available_names() {
        let dir = tests_dir(&["backup.test.sh", "restore.test.sh"]);

        let err = discover(dir.path(), ".test.sh", Some("nope")).unwrap_err();
        match err {
            DiscoveryError::UnknownTest { name, available } => {
                assert_eq!(name, "nope");
                assert_eq!(available, vec!["backup", "restore"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_directory_yields_no_jobs() {
        let dir = tests_dir(&[]);
        assert!(discover(dir.path(), ".test.sh", None).unwrap().is_empty());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = discover(&dir.path().join("missing"), ".test.sh", None).unwrap_err();
        assert!(matches!(err, DiscoveryError::ReadDir { .. }));
    }
}
