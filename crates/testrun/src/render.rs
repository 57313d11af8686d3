//! Console output for `run-tests`.
//!
//! Formats job lists and run summaries for terminal display.

use std::fmt::Write;
use testrun_core::{ParsedTestResult, RunSummary, TestJob, TestStatus};

/// Failure lines shown per job before the block is cut short.
const MAX_FAILURE_LINES: usize = 20;

/// Print the discoverable jobs.
pub fn print_job_list(jobs: &[TestJob]) {
    print!("{}", format_job_list(jobs));
}

/// Print the per-job table, failure blocks and the final summary line.
pub fn print_summary(summary: &RunSummary) {
    print!("{}", format_summary(summary));
}

pub fn format_job_list(jobs: &[TestJob]) -> String {
    if jobs.is_empty() {
        return "No tests found.\n".to_string();
    }

    let mut out = String::new();
    for job in jobs {
        let _ = writeln!(out, "  {:<32}  {}", job.test_name(), job.test_file_path().display());
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "{} test(s)", jobs.len());
    out
}

pub fn format_summary(summary: &RunSummary) -> String {
    let mut out = String::new();

    if !summary.results().is_empty() {
        let _ = writeln!(
            out,
            "{:<32}  {:<10}  {:>6}  {:>6}  {:>7}  {:>9}",
            "TEST", "STATUS", "PASSED", "FAILED", "SKIPPED", "DURATION"
        );
        let _ = writeln!(out, "{}", "-".repeat(80));
        for result in summary.results() {
            let _ = writeln!(
                out,
                "{:<32}  {:<10}  {:>6}  {:>6}  {:>7}  {:>8.1}s",
                truncate(&result.test_name, 32),
                result.status.as_str(),
                result.passed,
                result.failed,
                result.skipped,
                result.duration.as_secs_f64()
            );
        }
    }

    for result in summary.failures() {
        out.push('\n');
        out.push_str(&format_failure(result));
    }

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Suite {}: {} passed, {} failed, {} skipped ({} test file(s): {} passed, {} failed, {} errored) in {:.1}s",
        summary.suite_name(),
        summary.passed_cases(),
        summary.failed_cases(),
        summary.skipped_cases(),
        summary.total_tests(),
        summary.passed_tests(),
        summary.failed_tests(),
        summary.errored_tests(),
        summary.total_duration().as_secs_f64()
    );
    out
}

/// One block for a job that did not pass.
fn format_failure(result: &ParsedTestResult) -> String {
    let mut out = format!("--- {} [{}]", result.test_name, format_status(result));
    out.push('\n');

    if result.failure_messages.is_empty() {
        out.push_str("    (no failure output captured)\n");
        return out;
    }
    for line in result.failure_messages.iter().take(MAX_FAILURE_LINES) {
        let _ = writeln!(out, "    {line}");
    }
    let hidden = result.failure_messages.len().saturating_sub(MAX_FAILURE_LINES);
    if hidden > 0 {
        let _ = writeln!(out, "    ... {hidden} more line(s) in the test log");
    }
    out
}

fn format_status(result: &ParsedTestResult) -> String {
    match (result.status, result.exit_code) {
        (TestStatus::Error, Some(code)) => format!("Error, exit code {code}"),
        (status, _) => status.to_string(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use testrun_core::{Id, RunAggregator};

    fn result(name: &str, status: TestStatus, messages: &[&str]) -> ParsedTestResult {
        ParsedTestResult {
            test_name: name.to_string(),
            passed: 2,
            failed: u32::from(status == TestStatus::Failed),
            skipped: 1,
            status,
            failure_messages: messages.iter().map(ToString::to_string).collect(),
            exit_code: Some(if status == TestStatus::Error { 2 } else { 0 }),
            duration: Duration::from_millis(250),
            degraded: false,
            output_tail: Vec::new(),
        }
    }

    #[test]
    fn summary_line_counts_cases_and_files() {
        let mut aggregator = RunAggregator::new(Id::from_string("run-1"), "Unit");
        aggregator.record(result("backup", TestStatus::Passed, &[]));
        aggregator.record(result("restore", TestStatus::Failed, &["[-] restores registry"]));
        let text = format_summary(&aggregator.finish());

        assert!(text.contains("Suite Unit: 4 passed, 1 failed, 2 skipped"));
        assert!(text.contains("2 test file(s): 1 passed, 1 failed, 0 errored"));
        assert!(text.contains("--- restore [Failed]"));
        assert!(text.contains("    [-] restores registry"));
        assert!(!text.contains("--- backup"));
    }

    #[test]
    fn failure_block_shows_exit_code_and_placeholder() {
        let block = format_failure(&result("crash", TestStatus::Error, &[]));
        assert!(block.starts_with("--- crash [Error, exit code 2]"));
        assert!(block.contains("no failure output captured"));
    }

    #[test]
    fn long_failure_blocks_are_cut_short() {
        let lines: Vec<String> = (0..25).map(|i| format!("FAIL case {i}")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let block = format_failure(&result("many", TestStatus::Failed, &refs));
        assert!(block.contains("FAIL case 19"));
        assert!(!block.contains("FAIL case 20"));
        assert!(block.contains("... 5 more line(s)"));
    }

    #[test]
    fn empty_run_still_prints_summary_line() {
        let summary = RunAggregator::new(Id::from_string("run-2"), "E2E").finish();
        let text = format_summary(&summary);
        assert!(text.contains("Suite E2E: 0 passed, 0 failed, 0 skipped"));
        assert!(!text.contains("STATUS"));
    }

    #[test]
    fn job_list_names_each_job() {
        let jobs = vec![
            TestJob::new("backup", "tests/backup.test.sh", "backup.log"),
            TestJob::new("restore", "tests/restore.test.sh", "restore.log"),
        ];
        let text = format_job_list(&jobs);
        assert!(text.contains("backup"));
        assert!(text.contains("tests/restore.test.sh"));
        assert!(text.ends_with("2 test(s)\n"));
        assert_eq!(format_job_list(&[]), "No tests found.\n");
    }

    #[test]
    fn truncate_adds_ellipsis() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-test-name", 10), "a-very-...");
    }
}
