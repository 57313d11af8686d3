//! Result parser for test engine output.
//!
//! The engine's output is human-readable text with no stable format, so each
//! counter is extracted by an independent pattern with a zero default. A
//! missing counter degrades the parse instead of failing it: output from a
//! crash mid-run still yields a usable, if incomplete, result.

use crate::types::{ParsedTestResult, RawExecutionResult, TestStatus};
use regex::Regex;
use std::sync::LazyLock;

/// Number of trailing output lines kept on a parsed result.
pub const TAIL_LINES: usize = 200;

/// A counter the parser knows how to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Passed,
    Failed,
    Skipped,
}

struct CounterExtractor {
    counter: Counter,
    pattern: Regex,
}

impl CounterExtractor {
    fn new(counter: Counter, pattern: &str) -> Self {
        Self {
            counter,
            pattern: Regex::new(pattern).expect("counter pattern is valid"),
        }
    }

    /// First line carrying this counter with a value that fits in a u32.
    fn extract<S: AsRef<str>>(&self, lines: &[S]) -> Option<u32> {
        lines.iter().find_map(|line| {
            self.pattern
                .captures(line.as_ref())
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse().ok())
        })
    }
}

static COUNTERS: LazyLock<[CounterExtractor; 3]> = LazyLock::new(|| {
    [
        CounterExtractor::new(Counter::Passed, r"(?i)\bpassed\s*[:=]\s*(\d+)"),
        CounterExtractor::new(Counter::Failed, r"(?i)\bfailed\s*[:=]\s*(\d+)"),
        CounterExtractor::new(Counter::Skipped, r"(?i)\bskipped\s*[:=]\s*(\d+)"),
    ]
});

// Uppercase FAIL/ERROR markers are case-sensitive so that counter lines like
// "Failed: 3" are not mistaken for failure text.
static FAILURE_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^\s*\[-\]\s*\S",
        r"^\s*FAIL(?:ED)?\b[:\s]*[^\d\s:]",
        r"^\s*(?:ERROR|Error)\b[:\s]*[^\d\s:]",
        r"^\s*Expected\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("failure marker pattern is valid"))
    .collect()
});

/// Counters and failure text extracted from raw output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOutput {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub failure_messages: Vec<String>,
    /// Counters that were not found and defaulted to zero.
    pub missing: Vec<Counter>,
}

impl ParsedOutput {
    pub fn is_degraded(&self) -> bool {
        !self.missing.is_empty()
    }
}

/// Parse output lines. Never fails.
pub fn parse<S: AsRef<str>>(lines: &[S]) -> ParsedOutput {
    let mut parsed = ParsedOutput::default();

    for extractor in COUNTERS.iter() {
        let value = extractor.extract(lines);
        if value.is_none() {
            parsed.missing.push(extractor.counter);
        }
        let value = value.unwrap_or(0);
        match extractor.counter {
            Counter::Passed => parsed.passed = value,
            Counter::Failed => parsed.failed = value,
            Counter::Skipped => parsed.skipped = value,
        }
    }

    parsed.failure_messages = lines
        .iter()
        .map(|line| line.as_ref().trim_end())
        .filter(|line| FAILURE_MARKERS.iter().any(|re| re.is_match(line)))
        .map(str::to_string)
        .collect();

    parsed
}

/// Parse a single block of text.
pub fn parse_text(text: &str) -> ParsedOutput {
    let lines: Vec<&str> = text.lines().collect();
    parse(&lines)
}

impl ParsedTestResult {
    /// Build the structured result for one job.
    ///
    /// Counters only count for jobs that ran to completion; a timed-out or
    /// aborted job keeps its failure text for diagnostics but reports zeros.
    pub fn from_raw(test_name: impl Into<String>, raw: &RawExecutionResult) -> Self {
        let parsed = parse(&raw.output);
        let status = TestStatus::classify(raw, parsed.failed);
        let degraded = raw.completed && parsed.is_degraded();

        let (passed, failed, skipped) = if raw.completed {
            (parsed.passed, parsed.failed, parsed.skipped)
        } else {
            (0, 0, 0)
        };

        let mut failure_messages = parsed.failure_messages;
        match status {
            TestStatus::Timeout => failure_messages.push(format!(
                "timed out after {:.1}s",
                raw.duration.as_secs_f64()
            )),
            TestStatus::Exception => {
                if let Some(error) = &raw.execution_error {
                    failure_messages.insert(0, error.clone());
                }
            }
            TestStatus::Error if failure_messages.is_empty() => {
                failure_messages.push(match raw.exit_code {
                    Some(code) => format!("exited with code {code}"),
                    None => "terminated by signal".to_string(),
                });
            }
            _ => {}
        }

        let tail_start = raw.output.len().saturating_sub(TAIL_LINES);

        Self {
            test_name: test_name.into(),
            passed,
            failed,
            skipped,
            status,
            failure_messages,
            exit_code: raw.exit_code,
            duration: raw.duration,
            degraded,
            output_tail: raw.output[tail_start..].to_vec(),
        }
    }
}
