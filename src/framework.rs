//! Typed test reports as delivered by a test runner.
//!
//! Runners describe each test phase with a loosely structured report. This
//! module pins that down once at the framework boundary: a [`TestReport`]
//! carries the phase, the raw runner [`Outcome`] and the captured output,
//! and [`classify`] turns it into a [`Classification`] holding the OpenTMI
//! [`Verdict`] plus the note that goes along with it.
//!
//! ```text
//! runner event ──► TestReport ──► classify() ──► Classification
//!                                                 ├── Verdict
//!                                                 ├── note
//!                                                 └── Tally (which counter)
//! ```
//!
//! # Classification
//!
//! | Phase | Outcome | Verdict | Note |
//! |-------|---------|---------|------|
//! | call | passed | `pass` | `xpass` when xfail-marked |
//! | call | failed | `fail` | crash location, `xfail` when xfail-marked |
//! | call | skipped | `skip` | skip reason, `xskip` when xfail-marked |
//! | call | rerun | `inconclusive` | `rerun` |
//! | setup | failed | `inconclusive` | crash location |
//! | setup | skipped | `skip` | skip reason |
//! | collect | failed | `error` | crash location |
//!
//! Everything else (teardown reports, passing setup, passing collection)
//! produces no result.

pub mod junit;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use junit::{JunitFormat, parse_junit_file, parse_junit_xml};

/// Result type for framework operations.
pub type FrameworkResult<T> = Result<T, FrameworkError>;

/// Errors that can occur while reading runner output.
#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    /// Failed to parse a result file.
    ///
    /// Common causes: truncated file, not JUnit XML, invalid attribute values.
    #[error("Failed to parse test output: {0}")]
    ParseError(String),

    /// I/O error reading a result file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The phase of a test a report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Fixture setup before the test body.
    Setup,
    /// The test body itself.
    Call,
    /// Fixture teardown after the test body.
    Teardown,
    /// Test collection (module import, parametrization).
    Collect,
}

/// Raw outcome reported by the runner for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
    /// The runner scheduled the test for another attempt.
    Rerun,
}

/// Where a failing test crashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crash {
    /// Exception or assertion message.
    pub message: String,
    /// Source file of the failing frame.
    pub path: String,
    /// Line of the failing frame.
    pub line: u32,
}

impl Crash {
    pub fn new(message: impl Into<String>, path: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            path: path.into(),
            line,
        }
    }
}

impl fmt::Display for Crash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            return write!(f, "{}", self.message);
        }
        write!(f, "{}\n{}:{}", self.message, self.path, self.line)
    }
}

/// One phase report delivered by the runner.
///
/// Built with the `with_*` methods:
///
/// ```
/// use std::time::Duration;
/// use opentmi_report::framework::{Outcome, Phase, TestReport};
///
/// let report = TestReport::new("tests/test_math.py::test_add", Phase::Call, Outcome::Passed)
///     .with_duration(Duration::from_millis(120))
///     .with_stdout("1 + 1 = 2\n")
///     .with_property("requirement", "REQ-12");
/// assert!(report.crash.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    /// Runner node id, e.g. `tests/test_foo.py::test_bar`.
    pub node_id: String,

    pub phase: Phase,

    pub outcome: Outcome,

    /// Wall-clock time of this phase.
    pub duration: Duration,

    /// Captured standard output.
    #[serde(default)]
    pub stdout: String,

    /// Captured standard error.
    #[serde(default)]
    pub stderr: String,

    /// Crash location for failing reports.
    #[serde(default)]
    pub crash: Option<Crash>,

    /// Reason given by the runner for a skip.
    #[serde(default)]
    pub skip_reason: Option<String>,

    /// The test carries an expected-failure marker.
    #[serde(default)]
    pub expected_failure: bool,

    /// Properties recorded by the test, in recording order.
    #[serde(default)]
    pub user_properties: Vec<(String, String)>,

    /// Keywords (markers, module and function names) attached to the test.
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl TestReport {
    /// Creates a report with no duration, output or metadata.
    pub fn new(node_id: impl Into<String>, phase: Phase, outcome: Outcome) -> Self {
        Self {
            node_id: node_id.into(),
            phase,
            outcome,
            duration: Duration::ZERO,
            stdout: String::new(),
            stderr: String::new(),
            crash: None,
            skip_reason: None,
            expected_failure: false,
            user_properties: Vec::new(),
            keywords: Vec::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_crash(mut self, crash: Crash) -> Self {
        self.crash = Some(crash);
        self
    }

    pub fn with_skip_reason(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    /// Marks the test as expected to fail.
    pub fn expected_failure(mut self) -> Self {
        self.expected_failure = true;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keywords.push(keyword.into());
        self
    }

    /// Crash location rendered as a note, empty when the runner gave none.
    fn crash_note(&self) -> String {
        self.crash.as_ref().map(ToString::to_string).unwrap_or_default()
    }

    fn skip_note(&self) -> String {
        self.skip_reason.clone().unwrap_or_default()
    }
}

/// Final verdict of a test as understood by OpenTMI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
    /// The test could not be collected or errored outside its body.
    Error,
    Skipped,
    /// The test neither passed nor failed, e.g. a setup failure.
    Inconclusive(String),
}

impl Verdict {
    /// Wire name used in result records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Passed => "pass",
            Verdict::Failed => "fail",
            Verdict::Error => "error",
            Verdict::Skipped => "skip",
            Verdict::Inconclusive(_) => "inconclusive",
        }
    }

    /// Returns true for verdicts that count against the run.
    pub fn is_failure(&self) -> bool {
        matches!(self, Verdict::Failed | Verdict::Error)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which session counter a classified report increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tally {
    Passed,
    XPassed,
    Failed,
    Errors,
    Skipped,
    XFailed,
    Rerun,
    /// Recorded but not counted (setup failures).
    Uncounted,
}

/// A report mapped to its OpenTMI verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    pub note: String,
    pub tally: Tally,
}

impl Classification {
    fn new(verdict: Verdict, note: impl Into<String>, tally: Tally) -> Self {
        Self {
            verdict,
            note: note.into(),
            tally,
        }
    }
}

/// Classifies a phase report, returning `None` for reports that do not
/// produce a result record.
pub fn classify(report: &TestReport) -> Option<Classification> {
    let xfail = report.expected_failure;
    match (report.phase, report.outcome) {
        (Phase::Call, Outcome::Passed) if xfail => Some(Classification::new(
            Verdict::Passed,
            "xpass",
            Tally::XPassed,
        )),
        (Phase::Call, Outcome::Passed) => {
            Some(Classification::new(Verdict::Passed, "", Tally::Passed))
        }
        (Phase::Call, Outcome::Failed) if xfail => Some(Classification::new(
            Verdict::Failed,
            "xfail",
            Tally::XPassed,
        )),
        (Phase::Call, Outcome::Failed) => Some(Classification::new(
            Verdict::Failed,
            report.crash_note(),
            Tally::Failed,
        )),
        (Phase::Call | Phase::Setup, Outcome::Skipped) if xfail => Some(Classification::new(
            Verdict::Skipped,
            "xskip",
            Tally::XFailed,
        )),
        (Phase::Call | Phase::Setup, Outcome::Skipped) => Some(Classification::new(
            Verdict::Skipped,
            report.skip_note(),
            Tally::Skipped,
        )),
        (Phase::Call, Outcome::Rerun) => Some(Classification::new(
            Verdict::Inconclusive("rerun".to_string()),
            "rerun",
            Tally::Rerun,
        )),
        (Phase::Setup, Outcome::Failed) => {
            let note = report.crash_note();
            Some(Classification::new(
                Verdict::Inconclusive(note.clone()),
                note,
                Tally::Uncounted,
            ))
        }
        (Phase::Collect, Outcome::Failed) => Some(Classification::new(
            Verdict::Error,
            report.crash_note(),
            Tally::Errors,
        )),
        _ => None,
    }
}
