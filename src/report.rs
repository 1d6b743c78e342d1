//! Test run reporters.
//!
//! A [`Reporter`] receives the runner's lifecycle events. The host passes
//! reporter instances in explicitly; there is no global registry. Per-test
//! callbacks only map and buffer, so they never hold up event delivery.
//! [`on_session_finish`](Reporter::on_session_finish) is the one place a
//! reporter may block, and it never reports an error back to the runner.
//!
//! ```text
//! on_session_start ─► on_collect_report* ─► on_test_report* ─► on_session_finish ─► terminal_summary
//! ```

pub mod opentmi;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::framework::{TestReport, Verdict, classify};

pub use opentmi::{OpenTmiReporter, SessionCounts};

/// A test reporter receives events during a test run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once before any test runs.
    async fn on_session_start(&self);

    /// Called for every phase report of every test.
    async fn on_test_report(&self, report: &TestReport);

    /// Called for every collection report.
    async fn on_collect_report(&self, report: &TestReport);

    /// Called once after the last test; may block until work completes.
    async fn on_session_finish(&self);

    /// Line for the runner's report header.
    fn header(&self) -> Option<String> {
        None
    }

    /// Line for the runner's terminal summary.
    fn terminal_summary(&self) -> Option<String> {
        None
    }
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_session_start(&self) {}
    async fn on_test_report(&self, _report: &TestReport) {}
    async fn on_collect_report(&self, _report: &TestReport) {}
    async fn on_session_finish(&self) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    /// Create a new multi-reporter.
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    pub fn len(&self) -> usize {
        self.reporters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reporters.is_empty()
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_session_start(&self) {
        for reporter in &self.reporters {
            reporter.on_session_start().await;
        }
    }

    async fn on_test_report(&self, report: &TestReport) {
        for reporter in &self.reporters {
            reporter.on_test_report(report).await;
        }
    }

    async fn on_collect_report(&self, report: &TestReport) {
        for reporter in &self.reporters {
            reporter.on_collect_report(report).await;
        }
    }

    async fn on_session_finish(&self) {
        for reporter in &self.reporters {
            reporter.on_session_finish().await;
        }
    }

    fn header(&self) -> Option<String> {
        join_lines(self.reporters.iter().filter_map(|r| r.header()))
    }

    fn terminal_summary(&self) -> Option<String> {
        join_lines(self.reporters.iter().filter_map(|r| r.terminal_summary()))
    }
}

fn join_lines(lines: impl Iterator<Item = String>) -> Option<String> {
    let lines: Vec<String> = lines.collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Console reporter that prints verdicts as they arrive.
pub struct ConsoleReporter {
    verbose: bool,
    counts: Mutex<SessionCounts>,
}

impl ConsoleReporter {
    /// Create a new console reporter.
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            counts: Mutex::new(SessionCounts::default()),
        }
    }

    pub fn counts(&self) -> SessionCounts {
        *self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe(&self, report: &TestReport) {
        let Some(classification) = classify(report) else {
            return;
        };
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(classification.tally);

        let status = match &classification.verdict {
            Verdict::Passed => console::style("PASS").green(),
            Verdict::Failed => console::style("FAIL").red(),
            Verdict::Error => console::style("ERR ").red().bold(),
            Verdict::Skipped => console::style("SKIP").yellow(),
            Verdict::Inconclusive(_) => console::style("INC ").yellow(),
        };
        if self.verbose || classification.verdict.is_failure() {
            println!("{} {}", status, report.node_id);
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_session_start(&self) {}

    async fn on_test_report(&self, report: &TestReport) {
        self.observe(report);
    }

    async fn on_collect_report(&self, report: &TestReport) {
        self.observe(report);
    }

    async fn on_session_finish(&self) {
        let counts = self.counts();
        println!();
        println!("Test Results:");
        println!("  Passed:  {}", console::style(counts.passed).green());
        println!("  Failed:  {}", console::style(counts.failed).red());
        if counts.errors > 0 {
            println!("  Errors:  {}", console::style(counts.errors).red().bold());
        }
        println!("  Skipped: {}", console::style(counts.skipped).yellow());
        if counts.xfailed + counts.xpassed > 0 {
            println!("  XFailed: {}", counts.xfailed);
            println!("  XPassed: {}", counts.xpassed);
        }
        if counts.rerun > 0 {
            println!("  Rerun:   {}", console::style(counts.rerun).yellow());
        }
    }
}

/// Centers `text` in a line of `fill` characters, the way test runners
/// print section separators.
pub fn separator(fill: char, text: &str, width: usize) -> String {
    let inner = format!(" {} ", text);
    let len = inner.chars().count();
    if len + 2 > width {
        return format!("{}{}{}", fill, inner, fill);
    }
    let left = (width - len) / 2;
    let right = width - len - left;
    format!(
        "{}{}{}",
        fill.to_string().repeat(left),
        inner,
        fill.to_string().repeat(right)
    )
}

/// Prints a reporter's terminal summary, if it has one.
pub fn print_summary(reporter: &dyn Reporter) {
    let Some(summary) = reporter.terminal_summary() else {
        return;
    };
    let width = console::Term::stdout().size().1 as usize;
    for line in summary.lines() {
        println!("{}", separator('-', line, width.clamp(40, 120)));
    }
}
