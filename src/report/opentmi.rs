//! Reporter that uploads results to OpenTMI.
//!
//! Collects one [`ResultRecord`] per classified report while the run is in
//! progress and uploads them all when the session finishes. Nothing it does
//! can fail the run: configuration problems keep it from being created,
//! and upload problems only show up in the counts.
//!
//! # Example
//!
//! ```no_run
//! use opentmi_report::config::load_config;
//! use opentmi_report::report::{OpenTmiReporter, Reporter};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = load_config(std::path::Path::new("opentmi.toml"))?;
//! if let Some(reporter) = OpenTmiReporter::from_config(&config) {
//!     reporter.on_session_start().await;
//!     // ... forward the runner's reports ...
//!     reporter.on_session_finish().await;
//!     println!("{}", reporter.terminal_summary().unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Local;
use tracing::{debug, info};

use super::Reporter;
use crate::config::Config;
use crate::framework::{Tally, TestReport, classify};
use crate::record::{RecordBuilder, ResultRecord, RunMetadata, SessionSummary};
use crate::upload::{HttpResultClient, ResultClient, UploadCoordinator, UploadOutcome};

/// Per-verdict counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounts {
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub skipped: usize,
    pub xfailed: usize,
    pub xpassed: usize,
    pub rerun: usize,
}

impl SessionCounts {
    pub(crate) fn add(&mut self, tally: Tally) {
        match tally {
            Tally::Passed => self.passed += 1,
            Tally::XPassed => self.xpassed += 1,
            Tally::Failed => self.failed += 1,
            Tally::Errors => self.errors += 1,
            Tally::Skipped => self.skipped += 1,
            Tally::XFailed => self.xfailed += 1,
            Tally::Rerun => self.rerun += 1,
            Tally::Uncounted => {}
        }
    }

    /// Number of executed tests reported in each record's profiling.
    pub fn num_tests(&self) -> usize {
        self.passed + self.failed + self.xpassed + self.xfailed
    }
}

#[derive(Default)]
struct Session {
    started: Option<Instant>,
    records: Vec<ResultRecord>,
    counts: SessionCounts,
    finished: bool,
    outcome: Option<UploadOutcome>,
}

/// Uploads a run's results to OpenTMI at session finish.
pub struct OpenTmiReporter<C = HttpResultClient> {
    coordinator: UploadCoordinator<C>,
    builder: RecordBuilder,
    access_token: Option<String>,
    session: Mutex<Session>,
}

impl OpenTmiReporter<HttpResultClient> {
    /// Creates a reporter from configuration.
    ///
    /// Returns `None` when no usable host is configured; reporting is then
    /// simply not attached.
    pub fn from_config(config: &Config) -> Option<Self> {
        let client = match HttpResultClient::from_config(&config.opentmi) {
            Ok(client) => client,
            Err(e) => {
                debug!("OpenTMI reporting disabled: {}", e);
                return None;
            }
        };
        info!("Reporting results to {}", client.base_url());

        let coordinator = UploadCoordinator::from_config(client, &config.opentmi);
        let builder = RecordBuilder::new(RunMetadata::from_env(&config.metadata_pairs()))
            .with_store_logs(config.opentmi.store_logs);

        Some(Self::new(
            coordinator,
            builder,
            config.opentmi.resolve_token(),
        ))
    }
}

impl<C: ResultClient> OpenTmiReporter<C> {
    pub fn new(
        coordinator: UploadCoordinator<C>,
        builder: RecordBuilder,
        access_token: Option<String>,
    ) -> Self {
        Self {
            coordinator,
            builder,
            access_token,
            session: Mutex::new(Session::default()),
        }
    }

    /// Counters observed so far.
    pub fn counts(&self) -> SessionCounts {
        self.session().counts
    }

    /// Number of records waiting for upload.
    pub fn pending(&self) -> usize {
        self.session().records.len()
    }

    /// Upload counts, once the session has finished.
    pub fn upload_outcome(&self) -> Option<UploadOutcome> {
        self.session().outcome
    }

    pub fn coordinator(&self) -> &UploadCoordinator<C> {
        &self.coordinator
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, report: &TestReport) {
        let Some(classification) = classify(report) else {
            return;
        };
        let record = self.builder.build(report, &classification);

        let mut session = self.session();
        if session.finished {
            debug!("Ignoring {} reported after session finish", report.node_id);
            return;
        }
        session.counts.add(classification.tally);
        session.records.push(record);
    }

    /// Links every buffered record with the session summary and hands the
    /// batch over for upload.
    fn take_batch(&self) -> Option<Vec<ResultRecord>> {
        let mut session = self.session();
        if session.finished {
            return None;
        }
        session.finished = true;

        let summary = SessionSummary {
            duration: session
                .started
                .map(|started| started.elapsed())
                .unwrap_or_default(),
            num_tests: session.counts.num_tests(),
            generated_at: Local::now(),
        };
        let mut records = std::mem::take(&mut session.records);
        for record in &mut records {
            record.link_session(&summary);
        }
        Some(records)
    }
}

#[async_trait]
impl<C: ResultClient> Reporter for OpenTmiReporter<C> {
    async fn on_session_start(&self) {
        self.session().started = Some(Instant::now());
    }

    async fn on_test_report(&self, report: &TestReport) {
        self.record(report);
    }

    async fn on_collect_report(&self, report: &TestReport) {
        self.record(report);
    }

    async fn on_session_finish(&self) {
        let Some(records) = self.take_batch() else {
            return;
        };
        for record in &records {
            if let Ok(json) = serde_json::to_string(record) {
                debug!("Result: {}", json);
            }
        }

        let outcome = self
            .coordinator
            .upload(self.access_token.as_deref(), records)
            .await;
        self.session().outcome = Some(outcome);
    }

    fn header(&self) -> Option<String> {
        Some(format!(
            "{} version: {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ))
    }

    fn terminal_summary(&self) -> Option<String> {
        self.upload_outcome().map(|outcome| outcome.to_string())
    }
}
