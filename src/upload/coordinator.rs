//! Bounded, failure-isolated upload of a result batch.
//!
//! The coordinator has two states. While `authenticating` it exchanges the
//! access token once; a failure there ends the pass and every record is
//! counted as failed. While `submitting` it keeps at most `workers`
//! submissions in flight. Each submission succeeds or fails on its own and
//! the counts are reduced from the per-submission results once all of them
//! have completed.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};

use super::{ResultClient, SessionToken, UploadError, UploadOutcome};
use crate::config::{OpenTmiConfig, default_worker_count};
use crate::record::ResultRecord;

/// Uploads result batches through a [`ResultClient`].
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use opentmi_report::upload::{HttpResultClient, UploadCoordinator};
///
/// # async fn example(records: Vec<opentmi_report::record::ResultRecord>) -> anyhow::Result<()> {
/// let client = HttpResultClient::new("http://localhost:3000", Duration::from_secs(10))?;
/// let coordinator = UploadCoordinator::new(client).with_workers(4);
///
/// let outcome = coordinator.upload(Some("gho_token"), records).await;
/// println!("{}", outcome);
/// # Ok(())
/// # }
/// ```
pub struct UploadCoordinator<C> {
    client: C,
    workers: usize,
    submit_timeout: Option<Duration>,
    show_progress: bool,
}

impl<C: ResultClient> UploadCoordinator<C> {
    /// Creates a coordinator sized to the host's parallelism with no
    /// per-submission deadline.
    pub fn new(client: C) -> Self {
        Self {
            client,
            workers: default_worker_count(),
            submit_timeout: None,
            show_progress: false,
        }
    }

    /// Creates a coordinator using the upload settings from configuration.
    pub fn from_config(client: C, config: &OpenTmiConfig) -> Self {
        Self::new(client)
            .with_workers(config.worker_count())
            .with_submit_timeout(config.submit_timeout())
            .with_progress(config.progress)
    }

    /// Sets the maximum number of submissions in flight (at least one).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the deadline for a single submission.
    pub fn with_submit_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Shows a progress bar on stderr while submitting.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Authenticates once and submits every record.
    ///
    /// Never fails: authentication failure counts all records as failed,
    /// and each submission failure counts that one record as failed.
    pub async fn upload(
        &self,
        access_token: Option<&str>,
        records: Vec<ResultRecord>,
    ) -> UploadOutcome {
        let total = records.len();

        let session = match self.client.authenticate(access_token).await {
            Ok(session) => session,
            Err(e) => {
                error!("OpenTMI {}; {} results not uploaded", e, total);
                return UploadOutcome::all_failed(total);
            }
        };

        info!(
            "Uploading {} results with up to {} concurrent submissions",
            total, self.workers
        );

        let progress = self.progress_bar(total);
        let session = &session;
        let outcome = stream::iter(records)
            .map(|record| async move { self.submit_one(session, &record).await })
            .buffer_unordered(self.workers)
            .fold(UploadOutcome::default(), |mut outcome, ok| {
                progress.inc(1);
                outcome.record(ok);
                futures::future::ready(outcome)
            })
            .await;
        progress.finish_and_clear();

        info!("{}", outcome);
        outcome
    }

    /// Runs [`upload`](Self::upload) to completion on a private runtime,
    /// blocking the calling thread.
    ///
    /// For callers that are not async. Must not be called from inside a
    /// tokio runtime.
    pub fn upload_blocking(
        &self,
        access_token: Option<&str>,
        records: Vec<ResultRecord>,
    ) -> UploadOutcome {
        let total = records.len();
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime.block_on(self.upload(access_token, records)),
            Err(e) => {
                error!("Failed to start upload runtime: {}", e);
                UploadOutcome::all_failed(total)
            }
        }
    }

    /// Submits one record, returning whether it was accepted.
    async fn submit_one(&self, session: &SessionToken, record: &ResultRecord) -> bool {
        let submission = self.client.submit(session, record);
        let result = match self.submit_timeout {
            Some(limit) => tokio::time::timeout(limit, submission)
                .await
                .unwrap_or_else(|_| Err(UploadError::Timeout(limit))),
            None => submission.await,
        };

        match result {
            Ok(()) => {
                debug!("Uploaded {}", record.tcid);
                true
            }
            Err(e) => {
                warn!("Failed to upload {}: {}", record.tcid, e);
                false
            }
        }
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} uploaded")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::framework::{Outcome, Phase, TestReport, classify};
    use crate::record::{RecordBuilder, RunMetadata};
    use crate::upload::UploadResult;

    /// In-memory client that fails or hangs on chosen test ids.
    #[derive(Default)]
    struct MockClient {
        reject_auth: bool,
        failing: HashSet<String>,
        hanging: HashSet<String>,
        delay: Duration,
        auth_calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        submitted: Mutex<Vec<String>>,
    }

    impl MockClient {
        fn failing_on(ids: &[&str]) -> Self {
            Self {
                failing: ids.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        fn submitted(&self) -> Vec<String> {
            let mut ids = self.submitted.lock().unwrap().clone();
            ids.sort();
            ids
        }
    }

    #[async_trait]
    impl ResultClient for MockClient {
        async fn authenticate(&self, _access_token: Option<&str>) -> UploadResult<SessionToken> {
            self.auth_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_auth {
                Err(UploadError::Authentication("bad token".to_string()))
            } else {
                Ok(SessionToken::new("session"))
            }
        }

        async fn submit(&self, session: &SessionToken, record: &ResultRecord) -> UploadResult<()> {
            assert_eq!(session.as_str(), "session");
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if self.hanging.contains(&record.tcid) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            } else if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.submitted.lock().unwrap().push(record.tcid.clone());
            if self.failing.contains(&record.tcid) {
                Err(UploadError::Submission(format!("{} rejected", record.tcid)))
            } else {
                Ok(())
            }
        }
    }

    fn records(n: usize) -> Vec<ResultRecord> {
        let builder = RecordBuilder::new(RunMetadata::default());
        (1..=n)
            .map(|i| {
                let report = TestReport::new(format!("test_{}", i), Phase::Call, Outcome::Passed);
                let classification = classify(&report).unwrap();
                builder.build(&report, &classification)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let coordinator = UploadCoordinator::new(MockClient::default()).with_workers(4);
        let outcome = coordinator.upload(Some("token"), records(3)).await;
        assert_eq!(
            outcome,
            UploadOutcome {
                succeeded: 3,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_one_failure_is_isolated() {
        let coordinator =
            UploadCoordinator::new(MockClient::failing_on(&["test_2"])).with_workers(4);
        let outcome = coordinator.upload(Some("token"), records(3)).await;

        assert_eq!(
            outcome,
            UploadOutcome {
                succeeded: 2,
                failed: 1
            }
        );
        assert_eq!(
            coordinator.client().submitted(),
            vec!["test_1", "test_2", "test_3"]
        );
    }

    #[tokio::test]
    async fn test_empty_batch_still_authenticates_once() {
        let coordinator = UploadCoordinator::new(MockClient::default());
        let outcome = coordinator.upload(Some("token"), Vec::new()).await;

        assert_eq!(outcome, UploadOutcome::default());
        assert_eq!(coordinator.client().auth_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_authentication_failure_fails_whole_batch() {
        let client = MockClient {
            reject_auth: true,
            ..MockClient::default()
        };
        let coordinator = UploadCoordinator::new(client);
        let outcome = coordinator.upload(Some("token"), records(5)).await;

        assert_eq!(outcome, UploadOutcome::all_failed(5));
        assert!(coordinator.client().submitted().is_empty());
        assert_eq!(coordinator.client().auth_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_counts_cover_every_record() {
        for n in [0, 1, 7, 25] {
            let failing: Vec<String> = (1..=n).step_by(3).map(|i| format!("test_{}", i)).collect();
            let failing: Vec<&str> = failing.iter().map(String::as_str).collect();
            let coordinator = UploadCoordinator::new(MockClient::failing_on(&failing)).with_workers(3);

            let outcome = coordinator.upload(Some("token"), records(n)).await;
            assert_eq!(outcome.total(), n);
            assert_eq!(outcome.failed, failing.len());
            assert_eq!(coordinator.client().submitted().len(), n);
        }
    }

    #[tokio::test]
    async fn test_worker_count_does_not_change_counts() {
        let mut outcomes = Vec::new();
        for workers in [1, 8] {
            let coordinator =
                UploadCoordinator::new(MockClient::failing_on(&["test_4", "test_9"]))
                    .with_workers(workers);
            outcomes.push(coordinator.upload(Some("token"), records(12)).await);
        }
        assert_eq!(outcomes[0], outcomes[1]);
        assert_eq!(
            outcomes[0],
            UploadOutcome {
                succeeded: 10,
                failed: 2
            }
        );
    }

    #[tokio::test]
    async fn test_in_flight_bounded_by_workers() {
        for workers in [1, 2, 5] {
            let client = MockClient {
                delay: Duration::from_millis(10),
                ..MockClient::default()
            };
            let coordinator = UploadCoordinator::new(client).with_workers(workers);
            coordinator.upload(Some("token"), records(10)).await;

            let max = coordinator.client().max_in_flight.load(Ordering::SeqCst);
            assert_eq!(max, workers);
        }
    }

    #[tokio::test]
    async fn test_hung_submission_times_out() {
        let client = MockClient {
            hanging: ["test_2".to_string()].into_iter().collect(),
            ..MockClient::default()
        };
        let coordinator = UploadCoordinator::new(client)
            .with_workers(2)
            .with_submit_timeout(Some(Duration::from_millis(50)));

        let started = std::time::Instant::now();
        let outcome = coordinator.upload(Some("token"), records(4)).await;

        assert_eq!(
            outcome,
            UploadOutcome {
                succeeded: 3,
                failed: 1
            }
        );
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_zero_workers_clamped() {
        let coordinator = UploadCoordinator::new(MockClient::default()).with_workers(0);
        assert_eq!(coordinator.workers(), 1);
    }

    #[test]
    fn test_from_config() {
        let config = OpenTmiConfig {
            workers: Some(6),
            submit_timeout_secs: 0,
            ..OpenTmiConfig::default()
        };
        let coordinator = UploadCoordinator::from_config(MockClient::default(), &config);
        assert_eq!(coordinator.workers(), 6);
        assert!(coordinator.submit_timeout.is_none());
    }

    #[test]
    fn test_upload_blocking() {
        let coordinator =
            UploadCoordinator::new(MockClient::failing_on(&["test_1"])).with_workers(2);
        let outcome = coordinator.upload_blocking(Some("token"), records(3));
        assert_eq!(
            outcome,
            UploadOutcome {
                succeeded: 2,
                failed: 1
            }
        );
    }
}
