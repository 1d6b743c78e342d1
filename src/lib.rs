//! opentmi-report: publish test run results to OpenTMI.
//!
//! This crate turns a test runner's lifecycle events into OpenTMI result
//! records and uploads them when the run ends.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Framework**: Typed runner reports and their verdict classification,
//!   plus JUnit XML ingestion
//! - **Record**: OpenTMI result records and the run metadata they carry
//! - **Report**: The reporter hook contract and the OpenTMI reporter
//! - **Upload**: Bounded concurrent upload with per-record failure isolation
//!
//! # Example
//!
//! ```no_run
//! use opentmi_report::config::load_config;
//! use opentmi_report::framework::{JunitFormat, parse_junit_file};
//! use opentmi_report::report::{OpenTmiReporter, Reporter};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("opentmi.toml"))?;
//!     let reports = parse_junit_file(std::path::Path::new("junit.xml"), JunitFormat::Pytest)?;
//!     if let Some(reporter) = OpenTmiReporter::from_config(&config) {
//!         reporter.on_session_start().await;
//!         for report in &reports {
//!             reporter.on_test_report(report).await;
//!         }
//!         reporter.on_session_finish().await;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod framework;
pub mod record;
pub mod report;
pub mod upload;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use framework::{Outcome, Phase, TestReport, Verdict};
pub use record::ResultRecord;
pub use report::{OpenTmiReporter, Reporter};
pub use upload::{ResultClient, UploadCoordinator, UploadOutcome};
