//! OpenTMI result records.
//!
//! A [`ResultRecord`] is one test outcome plus the run metadata OpenTMI
//! expects alongside it. Records are built by a [`RecordBuilder`] from a
//! classified [`TestReport`] and a [`RunMetadata`] snapshot taken once per
//! run, then linked with the session summary when the run ends. After that
//! they are only read.
//!
//! # JSON shape
//!
//! ```json
//! {
//!   "tcid": "tests/test_math.py::test_add",
//!   "campaign": "nightly",
//!   "job": { "id": "jenkins-nightly-42" },
//!   "exec": {
//!     "verdict": "pass",
//!     "note": "",
//!     "duration": 0.12,
//!     "env": { "framework": { "name": "opentmi-report", "ver": "0.1.0" } },
//!     "sut": { "commitId": "abc123", "branch": "main", "cut": [], "fut": [] },
//!     "duts": [ { "serial_number": "123", "type": "hw" } ],
//!     "logs": [ { "name": "stdout", "mime_type": "txt", "data": "..." } ],
//!     "profiling": { "numtests": 3, "generated_at": "..." }
//!   }
//! }
//! ```

use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::framework::{Classification, TestReport};

/// Metadata keys that describe the device under test.
const DUT_PREFIX: &str = "DUT";

/// A single result ready for submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// Test case id.
    pub tcid: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub campaign: String,

    pub job: Job,

    #[serde(rename = "exec")]
    pub execution: Execution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub verdict: String,

    #[serde(default)]
    pub note: String,

    /// Seconds.
    pub duration: f64,

    pub env: Environment,

    pub sut: Sut,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duts: Vec<Dut>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogFile>,

    #[serde(default)]
    pub profiling: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub framework: FrameworkInfo,
}

/// Name and version of the tool that produced the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub name: String,
    #[serde(rename = "ver")]
    pub version: String,
}

impl Default for FrameworkInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Software under test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sut {
    #[serde(rename = "commitId", default)]
    pub commit_id: String,

    #[serde(default)]
    pub branch: String,

    /// Components under test.
    #[serde(default)]
    pub cut: Vec<String>,

    /// Features under test.
    #[serde(default)]
    pub fut: Vec<String>,
}

/// Device under test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dut {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(rename = "ver", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<DutProvider>,
}

impl Dut {
    fn apply(&mut self, key: &str, value: String) {
        match key {
            "DUT_SERIAL_NUMBER" => {
                self.serial_number = Some(value);
                self.kind = Some("hw".to_string());
            }
            "DUT_VERSION" => self.version = Some(value),
            "DUT_VENDOR" => self.vendor = Some(value),
            "DUT_MODEL" => self.model = Some(value),
            "DUT_PROVIDER" => self.provider = Some(DutProvider { name: value }),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DutProvider {
    pub name: String,
}

/// A captured log attached to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogFile {
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

impl LogFile {
    fn text(name: &str, data: &str) -> Self {
        Self {
            name: name.to_string(),
            mime_type: "txt".to_string(),
            data: data.to_string(),
        }
    }
}

impl ResultRecord {
    /// Attaches the run-level summary to this record.
    pub fn link_session(&mut self, summary: &SessionSummary) {
        let profiling = &mut self.execution.profiling;
        profiling.insert(
            "suite".to_string(),
            json!({ "duration": summary.duration.as_secs_f64() }),
        );
        profiling.insert("numtests".to_string(), json!(summary.num_tests));
        profiling.insert(
            "generated_at".to_string(),
            json!(summary.generated_at.to_rfc3339()),
        );
    }
}

/// Run-level facts added to every record at session finish.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub duration: Duration,
    pub num_tests: usize,
    pub generated_at: DateTime<Local>,
}

/// Metadata shared by every record of one run.
///
/// Collected once from CI environment variables and the configured
/// key/value metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunMetadata {
    pub job_id: String,
    pub campaign: String,
    pub sut: Sut,
    pub dut: Option<Dut>,
}

impl RunMetadata {
    /// Collects metadata from the process environment.
    pub fn from_env(metadata: &[(String, String)]) -> Self {
        Self::collect(|key| std::env::var(key).ok(), metadata)
    }

    /// Collects metadata using `env` to look up variables.
    ///
    /// `GIT_COMMIT`, `GIT_BRANCH`, `BUILD_TAG` and `JOB_NAME` are read from
    /// the environment; a missing `BUILD_TAG` gets a fresh UUID. Metadata
    /// pairs are applied in order, so a later `SUT_COMMIT_ID` wins over the
    /// environment.
    pub fn collect<F>(env: F, metadata: &[(String, String)]) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut run = RunMetadata {
            job_id: env("BUILD_TAG").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            campaign: env("JOB_NAME").unwrap_or_default(),
            sut: Sut {
                commit_id: env("GIT_COMMIT").unwrap_or_default(),
                branch: env("GIT_BRANCH").unwrap_or_default(),
                ..Sut::default()
            },
            dut: None,
        };

        for (key, value) in metadata {
            if key.starts_with(DUT_PREFIX) && run.dut.is_none() {
                run.dut = Some(Dut::default());
            }
            let value = value.clone();
            match key.as_str() {
                "SUT_COMPONENT" => run.sut.cut.push(value),
                "SUT_FEATURE" => run.sut.fut.push(value),
                "SUT_COMMIT_ID" => run.sut.commit_id = value,
                _ => {
                    if let Some(dut) = run.dut.as_mut() {
                        dut.apply(key, value);
                    }
                }
            }
        }

        run
    }
}

/// Builds result records for one run.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    metadata: RunMetadata,
    framework: FrameworkInfo,
    store_logs: bool,
}

impl RecordBuilder {
    pub fn new(metadata: RunMetadata) -> Self {
        Self {
            metadata,
            framework: FrameworkInfo::default(),
            store_logs: true,
        }
    }

    /// Controls whether captured stdout/stderr are attached as logs.
    pub fn with_store_logs(mut self, store_logs: bool) -> Self {
        self.store_logs = store_logs;
        self
    }

    pub fn with_framework(mut self, framework: FrameworkInfo) -> Self {
        self.framework = framework;
        self
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Builds the record for a classified report.
    pub fn build(&self, report: &TestReport, classification: &Classification) -> ResultRecord {
        let mut profiling = Map::new();
        if !report.user_properties.is_empty() {
            let properties: Map<String, Value> = report
                .user_properties
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            profiling.insert("properties".to_string(), Value::Object(properties));
        }
        if !report.keywords.is_empty() {
            profiling.insert("keywords".to_string(), json!(report.keywords));
        }

        let mut logs = Vec::new();
        if self.store_logs {
            if !report.stdout.is_empty() {
                logs.push(LogFile::text("stdout", &report.stdout));
            }
            if !report.stderr.is_empty() {
                logs.push(LogFile::text("stderr", &report.stderr));
            }
        }

        ResultRecord {
            tcid: report.node_id.clone(),
            campaign: self.metadata.campaign.clone(),
            job: Job {
                id: self.metadata.job_id.clone(),
            },
            execution: Execution {
                verdict: classification.verdict.as_str().to_string(),
                note: classification.note.clone(),
                duration: report.duration.as_secs_f64(),
                env: Environment {
                    framework: self.framework.clone(),
                },
                sut: self.metadata.sut.clone(),
                duts: self.metadata.dut.iter().cloned().collect(),
                logs,
                profiling,
            },
        }
    }
}
