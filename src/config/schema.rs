//! Configuration schema definitions for opentmi-report.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every section is optional; a missing file
//! section falls back to its documented defaults.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── OpenTmiConfig   - Server, credentials and upload settings
//! ├── metadata        - DUT_* / SUT_* key/value pairs attached to results
//! └── JunitConfig     - How JUnit test ids are formed
//! ```

use std::fmt;
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::framework::JunitFormat;

/// Environment variable consulted when no token is configured.
pub const TOKEN_ENV_VAR: &str = "OPENTMI_TOKEN";

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [opentmi]
/// host = "https://opentmi.example.com"
/// workers = 8
///
/// [metadata]
/// DUT_SERIAL_NUMBER = "123"
/// SUT_COMPONENT = ["wifi", "ble"]
///
/// [junit]
/// format = "pytest"
/// ```
///
/// # Example
///
/// ```
/// use opentmi_report::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [opentmi]
///     host = "localhost:3000"
/// "#).unwrap();
/// assert!(config.opentmi.store_logs);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Server and upload settings.
    #[serde(default)]
    pub opentmi: OpenTmiConfig,

    /// Metadata attached to every result.
    ///
    /// Values are a string or a list of strings; lists expand to repeated
    /// keys so that several components or features can be listed.
    #[serde(default)]
    pub metadata: Metadata,

    /// JUnit ingestion settings.
    #[serde(default)]
    pub junit: JunitConfig,
}

impl Config {
    /// Returns the metadata as ordered key/value pairs.
    pub fn metadata_pairs(&self) -> Vec<(String, String)> {
        self.metadata.pairs()
    }
}

/// Metadata entries in the order they were written.
///
/// Later entries can override earlier ones (`SUT_COMMIT_ID`) or append to
/// them (`SUT_COMPONENT`), so file order is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(Vec<(String, MetadataValue)>);

impl Metadata {
    /// Appends one entry after all existing ones.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), MetadataValue::One(value.into())));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Flattens list values into repeated keys.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.0
            .iter()
            .flat_map(|(key, value)| {
                value
                    .values()
                    .into_iter()
                    .map(move |v| (key.clone(), v))
            })
            .collect()
    }
}

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MetadataVisitor;

        impl<'de> Visitor<'de> for MetadataVisitor {
            type Value = Metadata;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a table of strings or string lists")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Metadata, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry::<String, MetadataValue>()? {
                    entries.push(entry);
                }
                Ok(Metadata(entries))
            }
        }

        deserializer.deserialize_map(MetadataVisitor)
    }
}

impl Serialize for Metadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// A metadata value: one string or several.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MetadataValue {
    One(String),
    Many(Vec<String>),
}

impl MetadataValue {
    fn values(&self) -> Vec<String> {
        match self {
            MetadataValue::One(v) => vec![v.clone()],
            MetadataValue::Many(vs) => vs.clone(),
        }
    }
}

/// Server, credential and upload settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `host` | None (uploading disabled) |
/// | `token` | `$OPENTMI_TOKEN` |
/// | `auth_service` | `"github"` |
/// | `store_logs` | true |
/// | `workers` | available parallelism |
/// | `submit_timeout_secs` | 30 |
/// | `connect_timeout_secs` | 10 |
/// | `progress` | false |
///
/// # Example
///
/// ```toml
/// [opentmi]
/// host = "https://opentmi.example.com"
/// token = "gho_xxx"
/// store_logs = false
/// workers = 4
/// submit_timeout_secs = 60
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenTmiConfig {
    /// OpenTMI server address.
    ///
    /// A bare `host:port` is treated as `http://host:port`. Without a host
    /// the reporter is not attached and nothing is uploaded.
    #[serde(default)]
    pub host: Option<String>,

    /// Access token exchanged for a session token at upload time.
    ///
    /// Falls back to the `OPENTMI_TOKEN` environment variable.
    #[serde(default)]
    pub token: Option<String>,

    /// Identity provider the access token belongs to.
    ///
    /// Default: `"github"`
    #[serde(default = "default_auth_service")]
    pub auth_service: String,

    /// Attach captured stdout/stderr to results.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub store_logs: bool,

    /// Maximum number of concurrent submissions.
    ///
    /// Default: the number of available processing units.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Deadline for a single submission in seconds; 0 disables it.
    ///
    /// Default: 30
    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_secs: u64,

    /// TCP connect timeout in seconds.
    ///
    /// Default: 10
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Show a progress bar while uploading.
    ///
    /// Default: false
    #[serde(default)]
    pub progress: bool,
}

impl Default for OpenTmiConfig {
    fn default() -> Self {
        Self {
            host: None,
            token: None,
            auth_service: default_auth_service(),
            store_logs: true,
            workers: None,
            submit_timeout_secs: default_submit_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            progress: false,
        }
    }
}

impl OpenTmiConfig {
    /// Resolves the access token, consulting `$OPENTMI_TOKEN` when none is
    /// configured.
    pub fn resolve_token(&self) -> Option<String> {
        self.resolve_token_with(|key| std::env::var(key).ok())
    }

    /// Like [`resolve_token`](Self::resolve_token) with an injected
    /// environment lookup.
    pub fn resolve_token_with<F>(&self, env: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.token
            .clone()
            .or_else(|| env(TOKEN_ENV_VAR))
            .filter(|t| !t.trim().is_empty())
    }

    /// Number of concurrent submissions, never less than one.
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(default_worker_count)
            .max(1)
    }

    /// Per-submission deadline, `None` when disabled.
    pub fn submit_timeout(&self) -> Option<Duration> {
        (self.submit_timeout_secs > 0).then(|| Duration::from_secs(self.submit_timeout_secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// JUnit ingestion settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JunitConfig {
    /// How test ids are formed from `classname` and `name`.
    ///
    /// Default: `"default"`
    #[serde(default)]
    pub format: JunitFormat,
}

/// Worker count derived from host parallelism.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_auth_service() -> String {
    "github".to_string()
}

fn default_true() -> bool {
    true
}

fn default_submit_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}
