//! Configuration loading and schema definitions for opentmi-report.
//!
//! This module provides types and functions for loading configuration from
//! TOML files or strings, and for validating the server address before a
//! reporter is attached.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Errors that make the OpenTMI settings unusable.
///
/// These never fail a test run; they only keep the reporter from being
/// attached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no OpenTMI host configured")]
    MissingHost,

    #[error("invalid OpenTMI host '{host}': {reason}")]
    InvalidHost { host: String, reason: String },
}

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use opentmi_report::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("opentmi.toml"))?;
/// println!("Workers: {}", config.opentmi.worker_count());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// ```
/// use opentmi_report::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [opentmi]
///     host = "localhost:3000"
///     workers = 4
/// "#)?;
///
/// assert_eq!(config.opentmi.worker_count(), 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Normalizes a configured host into a base URL.
///
/// A missing scheme defaults to `http://` and trailing slashes are removed.
pub fn normalize_host(host: Option<&str>) -> Result<String, ConfigError> {
    let host = host.map(str::trim).unwrap_or_default();
    if host.is_empty() {
        return Err(ConfigError::MissingHost);
    }

    let candidate = if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    };

    let url = reqwest::Url::parse(&candidate).map_err(|e| ConfigError::InvalidHost {
        host: host.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidHost {
            host: host.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    Ok(candidate.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opentmi.toml");
        std::fs::write(&path, "[opentmi]\nhost = \"localhost:3000\"\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.opentmi.host.as_deref(), Some("localhost:3000"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config(Path::new("/nonexistent/opentmi.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_load_invalid_toml() {
        assert!(load_config_str("[opentmi\nhost = 1").is_err());
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(
            normalize_host(Some("localhost:3000")).unwrap(),
            "http://localhost:3000"
        );
        assert_eq!(
            normalize_host(Some("https://opentmi.example.com/")).unwrap(),
            "https://opentmi.example.com"
        );
    }

    #[test]
    fn test_normalize_missing_host() {
        assert_eq!(normalize_host(None), Err(ConfigError::MissingHost));
        assert_eq!(normalize_host(Some("   ")), Err(ConfigError::MissingHost));
    }

    #[test]
    fn test_normalize_rejects_other_schemes() {
        assert!(matches!(
            normalize_host(Some("ftp://files.example.com")),
            Err(ConfigError::InvalidHost { .. })
        ));
    }
}
