//! Remote submission API.
//!
//! [`ResultClient`] is the seam between the coordinator and the server.
//! [`HttpResultClient`] speaks the OpenTMI REST API:
//!
//! | Call | Request | Response |
//! |------|---------|----------|
//! | authenticate | `POST /auth/{service}/token` `{"access_token": ...}` | `{"token": ...}` |
//! | submit | `POST /api/v0/results` with `Authorization: Bearer {token}` | any 2xx |

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{SessionToken, UploadError, UploadResult};
use crate::config::{ConfigError, OpenTmiConfig, normalize_host};
use crate::record::ResultRecord;

/// Client for the two remote calls an upload needs.
#[async_trait]
pub trait ResultClient: Send + Sync {
    /// Exchanges an access token for a session token.
    ///
    /// A missing access token is an authentication failure.
    async fn authenticate(&self, access_token: Option<&str>) -> UploadResult<SessionToken>;

    /// Submits a single result.
    async fn submit(&self, session: &SessionToken, record: &ResultRecord) -> UploadResult<()>;
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    access_token: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// [`ResultClient`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpResultClient {
    client: reqwest::Client,
    base_url: String,
    auth_service: String,
}

impl HttpResultClient {
    /// Creates a client for an already normalized base URL.
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> UploadResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;

        Ok(Self::with_http_client(client, base_url))
    }

    /// Wraps a preconfigured reqwest client, e.g. one with custom TLS roots.
    pub fn with_http_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            auth_service: "github".to_string(),
        }
    }

    /// Creates a client from configuration.
    ///
    /// Fails with a [`ConfigError`] when the host is missing or invalid.
    pub fn from_config(config: &OpenTmiConfig) -> Result<Self, ConfigError> {
        let base_url = normalize_host(config.host.as_deref())?;
        let client = Self::new(base_url.clone(), config.connect_timeout()).map_err(|e| {
            ConfigError::InvalidHost {
                host: base_url,
                reason: e.to_string(),
            }
        })?;
        Ok(client.with_auth_service(config.auth_service.clone()))
    }

    /// Sets the identity provider used for token exchange.
    pub fn with_auth_service(mut self, service: impl Into<String>) -> Self {
        self.auth_service = service.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn token_url(&self) -> String {
        format!("{}/auth/{}/token", self.base_url, self.auth_service)
    }

    fn results_url(&self) -> String {
        format!("{}/api/v0/results", self.base_url)
    }
}

#[async_trait]
impl ResultClient for HttpResultClient {
    async fn authenticate(&self, access_token: Option<&str>) -> UploadResult<SessionToken> {
        let access_token = access_token
            .ok_or_else(|| UploadError::Authentication("no access token".to_string()))?;

        debug!("Exchanging access token at {}", self.token_url());
        let response = self
            .client
            .post(self.token_url())
            .json(&TokenRequest { access_token })
            .send()
            .await
            .map_err(|e| UploadError::Authentication(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Authentication(format!(
                "server answered {}: {}",
                status,
                body.trim()
            )));
        }

        let TokenResponse { token } = response
            .json()
            .await
            .map_err(|e| UploadError::Authentication(format!("invalid token response: {}", e)))?;

        Ok(SessionToken::new(token))
    }

    async fn submit(&self, session: &SessionToken, record: &ResultRecord) -> UploadResult<()> {
        let response = self
            .client
            .post(self.results_url())
            .bearer_auth(session.as_str())
            .json(record)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(UploadError::Submission(format!(
                "{} rejected with {}: {}",
                record.tcid,
                status,
                body.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::framework::{Outcome, Phase, TestReport, classify};
    use crate::record::{RecordBuilder, RunMetadata};

    /// One canned HTTP response per accepted connection.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                seen.lock().unwrap().push(request);
                let response = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });

        (format!("http://{}", addr), requests)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if data.len() >= header_end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).into_owned()
    }

    fn record() -> ResultRecord {
        let report = TestReport::new("tests/test_a.py::test_ok", Phase::Call, Outcome::Passed);
        let classification = classify(&report).unwrap();
        RecordBuilder::new(RunMetadata::default()).build(&report, &classification)
    }

    fn client(base_url: &str) -> HttpResultClient {
        let http = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        HttpResultClient::with_http_client(http, base_url)
    }

    #[test]
    fn test_urls() {
        let c = client("http://localhost:3000").with_auth_service("gitlab");
        assert_eq!(c.token_url(), "http://localhost:3000/auth/gitlab/token");
        assert_eq!(c.results_url(), "http://localhost:3000/api/v0/results");
    }

    #[test]
    fn test_from_config_requires_host() {
        let config = OpenTmiConfig::default();
        assert!(matches!(
            HttpResultClient::from_config(&config),
            Err(ConfigError::MissingHost)
        ));
    }

    #[tokio::test]
    async fn test_authenticate_and_submit() {
        let (base_url, requests) =
            serve(vec![(200, r#"{"token":"jwt-1"}"#), (200, r#"{"_id":"r1"}"#)]).await;
        let c = client(&base_url);

        let session = c.authenticate(Some("gho_abc")).await.unwrap();
        assert_eq!(session.as_str(), "jwt-1");
        c.submit(&session, &record()).await.unwrap();

        let requests = requests.lock().unwrap();
        assert!(requests[0].starts_with("POST /auth/github/token "));
        assert!(requests[0].contains(r#""access_token":"gho_abc""#));
        assert!(requests[1].starts_with("POST /api/v0/results "));
        assert!(
            requests[1]
                .to_ascii_lowercase()
                .contains("authorization: bearer jwt-1")
        );
        assert!(requests[1].contains(r#""tcid":"tests/test_a.py::test_ok""#));
    }

    #[tokio::test]
    async fn test_authenticate_rejected() {
        let (base_url, _) = serve(vec![(401, r#"{"message":"bad token"}"#)]).await;
        let err = client(&base_url)
            .authenticate(Some("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Authentication(_)));
        assert!(err.to_string().contains("401"));
    }

    #[tokio::test]
    async fn test_authenticate_without_token() {
        let err = client("http://127.0.0.1:9")
            .authenticate(None)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_submit_rejected() {
        let (base_url, _) = serve(vec![(400, r#"{"error":"invalid"}"#)]).await;
        let err = client(&base_url)
            .submit(&SessionToken::new("jwt"), &record())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Submission(_)));
    }
}
