//! HTTP transport and the exporters built on top of it (spec.md §4.8–4.10).

pub mod error_exporter;
pub mod otlp;

use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::Value;

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const READ_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

static USER_AGENT: Lazy<String> = Lazy::new(|| format!("miniapm-rust/{}", env!("CARGO_PKG_VERSION")));

/// The outcome of a single HTTP POST. Never constructed from a panic or a
/// propagated error — network and serialization failures are captured here.
#[derive(Debug, Clone)]
pub struct TransportResult {
    pub status: u16,
    pub body: String,
    pub success: bool,
    pub error: Option<String>,
}

impl TransportResult {
    fn failure(error: impl Into<String>) -> Self {
        Self { status: 0, body: String::new(), success: false, error: Some(error.into()) }
    }
}

/// Thin POST helper shared by the OTLP and error exporters.
///
/// Never throws: network errors, timeouts, and serialization failures are
/// all captured into a non-success [`TransportResult`].
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(OPEN_TIMEOUT)
            .timeout(READ_WRITE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    /// POST `payload` (serialized as JSON) to `url` with `Authorization:
    /// Bearer {api_key}` plus any extra headers, returning a structured
    /// result rather than raising.
    pub async fn post(&self, url: &str, payload: &Value, api_key: &str) -> TransportResult {
        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT.as_str())
            .json(payload)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.text().await {
                    Ok(body) => TransportResult { status, success: (200..300).contains(&status), body, error: None },
                    Err(err) => TransportResult::failure(err.to_string()),
                }
            }
            Err(err) => TransportResult::failure(err.to_string()),
        }
    }

    /// A no-body POST used by [`crate::Apm::healthy`].
    pub async fn post_empty(&self, url: &str, api_key: &str) -> TransportResult {
        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .header("User-Agent", USER_AGENT.as_str())
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                TransportResult { status, success: (200..300).contains(&status), body: String::new(), error: None }
            }
            Err(err) => TransportResult::failure(err.to_string()),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}
