//! Outbound A2A calls to other agents over HTTP.

use std::time::Duration;

use reqwest::Client as HttpClient;
use thiserror::Error;

use super::types::{AgentRequest, AgentResponse};

/// Default per-request timeout for agent calls.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum A2aError {
    #[error("connection failed to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("agent at {url} did not answer within {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("agent at {url} returned HTTP {status}")]
    HttpError { url: String, status: u16 },

    #[error("invalid response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },
}

/// Sends A2A requests. Cheap to clone; connections are pooled.
#[derive(Debug, Clone)]
pub struct A2aClient {
    http: HttpClient,
}

impl A2aClient {
    pub fn new() -> Result<Self, A2aError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| A2aError::ConnectionFailed {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }

    /// POST `request` to the agent at `url` and decode its reply.
    pub async fn send_request(
        &self,
        url: &str,
        request: &AgentRequest,
        timeout: Duration,
    ) -> Result<AgentResponse, A2aError> {
        tracing::debug!(url, messages = request.messages.len(), "sending A2A request");

        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                A2aError::Timeout {
                    url: url.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                A2aError::ConnectionFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        };

        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(map_err)?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(url, status = status.as_u16(), "agent returned an error status");
            return Err(A2aError::HttpError {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(map_err)?;
        serde_json::from_slice(&body).map_err(|e| A2aError::InvalidResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}
