//! hostwatch control client
//!
//! Typed wrapper over the agent's local HTTP control API: health, journal
//! retrieval and command submission.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

pub const DEFAULT_URL: &str = "http://127.0.0.1:3000";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("agent not reachable: {0}")]
    Unavailable(#[source] reqwest::Error),
    #[error("agent rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::InvalidResponse(err.to_string())
        } else {
            ClientError::Unavailable(err)
        }
    }
}

/// Reply of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    #[serde(rename = "workerThread")]
    pub worker: String,
    #[serde(rename = "timerThread")]
    pub timer: String,
}

impl Health {
    pub fn all_running(&self) -> bool {
        self.worker == "running" && self.timer == "running"
    }
}

#[derive(Debug, Clone)]
pub struct ControlClient {
    base: String,
    http: Client,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ClientError::Unavailable)?;
        Ok(Self::with_client(base_url, http))
    }

    pub fn with_client(base_url: impl Into<String>, http: Client) -> Self {
        let base = base_url.into().trim_end_matches('/').to_string();
        Self { base, http }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub async fn health(&self) -> Result<Health, ClientError> {
        let response = self.http.get(self.url("/health")).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// Rendered journal lines, oldest first.
    pub async fn logs(&self) -> Result<Vec<String>, ClientError> {
        let response = self.http.get(self.url("/logs")).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// Queues a command; returns the agent's confirmation text.
    pub async fn add_command(&self, command: &str) -> Result<String, ClientError> {
        debug!(command, "Submitting command");
        let response = self
            .http
            .post(self.url("/add-command"))
            .json(&json!({ "command": command }))
            .send()
            .await?;
        let body = check(response).await?.text().await?;
        Ok(body.trim_end().to_string())
    }

    /// Asks the agent to shut itself down through the `stop` directive.
    pub async fn stop(&self) -> Result<String, ClientError> {
        self.add_command("stop").await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ClientError::Rejected {
        status: status.as_u16(),
        message: message.trim_end().to_string(),
    })
}
