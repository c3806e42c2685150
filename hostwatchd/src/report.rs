//! Delivery of scan results to the remote collector.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_REPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON body posted to the collector once per scan cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportPayload {
    pub timestamp: String,
    pub modified_files: Vec<String>,
    pub system_stats: String,
}

impl ReportPayload {
    pub fn new(modified_files: Vec<String>, system_stats: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            modified_files,
            system_stats: system_stats.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to send data to API, status code: {0}")]
    Status(u16),
    #[error("failed to send data to API: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, endpoint: &str, payload: &ReportPayload) -> Result<(), ReportError>;
}

/// Single JSON POST per report; only `200 OK` counts as delivered.
#[derive(Debug, Clone)]
pub struct HttpReporter {
    client: Client,
}

impl HttpReporter {
    pub fn new(timeout: Duration) -> Result<Self, ReportError> {
        let client = Client::builder()
            .user_agent(concat!("hostwatchd/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn report(&self, endpoint: &str, payload: &ReportPayload) -> Result<(), ReportError> {
        let response = self.client.post(endpoint).json(payload).send().await?;
        let status = response.status();
        debug!(
            endpoint,
            status = status.as_u16(),
            files = payload.modified_files.len(),
            "Report posted"
        );

        if status != StatusCode::OK {
            return Err(ReportError::Status(status.as_u16()));
        }
        Ok(())
    }
}
