//! File enumeration through an external query engine.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command as TokioCommand;
use tokio::time;
use tracing::debug;

pub const DEFAULT_SCAN_BINARY: &str = "osqueryi";
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to launch `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },
    #[error("`{binary}` exited with {status}: {stderr}")]
    Exit {
        binary: String,
        status: String,
        stderr: String,
    },
    #[error("`{binary}` did not finish within {timeout:?}")]
    Timeout { binary: String, timeout: Duration },
    #[error("unreadable scan output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Lists the files below a directory.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, directory: &str) -> Result<Vec<String>, ScanError>;
}

/// Queries `osqueryi --json` for every path under the directory.
#[derive(Debug, Clone)]
pub struct OsqueryScanner {
    binary: String,
    timeout: Duration,
}

impl OsqueryScanner {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

impl Default for OsqueryScanner {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_BINARY, DEFAULT_SCAN_TIMEOUT)
    }
}

#[async_trait]
impl Scanner for OsqueryScanner {
    async fn scan(&self, directory: &str) -> Result<Vec<String>, ScanError> {
        let query = path_prefix_query(directory);
        debug!(binary = %self.binary, %query, "Running scan query");

        let child = TokioCommand::new(&self.binary)
            .arg("--json")
            .arg(&query)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match time::timeout(self.timeout, child).await {
            Ok(result) => result.map_err(|source| ScanError::Spawn {
                binary: self.binary.clone(),
                source,
            })?,
            Err(_) => {
                return Err(ScanError::Timeout {
                    binary: self.binary.clone(),
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(ScanError::Exit {
                binary: self.binary.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_query_output(&output.stdout)
    }
}

/// `SELECT path FROM file WHERE path LIKE '<dir>/%';`
pub fn path_prefix_query(directory: &str) -> String {
    let mut prefix = directory.replace('\'', "''");
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    format!("SELECT path FROM file WHERE path LIKE '{}%';", prefix)
}

/// Extracts the `path` column, in row order, from query output.
pub fn parse_query_output(stdout: &[u8]) -> Result<Vec<String>, ScanError> {
    let rows: Vec<Value> = serde_json::from_slice(stdout)?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get("path").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}
