//! Agent configuration.
//!
//! Read from a TOML file at every `start()`, then adjusted by environment
//! overrides. Tests and embedders can hand the controller an already-built
//! [`AgentConfig`] through [`ConfigSource::Inline`].

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

use crate::report::DEFAULT_REPORT_TIMEOUT;
use crate::scan::{DEFAULT_SCAN_BINARY, DEFAULT_SCAN_TIMEOUT};
use crate::worker::DEFAULT_SHELL;

pub const CONFIG_ENV: &str = "HOSTWATCH_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "hostwatch.toml";
pub const PORT_ENV: &str = "HOSTWATCH_PORT";
pub const ENDPOINT_ENV: &str = "HOSTWATCH_ENDPOINT";

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path:?} not found")]
    Missing { path: PathBuf },
    #[error("failed to read config at {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    pub frequency: Duration,
    pub directory: String,
    pub endpoint: String,
    pub shutdown_grace: Duration,
    pub shell: String,
    pub scan_binary: String,
    pub scan_timeout: Duration,
    pub report_timeout: Duration,
}

impl AgentConfig {
    /// Required settings; everything else takes its default.
    pub fn new(
        port: u16,
        frequency: Duration,
        directory: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port,
            frequency,
            directory: directory.into(),
            endpoint: endpoint.into(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            shell: DEFAULT_SHELL.to_string(),
            scan_binary: DEFAULT_SCAN_BINARY.to_string(),
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            report_timeout: DEFAULT_REPORT_TIMEOUT,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frequency.is_zero() {
            return Err(ConfigError::invalid(
                "service.frequency_minutes",
                "must be greater than zero",
            ));
        }
        if self.directory.trim().is_empty() {
            return Err(ConfigError::invalid("service.directory", "must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("service.host", "must not be empty"));
        }
        if self.shell.trim().is_empty() {
            return Err(ConfigError::invalid("worker.shell", "must not be empty"));
        }
        if self.scan_binary.trim().is_empty() {
            return Err(ConfigError::invalid("scan.binary", "must not be empty"));
        }

        let endpoint = Url::parse(&self.endpoint)
            .map_err(|err| ConfigError::invalid("service.endpoint", err.to_string()))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "service.endpoint",
                format!("unsupported scheme `{}`", endpoint.scheme()),
            ));
        }
        Ok(())
    }

    /// Parses file contents and applies overrides from `lookup`.
    pub fn from_toml_str<F>(contents: &str, path: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut raw: RawConfig = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        apply_env_overrides(&mut raw.service, lookup)?;
        let config = raw.into_runtime_config()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ConfigError::Missing {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::from_toml_str(&contents, path, |key| env::var(key).ok())
    }
}

/// Where the controller gets its configuration on each start.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Inline(AgentConfig),
}

impl ConfigSource {
    /// `--config` flag, then `HOSTWATCH_CONFIG`, then `./hostwatch.toml`.
    pub fn discover(flag: Option<PathBuf>) -> Self {
        let path = flag
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        ConfigSource::File(path)
    }

    pub fn load(&self) -> Result<AgentConfig, ConfigError> {
        match self {
            ConfigSource::File(path) => AgentConfig::from_file(path),
            ConfigSource::Inline(config) => {
                config.validate()?;
                Ok(config.clone())
            }
        }
    }
}

#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    service: RawServiceSection,
    #[serde(default)]
    worker: RawWorkerSection,
    #[serde(default)]
    scan: RawScanSection,
    #[serde(default)]
    report: RawReportSection,
}

#[derive(Deserialize, Default)]
struct RawServiceSection {
    host: Option<String>,
    port: Option<u16>,
    frequency_minutes: Option<u64>,
    directory: Option<String>,
    endpoint: Option<String>,
    shutdown_grace_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct RawWorkerSection {
    shell: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawScanSection {
    binary: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct RawReportSection {
    timeout_secs: Option<u64>,
}

impl RawConfig {
    fn into_runtime_config(self) -> Result<AgentConfig, ConfigError> {
        let service = self.service;
        let port = service
            .port
            .ok_or_else(|| ConfigError::invalid("service.port", "missing"))?;
        let minutes = service
            .frequency_minutes
            .ok_or_else(|| ConfigError::invalid("service.frequency_minutes", "missing"))?;
        let directory = service
            .directory
            .ok_or_else(|| ConfigError::invalid("service.directory", "missing"))?;
        let endpoint = service
            .endpoint
            .ok_or_else(|| ConfigError::invalid("service.endpoint", "missing"))?;
        let frequency = minutes
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::invalid("service.frequency_minutes", "too large"))?;

        let mut config = AgentConfig::new(port, frequency, directory, endpoint);
        if let Some(host) = service.host {
            config.host = host;
        }
        if let Some(secs) = service.shutdown_grace_secs {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(shell) = self.worker.shell {
            config.shell = shell;
        }
        if let Some(binary) = self.scan.binary {
            config.scan_binary = binary;
        }
        if let Some(secs) = self.scan.timeout_secs {
            config.scan_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.report.timeout_secs {
            config.report_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

fn apply_env_overrides<F>(service: &mut RawServiceSection, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup(PORT_ENV) {
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|err| ConfigError::invalid("service.port", format!("{PORT_ENV}: {err}")))?;
        service.port = Some(port);
    }
    if let Some(endpoint) = lookup(ENDPOINT_ENV) {
        service.endpoint = Some(endpoint);
    }
    Ok(())
}
