use crate::error::TransportError;
use crate::timeout::{duration_from_millis, DEFAULT_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

/// The HTTP proxy to tunnel through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// `http://host:port` or a bare `host:port`.
    pub proxy_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: Option<usize>,
    /// PEM file with the trust anchors for TLS to the target.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

fn default_max_header_size() -> Option<usize> {
    Some(16 * 1024) // 16KB default header size limit
}

/// Idle thresholds in milliseconds. Unset means 60 seconds, zero or negative
/// disables the watchdog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default)]
    pub read_timeout_millis: Option<i64>,
    #[serde(default)]
    pub write_timeout_millis: Option<i64>,
    #[serde(default)]
    pub response_timeout_millis: Option<i64>,
}

impl TimeoutConfig {
    pub fn disabled() -> Self {
        Self {
            read_timeout_millis: Some(0),
            write_timeout_millis: Some(0),
            response_timeout_millis: Some(0),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout_millis.map_or(DEFAULT_TIMEOUT, duration_from_millis)
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout_millis.map_or(DEFAULT_TIMEOUT, duration_from_millis)
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout_millis.map_or(DEFAULT_TIMEOUT, duration_from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Upper bound on bytes handed to a sink in one call; unset means whole
    /// buffers.
    #[serde(default)]
    pub max_bytes_per_write: Option<usize>,
}

fn default_chunk_size() -> usize {
    crate::file_source::DEFAULT_CHUNK_SIZE
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_bytes_per_write: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl TransportConfig {
    pub fn from_file(path: &str) -> Result<Self, TransportError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TransportError::Config(format!("Failed to read {}: {}", path, e)))?;
        serde_json::from_str(&content)
            .map_err(|e| TransportError::Config(format!("Failed to parse {}: {}", path, e)))
    }

    pub fn to_file(&self, path: &str) -> Result<(), TransportError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| TransportError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
