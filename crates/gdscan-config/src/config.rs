//! Scan configuration structures

use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable selecting the device backend
pub const ENV_BACKEND: &str = "GDSCAN_BACKEND";
/// Environment variable for the read idle timeout in milliseconds
pub const ENV_IDLE_TIMEOUT_MS: &str = "GDSCAN_IDLE_TIMEOUT_MS";
/// Environment variable for the fence timeout in milliseconds
pub const ENV_FENCE_TIMEOUT_MS: &str = "GDSCAN_FENCE_TIMEOUT_MS";
/// Environment variable for the per-file size limit in bytes
pub const ENV_MAX_FILE_SIZE: &str = "GDSCAN_MAX_FILE_SIZE";
/// Environment variable for the log level
pub const ENV_LOG_LEVEL: &str = "GDSCAN_LOG_LEVEL";
/// Environment variable toggling case-insensitive matching
pub const ENV_CASE_INSENSITIVE: &str = "GDSCAN_CASE_INSENSITIVE";

/// Top-level scan configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Device selection
    pub device: DeviceSection,
    /// Ingestion pipeline limits
    pub pipeline: PipelineSection,
    /// Pattern matching
    pub matching: MatchingSection,
    /// Logging
    pub logging: LoggingSection,
}

impl ScanConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize configuration to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `GDSCAN_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply `GDSCAN_*` overrides from an arbitrary variable source
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BACKEND) {
            self.device.backend = value.parse()?;
        }
        if let Some(value) = lookup(ENV_IDLE_TIMEOUT_MS) {
            self.pipeline.idle_timeout_ms = parse_env(ENV_IDLE_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_FENCE_TIMEOUT_MS) {
            self.pipeline.fence_timeout_ms = parse_env(ENV_FENCE_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_FILE_SIZE) {
            self.pipeline.max_file_size = parse_env(ENV_MAX_FILE_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = value.parse()?;
        }
        if let Some(value) = lookup(ENV_CASE_INSENSITIVE) {
            self.matching.case_insensitive = parse_bool(ENV_CASE_INSENSITIVE, &value)?;
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::EnvVar(format!("{}: cannot parse {:?}", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::EnvVar(format!(
            "{}: expected a boolean, got {:?}",
            key, value
        ))),
    }
}

/// Device backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process simulated device
    #[default]
    Sim,
    /// NVIDIA GPU through the CUDA driver API
    Cuda,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sim => write!(f, "sim"),
            BackendKind::Cuda => write!(f, "cuda"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sim" => Ok(BackendKind::Sim),
            "cuda" => Ok(BackendKind::Cuda),
            other => Err(ConfigError::InvalidValue {
                field: "device.backend".to_string(),
                message: format!("unknown backend '{}', expected sim or cuda", other),
            }),
        }
    }
}

/// Command queue priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    Low,
    #[default]
    Normal,
    High,
}

/// `[device]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub backend: BackendKind,
    /// Device ordinal
    pub ordinal: u32,
    pub priority: PriorityLevel,
}

/// `[pipeline]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Bound on waiting for the bulk read queue to drain
    pub idle_timeout_ms: u64,
    /// Bound on waiting for a copy fence
    pub fence_timeout_ms: u64,
    /// Files larger than this are rejected before allocation
    pub max_file_size: u64,
    /// Consecutive allocation failures before the batch is flagged as resource exhausted
    pub allocation_escalation_threshold: u32,
    /// Consecutive execution failures before the device is revalidated
    pub execution_revalidate_threshold: u32,
}

impl PipelineSection {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            fence_timeout_ms: 10_000,
            max_file_size: 1 << 32,
            allocation_escalation_threshold: 3,
            execution_revalidate_threshold: 2,
        }
    }
}

/// How the scan pattern is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternMode {
    #[default]
    Regex,
    Literal,
}

/// `[matching]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSection {
    pub mode: PatternMode,
    pub case_insensitive: bool,
}

/// Log levels compatible with tracing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                message: format!("invalid log level: {}", s),
            }),
        }
    }
}

/// Output format for logs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// `[logging]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: LogLevel,
    pub format: LogFormat,
}
