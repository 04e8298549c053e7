//! Run-wide configuration
//!
//! Loaded once per invocation from three layers, later layers winning:
//! built-in defaults, an optional YAML file (`goss_config.yaml`) and
//! environment variables prefixed with `GOSS_` (`__` separates nesting, e.g.
//! `GOSS_EXECUTION__MAX_WORKERS=8`). The result is validated before any host
//! is contacted.

use crate::error::{GossError, Result};
use crate::retry::RetryConfig;
use config::{Config, Environment, File, FileFormat};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "goss_config.yaml";
pub const MAX_WORKERS_LIMIT: usize = 1024;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Host key verification policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Accept any key (debugging only)
    Permissive,
    /// Ask before trusting unknown or changed keys
    #[default]
    Interactive,
    /// Only keys already in the trust file
    Strict,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityMode::Permissive => write!(f, "permissive"),
            SecurityMode::Interactive => write!(f, "interactive"),
            SecurityMode::Strict => write!(f, "strict"),
        }
    }
}

impl SecurityMode {
    fn from_number(n: i64) -> Option<Self> {
        match n {
            0 => Some(SecurityMode::Permissive),
            1 => Some(SecurityMode::Interactive),
            2 => Some(SecurityMode::Strict),
            _ => None,
        }
    }
}

// Accepts both the numeric form (0/1/2) and the names.
impl<'de> Deserialize<'de> for SecurityMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ModeVisitor;

        impl<'de> Visitor<'de> for ModeVisitor {
            type Value = SecurityMode;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("0, 1, 2, permissive, interactive or strict")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<SecurityMode, E> {
                SecurityMode::from_number(v)
                    .ok_or_else(|| E::custom(format!("invalid security_mode {}", v)))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<SecurityMode, E> {
                let n = i64::try_from(v).map_err(|_| E::custom("security_mode out of range"))?;
                self.visit_i64(n)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<SecurityMode, E> {
                match v.trim().to_ascii_lowercase().as_str() {
                    "permissive" => Ok(SecurityMode::Permissive),
                    "interactive" => Ok(SecurityMode::Interactive),
                    "strict" => Ok(SecurityMode::Strict),
                    other => match other.parse::<i64>() {
                        Ok(n) => self.visit_i64(n),
                        Err(_) => Err(E::custom(format!("invalid security_mode '{}'", v))),
                    },
                }
            }
        }

        deserializer.deserialize_any(ModeVisitor)
    }
}

/// What to do when a transfer destination already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    #[default]
    Always,
    Never,
}

impl fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverwritePolicy::Always => write!(f, "always"),
            OverwritePolicy::Never => write!(f, "never"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_port")]
    pub default_port: u16,
    /// Seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default)]
    pub security_mode: SecurityMode,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            connect_timeout: default_connect_timeout(),
            security_mode: SecurityMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Seconds
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,
    #[serde(default)]
    pub stop_on_error: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            task_timeout: default_task_timeout(),
            stop_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileTransferConfig {
    #[serde(default = "default_upload_dir")]
    pub default_upload_dir: String,
    #[serde(default = "default_download_dir")]
    pub default_download_dir: String,
    #[serde(default)]
    pub overwrite_policy: OverwritePolicy,
    /// Seconds, per attempt
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        Self {
            default_upload_dir: default_upload_dir(),
            default_download_dir: default_download_dir(),
            overwrite_policy: OverwritePolicy::default(),
            transfer_timeout: default_transfer_timeout(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    3
}

fn default_max_workers() -> usize {
    1
}

fn default_task_timeout() -> u64 {
    120
}

fn default_upload_dir() -> String {
    "/tmp".to_string()
}

fn default_download_dir() -> String {
    "./downloads/".to_string()
}

fn default_transfer_timeout() -> u64 {
    1800
}

fn default_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

/// Run-wide policy, read-only for the duration of a run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GossConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub file_transfer: FileTransferConfig,
}

impl GossConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connect_timeout)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.task_timeout)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.file_transfer.transfer_timeout)
    }

    /// Retry policy for uploads and downloads
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.file_transfer.retries,
            Duration::from_millis(self.file_transfer.retry_backoff_ms),
            MAX_RETRY_DELAY,
        )
    }

    /// Check every field; the first violation wins
    pub fn validate(&self) -> Result<()> {
        if self.connection.default_port == 0 {
            return Err(invalid("connection.default_port must be between 1 and 65535"));
        }
        if self.connection.connect_timeout == 0 {
            return Err(invalid("connection.connect_timeout must be a positive integer"));
        }
        if self.execution.max_workers == 0 || self.execution.max_workers > MAX_WORKERS_LIMIT {
            return Err(invalid(format!(
                "execution.max_workers must be between 1 and {}",
                MAX_WORKERS_LIMIT
            ))
            .with_detail("max_workers", self.execution.max_workers));
        }
        if self.execution.task_timeout == 0 {
            return Err(invalid("execution.task_timeout must be a positive integer"));
        }
        if self.file_transfer.default_upload_dir.trim().is_empty() {
            return Err(invalid("file_transfer.default_upload_dir must not be empty"));
        }
        if self.file_transfer.default_download_dir.trim().is_empty() {
            return Err(invalid("file_transfer.default_download_dir must not be empty"));
        }
        if self.file_transfer.transfer_timeout == 0 {
            return Err(invalid("file_transfer.transfer_timeout must be a positive integer"));
        }
        if self.file_transfer.retries == 0 {
            return Err(invalid("file_transfer.retries must be a positive integer"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> GossError {
    GossError::configuration(message).with_detail("file", DEFAULT_CONFIG_FILE)
}

/// Load configuration from defaults, an optional file and the environment
///
/// A missing file is not an error; a present but malformed one is.
///
/// # Errors
///
/// Returns a `Configuration` error if a layer cannot be parsed or the merged
/// result fails validation.
pub fn load_config(path: Option<&Path>) -> Result<GossConfig> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(false));
    }
    builder = builder.add_source(
        Environment::with_prefix("GOSS")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let config: GossConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Parse configuration from a YAML string (defaults fill missing fields)
pub fn parse_config_yaml(content: &str) -> Result<GossConfig> {
    let config: GossConfig = Config::builder()
        .add_source(File::from_str(content, FileFormat::Yaml))
        .build()?
        .try_deserialize()?;
    config.validate()?;
    Ok(config)
}
