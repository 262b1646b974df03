//! Configuration for packing, ignore-rule loading and snapshot transfer
//!
//! All tunables live here so that callers never depend on hard-coded
//! constants. A `VeghConfig` is usually loaded from a TOML file; every field
//! has a default so partial files are valid.

use crate::{Result, SnapError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use vegh_retry::RetryPolicy;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VeghConfig {
    #[serde(default)]
    pub pack: PackConfig,
    #[serde(default)]
    pub ignore: IgnoreConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Settings for `snap`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackConfig {
    /// Gzip level, 0 (store) to 9 (best)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Collect dot-files and dot-directories
    #[serde(default)]
    pub include_hidden: bool,

    /// Worker threads used while walking the source tree
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Author recorded in the metadata block (defaults to `$USER`)
    #[serde(default)]
    pub author: Option<String>,
}

/// Which ignore sources are consulted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IgnoreConfig {
    /// Use .gitignore patterns (default: true)
    #[serde(default = "default_true")]
    pub use_gitignore: bool,

    /// Use .veghignore patterns (default: true)
    #[serde(default = "default_true")]
    pub use_veghignore: bool,

    /// Additional patterns, applied after both ignore files
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

/// Settings for `send`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Archives at or above this size are always chunked
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Chunks in flight at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound for the whole transfer
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Upper bound for a single request, response body included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> u32 {
    6
}

fn default_workers() -> usize {
    num_cpus::get().max(1)
}

fn default_chunk_size() -> u64 {
    8 * 1024 * 1024
}

fn default_chunk_threshold() -> u64 {
    32 * 1024 * 1024
}

fn default_max_attempts() -> usize {
    5
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_concurrency() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
            include_hidden: false,
            workers: default_workers(),
            author: None,
        }
    }
}

impl Default for IgnoreConfig {
    fn default() -> Self {
        Self {
            use_gitignore: true,
            use_veghignore: true,
            extra_patterns: vec![],
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_threshold: default_chunk_threshold(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl VeghConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| SnapError::resource(path, e))?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: VeghConfig = toml::from_str(content)
            .map_err(|e| SnapError::configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.pack.validate()?;
        self.transfer.validate()
    }
}

impl PackConfig {
    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(SnapError::configuration(format!(
                "compression level must be 0-9, got {}",
                self.compression_level
            )));
        }
        if self.workers == 0 {
            return Err(SnapError::configuration("workers must be at least 1"));
        }
        Ok(())
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SnapError::configuration("chunk_size must be greater than zero"));
        }
        if self.max_attempts == 0 {
            return Err(SnapError::configuration("max_attempts must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(SnapError::configuration("concurrency must be at least 1"));
        }
        if self.timeout_secs == 0 {
            return Err(SnapError::configuration("timeout_secs must be greater than zero"));
        }
        if self.request_timeout_secs == 0 {
            return Err(SnapError::configuration(
                "request_timeout_secs must be greater than zero",
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(SnapError::configuration(
                "initial_backoff_ms cannot exceed max_backoff_ms",
            ));
        }
        Ok(())
    }

    /// Retry policy applied to every request of a transfer
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VeghConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pack.compression_level, 6);
        assert!(!config.pack.include_hidden);
        assert!(config.ignore.use_gitignore);
        assert!(config.ignore.use_veghignore);
        assert_eq!(config.transfer.chunk_size, 8 * 1024 * 1024);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = VeghConfig::from_toml(
            r#"
            [transfer]
            chunk_size = 1024
            max_attempts = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.transfer.chunk_size, 1024);
        assert_eq!(config.transfer.max_attempts, 2);
        assert_eq!(config.transfer.concurrency, 4);
        assert_eq!(config.transfer.request_timeout(), Duration::from_secs(120));
        assert_eq!(config.pack, PackConfig::default());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = VeghConfig::from_toml("[transfer]\nchunk_size = 0\n").unwrap_err();
        assert!(matches!(err, SnapError::Configuration(_)));

        let err = VeghConfig::from_toml("[pack]\ncompression_level = 12\n").unwrap_err();
        assert!(err.to_string().contains("0-9"));

        let err = VeghConfig::from_toml("[transfer]\nrequest_timeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("request_timeout_secs"));
    }

    #[test]
    fn test_malformed_toml_is_configuration_error() {
        let err = VeghConfig::from_toml("[transfer\nchunk_size = ").unwrap_err();
        assert!(matches!(err, SnapError::Configuration(_)));
    }

    #[test]
    fn test_retry_policy_from_transfer_config() {
        let transfer = TransferConfig {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            ..TransferConfig::default()
        };
        let policy = transfer.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, Duration::from_millis(10));
        assert_eq!(policy.max_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_from_missing_file_is_resource_error() {
        let err = VeghConfig::from_file("/definitely/not/here/vegh.toml").unwrap_err();
        assert!(matches!(err, SnapError::Resource { .. }));
    }
}
