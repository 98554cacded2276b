//! Storage configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sitestore_resilience::{CircuitBreakerOptions, RetryOptions};
use sitestore_storage::DEFAULT_KV_QUOTA_BYTES;
use sitestore_types::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the primary database file
    pub database_path: PathBuf,
    /// Directory holding the legacy key-value files
    pub legacy_dir: PathBuf,
    /// Try the primary engine at all
    pub primary_enabled: bool,
    /// Copy legacy documents into the primary engine on first use
    pub migration_enabled: bool,
    pub primary_quota_bytes: Option<u64>,
    pub legacy_quota_bytes: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    /// `None` disables the breaker
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn options(&self) -> CircuitBreakerOptions {
        CircuitBreakerOptions::default()
            .with_failure_threshold(self.failure_threshold)
            .with_reset_timeout(Duration::from_millis(self.reset_timeout_ms))
    }
}

impl Config {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            database_path: data_dir.join("sitestore.db"),
            legacy_dir: data_dir.join("legacy"),
            primary_enabled: true,
            migration_enabled: true,
            primary_quota_bytes: None,
            legacy_quota_bytes: DEFAULT_KV_QUOTA_BYTES,
            retry_max_attempts: 3,
            retry_initial_delay_ms: 100,
            circuit_breaker: Some(CircuitBreakerConfig::default()),
        }
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("Sitestore"))
            .unwrap_or_else(|| PathBuf::from(".sitestore"))
    }

    /// Read a JSON config file. Missing keys take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::config(format!("Cannot read config {}: {}", path.display(), e)).with_cause(e)
        })?;

        serde_json::from_str(&raw).map_err(|e| {
            AppError::config(format!("Invalid config {}: {}", path.display(), e)).with_cause(e)
        })
    }

    /// Retry policy for primary transactions.
    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions::storage_transaction()
            .with_max_attempts(self.retry_max_attempts)
            .with_initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        }
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
        }
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local/share"))
                })
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitestore_types::ErrorCode;

    #[test]
    fn test_paths_derive_from_data_dir() {
        let config = Config::new(PathBuf::from("/data"));
        assert_eq!(config.database_path, PathBuf::from("/data/sitestore.db"));
        assert_eq!(config.legacy_dir, PathBuf::from("/data/legacy"));
        assert_eq!(config.legacy_quota_bytes, 5 * 1024 * 1024);
        assert_eq!(config.circuit_breaker, Some(CircuitBreakerConfig::default()));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sitestore.json");
        std::fs::write(
            &path,
            r#"{
                "database_path": "/tmp/x.db",
                "migration_enabled": false,
                "circuit_breaker": null
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
        assert!(!config.migration_enabled);
        assert!(config.primary_enabled);
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.circuit_breaker, None);
    }

    #[test]
    fn test_load_failures_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();

        let missing = Config::load(dir.path().join("absent.json")).unwrap_err();
        assert_eq!(missing.code(), ErrorCode::ConfigError);

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ nope").unwrap();
        let broken = Config::load(&path).unwrap_err();
        assert_eq!(broken.code(), ErrorCode::ConfigError);
        assert!(broken.cause().is_some());
    }

    #[test]
    fn test_retry_options_follow_config() {
        let mut config = Config::new(PathBuf::from("/data"));
        config.retry_max_attempts = 7;
        config.retry_initial_delay_ms = 25;

        let options = config.retry_options();
        assert_eq!(options.max_attempts, 7);
        assert_eq!(options.initial_delay, Duration::from_millis(25));
    }
}
