//! TOML configuration for the query engine.
//!
//! Looked up at `<config dir>/pgrquery/config.toml`; every key is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::db::{ConnectionConfig, PoolOptions};
use crate::executor::ExecutorOptions;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub slow_query_threshold_ms: u64,
    pub log_slow_queries: bool,
    pub connection: ConnectionConfig,
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: 1000,
            log_slow_queries: true,
            connection: ConnectionConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            acquire_timeout_ms: 5000,
        }
    }
}

impl EngineConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pgrquery").join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load the default config file, falling back to defaults when it is
    /// absent.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Connection settings with the password filled from `PGPASSWORD` when the
    /// file leaves it empty.
    pub fn resolved_connection(&self) -> ConnectionConfig {
        let mut connection = self.connection.clone();
        if connection.password.is_empty() {
            if let Ok(pw) = std::env::var("PGPASSWORD") {
                connection.password = pw;
            }
        }
        connection
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            size: self.pool.size,
            acquire_timeout: Duration::from_millis(self.pool.acquire_timeout_ms),
        }
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            retry: self.retry.clone(),
            slow_query_threshold: Duration::from_millis(self.slow_query_threshold_ms),
            log_slow_queries: self.log_slow_queries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SslMode;
    use crate::error::EngineErrorKind;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            slow_query_threshold_ms = 250

            [connection]
            host = "db.internal"
            ssl_mode = "verify-full"

            [retry]
            max_retries = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.slow_query_threshold_ms, 250);
        assert!(config.log_slow_queries);
        assert_eq!(config.connection.host, "db.internal");
        assert_eq!(config.connection.port, 5432);
        assert_eq!(config.connection.ssl_mode, SslMode::VerifyFull);
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.retry.max_retries, 5);
        assert!(config.retry.is_retryable(EngineErrorKind::Io));

        let options = config.executor_options();
        assert_eq!(options.slow_query_threshold, Duration::from_millis(250));
        assert_eq!(options.retry.max_retries, 5);
        assert_eq!(config.pool_options().acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = EngineConfig::default();
        config.pool.size = 8;
        config.connection.database = "analytics".into();
        config.connection.password = "secret".into();
        config.save(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("secret"));

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.pool.size, 8);
        assert_eq!(loaded.connection.database, "analytics");
        assert!(loaded.connection.password.is_empty());
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "pool = 3").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("config.toml"));
    }
}
