//! TOML configuration for a migrate run.
//!
//! ```toml
//! [database]
//! url = "${DATABASE_URL}"
//!
//! [migrations]
//! dir = "migrations"
//!
//! [retry]
//! max_attempts = 10
//! backoff_ms = 1000
//!
//! [lock]
//! poll_interval_ms = 1000
//! # dir = "/run/app"          (defaults to the system temp dir)
//! # wait_timeout_ms = 600000  (defaults to waiting forever)
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::ConnectionTarget;
use crate::errors::{MigrateError, MigrateResult};
use crate::lock::ParentProcessLockName;
use crate::retry::RetryPolicy;

/// Environment variable consulted when no database URL is configured.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrateConfig {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub migrations: MigrationsSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub lock: LockSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    format!("${{{DATABASE_URL_ENV}}}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationsSettings {
    #[serde(default = "default_migrations_dir")]
    pub dir: PathBuf,
}

impl Default for MigrationsSettings {
    fn default() -> Self {
        Self {
            dir: default_migrations_dir(),
        }
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    crate::retry::DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_ms() -> u64 {
    crate::retry::DEFAULT_BACKOFF.as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_timeout_ms: Option<u64>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            dir: None,
            poll_interval_ms: default_poll_interval_ms(),
            wait_timeout_ms: None,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    crate::coordinator::DEFAULT_POLL_INTERVAL.as_millis() as u64
}

impl MigrateConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> MigrateResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| MigrateError::config(format!("failed to read {}: {err}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> MigrateResult<Self> {
        toml::from_str(content).map_err(|err| MigrateError::config(format!("failed to parse config: {err}")))
    }

    /// Database URL with `${VAR}` expanded from the environment.
    pub fn database_target(&self) -> MigrateResult<ConnectionTarget> {
        let url = self.database.url.trim();

        let resolved = if let Some(var_name) = url.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
            std::env::var(var_name)
                .map_err(|_| MigrateError::config(format!("environment variable {var_name} not set")))?
        } else {
            url.to_string()
        };

        if resolved.trim().is_empty() {
            return Err(MigrateError::config("database url is empty"));
        }

        Ok(ConnectionTarget::new(resolved))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.max_attempts, Duration::from_millis(self.retry.backoff_ms))
    }

    pub fn lock_naming(&self) -> ParentProcessLockName {
        match &self.lock.dir {
            Some(dir) => ParentProcessLockName::in_dir(dir),
            None => ParentProcessLockName::new(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock.poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.lock.wait_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = MigrateConfig::default();
        assert_eq!(config.database.url, "${DATABASE_URL}");
        assert_eq!(config.migrations.dir, PathBuf::from("migrations"));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.wait_timeout(), None);
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = MigrateConfig::from_toml("").unwrap();
        assert_eq!(config, MigrateConfig::default());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = MigrateConfig::from_toml(
            r#"
            [database]
            url = "redis://cache:6379/2"

            [retry]
            max_attempts = 3

            [lock]
            dir = "/run/app"
            wait_timeout_ms = 5000
            "#,
        )
        .unwrap();

        assert_eq!(config.database_target().unwrap().as_str(), "redis://cache:6379/2");
        assert_eq!(config.retry_policy(), RetryPolicy::new(3, Duration::from_secs(1)));
        assert_eq!(config.lock_naming().path_for(7), PathBuf::from("/run/app/migrations.lock.7"));
        assert_eq!(config.wait_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = MigrateConfig::from_toml("[retry]\nmax_attempts = \"many\"").unwrap_err();
        assert!(matches!(err, MigrateError::Config { .. }));
    }

    #[test]
    fn test_config_serialization() {
        let config = MigrateConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("max_attempts"));
        assert!(toml_str.contains("poll_interval_ms"));
        assert!(!toml_str.contains("wait_timeout_ms"));
    }

    #[test]
    #[serial]
    fn test_database_url_expands_environment() {
        unsafe { std::env::set_var("STARTUP_MIGRATIONS_TEST_URL", "redis://from-env/") };
        let mut config = MigrateConfig::default();
        config.database.url = "${STARTUP_MIGRATIONS_TEST_URL}".to_string();

        assert_eq!(config.database_target().unwrap().as_str(), "redis://from-env/");
        unsafe { std::env::remove_var("STARTUP_MIGRATIONS_TEST_URL") };
    }

    #[test]
    #[serial]
    fn test_database_url_missing_variable() {
        unsafe { std::env::remove_var("STARTUP_MIGRATIONS_TEST_MISSING") };
        let mut config = MigrateConfig::default();
        config.database.url = "${STARTUP_MIGRATIONS_TEST_MISSING}".to_string();

        let err = config.database_target().unwrap_err();
        assert!(err.to_string().contains("STARTUP_MIGRATIONS_TEST_MISSING"));
    }
}
