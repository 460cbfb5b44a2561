//! Session-wide settings loaded via `ortho-config`.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;

use crate::cache::DEFAULT_CACHE_PATH;
use crate::config::ConfigError;
use crate::retry::RetryPolicy;

/// Settings shared by every scope in a test session.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "NODEKEEPER",
    discovery(
        app_name = "nodekeeper",
        env_var = "NODEKEEPER_CONFIG_PATH",
        config_file_name = "nodekeeper.toml",
        dotfile_name = ".nodekeeper.toml",
        project_file_name = "nodekeeper.toml"
    )
)]
pub struct SessionConfig {
    /// Location of the provisioning cache file.
    #[ortho_config(default = DEFAULT_CACHE_PATH.to_owned())]
    pub cache_path: String,
    /// Keep nodes running (and cached) after the session ends. Unset means
    /// `false`; left optional so file and environment values are not masked
    /// by the command-line layer.
    pub keep_resources: Option<bool>,
    /// Attempts made for retried operations (connect, ping, boot log).
    #[ortho_config(default = 3)]
    pub connect_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[ortho_config(default = 1000)]
    pub retry_initial_delay_ms: u64,
    /// Cap on any retry delay, in milliseconds.
    #[ortho_config(default = 10_000)]
    pub retry_max_delay_ms: u64,
    /// How often to re-check a provisioning lock held by another process,
    /// in milliseconds.
    #[ortho_config(default = 500)]
    pub lock_poll_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_path: DEFAULT_CACHE_PATH.to_owned(),
            keep_resources: None,
            connect_attempts: 3,
            retry_initial_delay_ms: 1000,
            retry_max_delay_ms: 10_000,
            lock_poll_interval_ms: 500,
        }
    }
}

impl SessionConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("nodekeeper")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the cache path is blank.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_path.trim().is_empty() {
            return Err(ConfigError::MissingField(String::from(
                "missing cache path: set NODEKEEPER_CACHE_PATH or add cache_path to nodekeeper.toml",
            )));
        }
        Ok(())
    }

    /// Returns whether nodes outlive the session.
    #[must_use]
    pub const fn keep_resources(&self) -> bool {
        matches!(self.keep_resources, Some(true))
    }

    /// Returns the cache path.
    #[must_use]
    pub fn cache_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.cache_path)
    }

    /// Returns the retry policy for transient failures.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_attempts,
            Duration::from_millis(self.retry_initial_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
    }

    /// Returns the poll interval for cross-process provisioning locks.
    #[must_use]
    pub const fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }
}
