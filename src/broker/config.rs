//! SSH connection settings loaded via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;

use super::BrokerError;

/// Executable search path exported before every remote command.
pub const DEFAULT_REMOTE_PATH: &str = "/sbin:/usr/sbin:/usr/local/sbin:/bin:/usr/bin:/usr/local/bin";

/// Default upper bound on a single command, in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 1200;

/// SSH and command execution settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "NODEKEEPER_SSH",
    discovery(
        app_name = "nodekeeper",
        env_var = "NODEKEEPER_CONFIG_PATH",
        config_file_name = "nodekeeper.toml",
        dotfile_name = ".nodekeeper.toml",
        project_file_name = "nodekeeper.toml"
    )
)]
pub struct ConnectionConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "azureuser".to_owned())]
    pub ssh_user: String,
    /// Private key used for authentication; supports `~/` expansion. When
    /// unset, `ssh` falls back to its default key locations.
    pub ssh_identity_file: Option<String>,
    /// Whether to force batch mode so `ssh` never prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking; disabled when unset because
    /// every node is new.
    pub ssh_strict_host_key_checking: Option<bool>,
    /// Known hosts file override; `/dev/null` keeps throwaway host keys out
    /// of the user's file.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Directory holding `ssh` control sockets.
    #[ortho_config(default = "/tmp".to_owned())]
    pub control_dir: String,
    /// `PATH` exported before every remote command.
    #[ortho_config(default = DEFAULT_REMOTE_PATH.to_owned())]
    pub remote_path: String,
    /// Default command timeout in seconds.
    #[ortho_config(default = DEFAULT_COMMAND_TIMEOUT_SECS)]
    pub command_timeout_secs: u64,
    /// Path to the `ping` executable used for reachability probes.
    #[ortho_config(default = "ping".to_owned())]
    pub ping_bin: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            ssh_user: String::from("azureuser"),
            ssh_identity_file: None,
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: None,
            ssh_known_hosts_file: String::from("/dev/null"),
            control_dir: String::from("/tmp"),
            remote_path: DEFAULT_REMOTE_PATH.to_owned(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            ping_bin: String::from("ping"),
        }
    }
}

impl ConnectionConfig {
    /// Loads configuration from defaults, configuration files, and
    /// environment variables without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidConfig`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, BrokerError> {
        Self::load_from_iter([std::ffi::OsString::from("nodekeeper")])
            .map_err(|err| BrokerError::InvalidConfig(err.to_string()))
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidConfig`] naming the first blank field.
    pub fn validate(&self) -> Result<(), BrokerError> {
        for (field, value) in [
            ("ssh_bin", Some(self.ssh_bin.as_str())),
            ("ssh_user", Some(self.ssh_user.as_str())),
            ("control_dir", Some(self.control_dir.as_str())),
            ("remote_path", Some(self.remote_path.as_str())),
            ("ping_bin", Some(self.ping_bin.as_str())),
            ("ssh_identity_file", self.ssh_identity_file.as_deref()),
        ] {
            if value.is_some_and(|text| text.trim().is_empty()) {
                return Err(BrokerError::InvalidConfig(format!(
                    "{field} must not be empty (set NODEKEEPER_SSH_{})",
                    field.to_ascii_uppercase()
                )));
            }
        }
        if self.command_timeout_secs == 0 {
            return Err(BrokerError::InvalidConfig(String::from(
                "command_timeout_secs must be greater than zero",
            )));
        }
        Ok(())
    }

    /// Returns the default command timeout.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
