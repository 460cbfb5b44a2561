//! Command execution sessions against provisioned nodes.
//!
//! [`Broker::open`] starts an `ssh` control master for a node and returns a
//! [`Session`]. Every remote command then runs as its own short-lived `ssh`
//! client multiplexed over that master, so killing a command on timeout
//! closes only that command's channel and the session stays usable.
//!
//! Local commands run through the same [`Session::run`] entry point with
//! [`Target::Local`]; they get an isolated environment rather than the
//! calling process's full environment.

use std::ffi::OsString;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::resource::ResourceHandle;
use crate::retry::{RetryPolicy, with_retry};
use crate::runner::{
    CommandEnv, CommandOutput, CommandRunner, CommandSpec, LOCAL_PASSTHROUGH_VARS,
    ProcessCommandRunner, RunnerError,
};

mod config;

pub use config::{ConnectionConfig, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_REMOTE_PATH};

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Where a command runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Target {
    /// On the control host, with an isolated environment.
    Local,
    /// On the node, over the session's SSH channel.
    Remote,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Outcome of a command that ran to completion.
///
/// Non-zero exits are results, not errors, so callers can assert on expected
/// failures.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandResult {
    /// Where the command ran.
    pub target: Target,
    /// Exit code, when the process reported one.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandResult {
    fn from_output(target: Target, output: CommandOutput) -> Self {
        Self {
            target,
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }

    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// Errors raised by the connection broker.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BrokerError {
    /// Raised when the connection configuration is unusable.
    #[error("invalid connection configuration: {0}")]
    InvalidConfig(String),
    /// Raised when the node cannot be reached; retried while opening.
    #[error("{host} is unreachable: {message}")]
    Unreachable {
        /// Address that was dialled.
        host: String,
        /// Diagnostic output from the failed attempt.
        message: String,
    },
    /// Raised when a command outlives its timeout and is killed.
    #[error("{target} command timed out after {} seconds: {command}", limit.as_secs())]
    Timeout {
        /// Where the command ran.
        target: Target,
        /// Command as supplied by the caller.
        command: String,
        /// Timeout that expired.
        limit: Duration,
    },
    /// Raised when a command could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command is issued on a closed session.
    #[error("session to {host} is closed")]
    Closed {
        /// Address of the node.
        host: String,
    },
}

/// Opens sessions against nodes.
#[derive(Debug)]
pub struct Broker<R: CommandRunner> {
    config: Arc<ConnectionConfig>,
    runner: Arc<R>,
    retry: RetryPolicy,
}

impl Broker<ProcessCommandRunner> {
    /// Creates a broker that spawns real `ssh` processes.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: ConnectionConfig) -> Result<Self, BrokerError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> Broker<R> {
    /// Creates a broker using the provided configuration and runner.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidConfig`] when validation fails.
    pub fn new(config: ConnectionConfig, runner: R) -> Result<Self, BrokerError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            runner: Arc::new(runner),
            retry: RetryPolicy::default(),
        })
    }

    /// Replaces the retry policy applied while opening sessions.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the connection configuration.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Opens a session to `handle`, retrying while the node finishes
    /// booting.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt, typically
    /// [`BrokerError::Unreachable`].
    pub async fn open(&self, handle: &ResourceHandle) -> Result<Session<R>, BrokerError> {
        let control_path = format!(
            "{}/nk-{}",
            self.config.control_dir.trim_end_matches('/'),
            Uuid::new_v4().simple()
        );
        let session = Session {
            config: Arc::clone(&self.config),
            runner: Arc::clone(&self.runner),
            handle: handle.clone(),
            control_path,
            local_env: CommandEnv::passthrough(LOCAL_PASSTHROUGH_VARS),
            closed: AtomicBool::new(false),
        };

        let spec = session.master_spec();
        with_retry(&self.retry, "ssh connect", || session.start_master(&spec)).await?;
        info!(
            host = %handle.host_address,
            resource = %handle.resource_name,
            "session opened"
        );
        Ok(session)
    }
}

/// Open command channel to one node.
///
/// Sessions may be shared across tasks; commands are not serialised.
#[derive(Debug)]
pub struct Session<R: CommandRunner> {
    config: Arc<ConnectionConfig>,
    runner: Arc<R>,
    handle: ResourceHandle,
    control_path: String,
    local_env: CommandEnv,
    closed: AtomicBool,
}

impl<R: CommandRunner> Session<R> {
    /// Returns the handle of the node this session talks to.
    #[must_use]
    pub const fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    /// Returns `true` once [`Session::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs `command` on `target`.
    ///
    /// `timeout` overrides the configured default. A command that outlives
    /// it is killed; the session remains usable.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Timeout`] when the command is killed,
    /// [`BrokerError::Spawn`] when it cannot start, and
    /// [`BrokerError::Closed`] after [`Session::close`].
    pub async fn run(
        &self,
        command: &str,
        target: Target,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed {
                host: self.handle.host_address.clone(),
            });
        }

        let limit = timeout.unwrap_or_else(|| self.config.command_timeout());
        let spec = match target {
            Target::Local => CommandSpec::shell(command).with_env(self.local_env.clone()),
            Target::Remote => self.remote_spec(command),
        }
        .with_timeout(limit);

        debug!(%target, command, "running command");
        match self.runner.run(&spec).await {
            Ok(output) => Ok(CommandResult::from_output(target, output)),
            Err(RunnerError::Timeout { .. }) => Err(BrokerError::Timeout {
                target,
                command: command.to_owned(),
                limit,
            }),
            Err(RunnerError::Spawn { program, message }) => {
                Err(BrokerError::Spawn { program, message })
            }
        }
    }

    /// Closes the control master. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Spawn`] when `ssh` cannot be started.
    pub async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut args = self.control_options();
        args.extend([OsString::from("-O"), OsString::from("exit")]);
        args.push(OsString::from(self.destination()));
        let spec = CommandSpec::new(self.config.ssh_bin.clone(), args)
            .with_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS));

        let output = self.runner.run(&spec).await.map_err(|err| BrokerError::Spawn {
            program: self.config.ssh_bin.clone(),
            message: err.to_string(),
        })?;
        if output.is_success() {
            info!(host = %self.handle.host_address, "session closed");
        } else {
            // The master may already have exited with the node.
            debug!(
                host = %self.handle.host_address,
                stderr = %output.stderr.trim(),
                "control master exit reported failure"
            );
        }
        Ok(())
    }

    async fn start_master(&self, spec: &CommandSpec) -> Result<(), BrokerError> {
        let output = self.runner.run(spec).await.map_err(|err| BrokerError::Unreachable {
            host: self.handle.host_address.clone(),
            message: err.to_string(),
        })?;
        if output.is_success() {
            return Ok(());
        }
        Err(BrokerError::Unreachable {
            host: self.handle.host_address.clone(),
            message: output.stderr.trim().to_owned(),
        })
    }

    fn master_spec(&self) -> CommandSpec {
        let mut args = vec![
            OsString::from("-M"),
            OsString::from("-N"),
            OsString::from("-f"),
        ];
        args.extend(self.control_options());
        args.extend([
            OsString::from("-o"),
            OsString::from("ControlPersist=yes"),
            OsString::from("-o"),
            OsString::from(format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}")),
        ]);
        args.push(OsString::from(self.destination()));
        CommandSpec::new(self.config.ssh_bin.clone(), args)
            .with_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS * 2))
    }

    fn remote_spec(&self, command: &str) -> CommandSpec {
        let mut args = self.control_options();
        args.push(OsString::from(self.destination()));
        args.push(OsString::from(self.remote_command(command)));
        CommandSpec::new(self.config.ssh_bin.clone(), args)
    }

    fn remote_command(&self, command: &str) -> String {
        let path = escape(self.config.remote_path.as_str().into());
        format!("export PATH={path}; {command}")
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.config.ssh_user, self.handle.host_address)
    }

    fn control_options(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.handle.port.to_string()),
            OsString::from("-o"),
            OsString::from(format!("ControlPath={}", self.control_path)),
        ];

        if let Some(ref identity_file) = self.config.ssh_identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if self.config.ssh_batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.config.ssh_strict_host_key_checking.unwrap_or(false) {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.config.ssh_known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.config.ssh_known_hosts_file
            )));
        }

        args
    }
}

/// Expands a leading `~/` to `$HOME`; other paths are returned unchanged.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

#[cfg(test)]
mod tests;
