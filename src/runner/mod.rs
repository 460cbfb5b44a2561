//! External command execution seam.
//!
//! Everything the crate does against the outside world (the provider CLI,
//! the `ssh` client, `ping`) goes through a [`CommandRunner`]. The real
//! implementation spawns processes with `tokio::process`; tests swap in
//! [`crate::test_support::ScriptedRunner`] so no process is ever started.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// Host variables passed through to isolated local commands.
pub const LOCAL_PASSTHROUGH_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TMPDIR",
    "SSH_AUTH_SOCK",
    "AZURE_CONFIG_DIR",
    "AZURE_CORE_OUTPUT",
];

/// Environment handed to a spawned process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandEnv {
    /// Inherit the calling process environment unchanged.
    Inherit,
    /// Start from an empty environment and set exactly these variables.
    Isolated {
        /// Variables visible to the child process.
        vars: BTreeMap<String, String>,
    },
}

impl CommandEnv {
    /// Builds an isolated environment containing only the named host
    /// variables that are currently set.
    #[must_use]
    pub fn passthrough(keys: &[&str]) -> Self {
        let vars = keys
            .iter()
            .filter_map(|key| env::var(key).ok().map(|value| ((*key).to_owned(), value)))
            .collect();
        Self::Isolated { vars }
    }
}

/// Fully described process invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments passed verbatim.
    pub args: Vec<OsString>,
    /// Environment policy for the child.
    pub env: CommandEnv,
    /// Upper bound on the run time; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Creates a spec that inherits the environment and has no timeout.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
            env: CommandEnv::Inherit,
            timeout: None,
        }
    }

    /// Runs `command` through `sh -c`.
    #[must_use]
    pub fn shell(command: &str) -> Self {
        Self::new("sh", vec![OsString::from("-c"), OsString::from(command)])
    }

    /// Replaces the environment policy.
    #[must_use]
    pub fn with_env(mut self, env: CommandEnv) -> Self {
        self.env = env;
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Returns a shell-like rendering for logs and assertions.
    #[must_use]
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Renders the exit status for error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised before a command produced an exit status.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command exceeded its timeout and was killed.
    #[error("{program} timed out after {} seconds", limit.as_secs())]
    Timeout {
        /// Command that was killed.
        program: String,
        /// Timeout that expired.
        limit: Duration,
    },
}

/// Future returned by [`CommandRunner::run`].
pub type RunnerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<CommandOutput, RunnerError>> + Send + 'a>>;

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `spec`, capturing stdout and stderr.
    ///
    /// A command that outlives `spec.timeout` is killed and reported as
    /// [`RunnerError::Timeout`].
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for std::sync::Arc<R> {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a> {
        (**self).run(spec)
    }
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a> {
        Box::pin(async move {
            let mut command = Command::new(&spec.program);
            command
                .args(&spec.args)
                .stdin(Stdio::null())
                .kill_on_drop(true);
            if let CommandEnv::Isolated { vars } = &spec.env {
                command.env_clear().envs(vars);
            }

            let pending = command.output();
            let result = match spec.timeout {
                Some(limit) => timeout(limit, pending)
                    .await
                    .map_err(|_| RunnerError::Timeout {
                        program: spec.program.clone(),
                        limit,
                    })?,
                None => pending.await,
            };

            let output = result.map_err(|err| RunnerError::Spawn {
                program: spec.program.clone(),
                message: err.to_string(),
            })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}
