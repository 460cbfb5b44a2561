//! The live node handed to test cases.

use std::sync::Arc;
use std::time::Duration;

use shell_escape::unix::escape;
use thiserror::Error;

use crate::broker::{BrokerError, CommandResult, Session, Target};
use crate::provisioner::{ProvisionError, Provisioner};
use crate::resource::ResourceHandle;
use crate::retry::{RetryPolicy, with_retry};
use crate::runner::CommandRunner;

/// Errors raised by [`Node`] helpers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NodeError {
    /// Raised when the command channel fails.
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// Raised when a provider operation fails.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    /// Raised when a helper command exits unsuccessfully.
    #[error("`{command}` exited with status {status_text}: {stderr}")]
    CommandFailed {
        /// Command that failed.
        command: String,
        /// Human readable exit status.
        status_text: String,
        /// Captured standard error.
        stderr: String,
    },
}

/// A provisioned node with an open session.
///
/// Shared between test cases through an `Arc`; commands are not
/// serialised, so overlapping commands interleave on the node.
#[derive(Debug)]
pub struct Node<P: Provisioner, R: CommandRunner> {
    session: Session<R>,
    provisioner: Arc<P>,
    retry: RetryPolicy,
    ping_bin: String,
}

impl<P: Provisioner, R: CommandRunner> Node<P, R> {
    pub(crate) const fn new(
        session: Session<R>,
        provisioner: Arc<P>,
        retry: RetryPolicy,
        ping_bin: String,
    ) -> Self {
        Self {
            session,
            provisioner,
            retry,
            ping_bin,
        }
    }

    /// Returns the handle of the underlying resource.
    #[must_use]
    pub const fn handle(&self) -> &ResourceHandle {
        self.session.handle()
    }

    /// Returns the command session.
    #[must_use]
    pub const fn session(&self) -> &Session<R> {
        &self.session
    }

    /// Runs `command` on the node.
    ///
    /// # Errors
    ///
    /// See [`Session::run`].
    pub async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, BrokerError> {
        self.session.run(command, Target::Remote, timeout).await
    }

    /// Runs `command` on the control host.
    ///
    /// # Errors
    ///
    /// See [`Session::run`].
    pub async fn local(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, BrokerError> {
        self.session.run(command, Target::Local, timeout).await
    }

    /// Pings the node from the control host, retrying while it is
    /// unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unreachable`] when every attempt fails.
    pub async fn ping(&self) -> Result<(), BrokerError> {
        let host = &self.handle().host_address;
        let probe = format!(
            "{} -c 1 {}",
            escape(self.ping_bin.as_str().into()),
            escape(host.as_str().into())
        );
        let command = probe.as_str();
        with_retry(&self.retry, "ping", || async move {
            let result = self.local(command, None).await?;
            if result.is_success() {
                return Ok::<(), BrokerError>(());
            }
            Err(BrokerError::Unreachable {
                host: host.clone(),
                message: format!("{}{}", result.stdout, result.stderr)
                    .trim()
                    .to_owned(),
            })
        })
        .await
    }

    /// Fetches the node's boot diagnostics log, retrying transient
    /// provider failures.
    ///
    /// # Errors
    ///
    /// Returns the provider error of the final attempt.
    pub async fn boot_diagnostics(&self) -> Result<String, ProvisionError> {
        let handle = self.handle();
        with_retry(&self.retry, "boot diagnostics", || async move {
            self.provisioner
                .boot_log(handle)
                .await
                .map(|output| output.stdout)
        })
        .await
    }

    /// Restarts the node through the provider. Not retried.
    ///
    /// # Errors
    ///
    /// Returns the provider error.
    pub async fn platform_restart(&self) -> Result<(), ProvisionError> {
        self.provisioner.restart(self.handle()).await.map(|_| ())
    }

    /// Reads a file on the node and returns its trimmed contents.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::CommandFailed`] when `cat` fails, or the broker
    /// error when the command cannot run.
    pub async fn cat(&self, path: &str) -> Result<String, NodeError> {
        let command = format!("cat {}", escape(path.into()));
        let result = self.run(&command, None).await?;
        if !result.is_success() {
            return Err(NodeError::CommandFailed {
                command,
                status_text: result
                    .exit_code
                    .map_or_else(|| String::from("unknown"), |code| code.to_string()),
                stderr: result.stderr.trim().to_owned(),
            });
        }
        Ok(result.stdout.trim().to_owned())
    }
}
