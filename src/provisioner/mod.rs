//! Provisioner abstraction for creating and destroying disposable nodes.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::request::{ProvisionRequest, RequestError};
use crate::resource::ResourceHandle;
use crate::runner::{CommandOutput, RunnerError};

mod azure;

pub use azure::AzureProvisioner;

/// Result of a destruction request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DestroyOutcome {
    /// The provider accepted the deletion (it may complete asynchronously).
    Requested,
    /// The provider reported the resource was already gone.
    AlreadyGone,
}

/// Errors raised by provisioners.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// Raised when the request is malformed.
    #[error(transparent)]
    Validation(#[from] RequestError),
    /// Raised when the provider CLI is missing or not logged in.
    #[error("provider CLI preflight failed: {0}")]
    Preflight(String),
    /// Raised when a provider CLI call exits unsuccessfully; `stderr` carries
    /// the tool's diagnostic output verbatim.
    #[error("{program} {step} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Program that failed (typically `az`).
        program: String,
        /// Provisioning step being performed.
        step: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when provider output cannot be interpreted.
    #[error("failed to parse {step} output: {message}")]
    Parse {
        /// Provisioning step whose output was being parsed.
        step: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when the provider CLI could not be run at all.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Future returned by provisioner operations.
pub type ProvisionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProvisionError>> + Send + 'a>>;

/// Minimal interface implemented by cloud provisioners.
pub trait Provisioner: Send + Sync {
    /// Creates a node for `request` and returns its handle.
    ///
    /// Implementations do not write to the provisioning cache.
    fn provision<'a>(
        &'a self,
        request: &'a ProvisionRequest,
    ) -> ProvisionFuture<'a, ResourceHandle>;

    /// Requests destruction of everything created for `handle`.
    ///
    /// Destroying a node that no longer exists succeeds with
    /// [`DestroyOutcome::AlreadyGone`].
    fn destroy<'a>(&'a self, handle: &'a ResourceHandle) -> ProvisionFuture<'a, DestroyOutcome>;

    /// Fetches the node's serial console (boot diagnostics) log.
    fn boot_log<'a>(&'a self, handle: &'a ResourceHandle) -> ProvisionFuture<'a, CommandOutput>;

    /// Restarts the node through the provider's control plane.
    fn restart<'a>(&'a self, handle: &'a ResourceHandle) -> ProvisionFuture<'a, CommandOutput>;
}

impl<P: Provisioner + ?Sized> Provisioner for std::sync::Arc<P> {
    fn provision<'a>(
        &'a self,
        request: &'a ProvisionRequest,
    ) -> ProvisionFuture<'a, ResourceHandle> {
        (**self).provision(request)
    }

    fn destroy<'a>(&'a self, handle: &'a ResourceHandle) -> ProvisionFuture<'a, DestroyOutcome> {
        (**self).destroy(handle)
    }

    fn boot_log<'a>(&'a self, handle: &'a ResourceHandle) -> ProvisionFuture<'a, CommandOutput> {
        (**self).boot_log(handle)
    }

    fn restart<'a>(&'a self, handle: &'a ResourceHandle) -> ProvisionFuture<'a, CommandOutput> {
        (**self).restart(handle)
    }
}
