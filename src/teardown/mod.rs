//! Destruction of provisioned nodes at the end of a session.

use thiserror::Error;
use tracing::{error, info};

use crate::cache::{CacheError, ProvisionCache};
use crate::provisioner::{DestroyOutcome, ProvisionError, Provisioner};
use crate::request::RequestKey;
use crate::resource::ResourceHandle;

/// Decides whether a node survives the end of its session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RetentionPolicy {
    /// Keep nodes (and their cache entries) after the session.
    pub keep_resources: bool,
    /// Whether the node was found in the cache rather than provisioned by
    /// this session. Recorded for logging; it does not affect retention.
    pub reused_from_cache: bool,
}

impl RetentionPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(keep_resources: bool, reused_from_cache: bool) -> Self {
        Self {
            keep_resources,
            reused_from_cache,
        }
    }

    /// Returns `true` when the node must be left running.
    #[must_use]
    pub const fn retain(&self) -> bool {
        self.keep_resources
    }
}

/// What a teardown call did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TeardownOutcome {
    /// Nothing was destroyed; the cache entry was left in place.
    Retained,
    /// Deletion was requested and the cache entry cleared.
    Destroyed,
    /// The node was already gone; the cache entry was cleared.
    AlreadyGone,
    /// Another scope still holds the node; the last one to close decides.
    Deferred,
}

/// Errors raised while tearing a node down.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TeardownError {
    /// Raised when the provider rejected the deletion request.
    #[error("failed to destroy {resource_group}: {source}")]
    Destroy {
        /// Grouping container that could not be deleted.
        resource_group: String,
        /// Provider failure.
        #[source]
        source: ProvisionError,
    },
    /// Raised when the cache entry could not be cleared after deletion.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Destroys nodes and clears their cache entries.
#[derive(Clone, Debug)]
pub struct TeardownController<P, C> {
    provisioner: P,
    cache: C,
}

impl<P: Provisioner, C: ProvisionCache> TeardownController<P, C> {
    /// Creates a controller.
    #[must_use]
    pub const fn new(provisioner: P, cache: C) -> Self {
        Self { provisioner, cache }
    }

    /// Tears down `handle` unless `retain` is set.
    ///
    /// Destroying a node that is already gone succeeds, so a run that
    /// crashed between deletion and cache clearing can simply call this
    /// again.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError::Destroy`] when the provider rejects the
    /// deletion (the cache entry is kept so the node can still be found),
    /// or [`TeardownError::Cache`] when the entry cannot be cleared.
    pub async fn teardown(
        &self,
        key: &RequestKey,
        handle: &ResourceHandle,
        retain: bool,
    ) -> Result<TeardownOutcome, TeardownError> {
        if retain {
            info!(
                %key,
                resource = %handle.resource_name,
                "keeping node; skipping teardown"
            );
            return Ok(TeardownOutcome::Retained);
        }

        let outcome = match self.provisioner.destroy(handle).await {
            Ok(DestroyOutcome::Requested) => TeardownOutcome::Destroyed,
            Ok(DestroyOutcome::AlreadyGone) => TeardownOutcome::AlreadyGone,
            Err(err) => {
                error!(
                    %key,
                    resource = %handle.resource_name,
                    group = %handle.resource_group_name,
                    error = %err,
                    "teardown failed; manual cleanup required"
                );
                return Err(TeardownError::Destroy {
                    resource_group: handle.resource_group_name.clone(),
                    source: err,
                });
            }
        };

        self.cache.clear(key)?;
        info!(
            %key,
            resource = %handle.resource_name,
            ?outcome,
            "node torn down"
        );
        Ok(outcome)
    }

    /// Applies `policy` to `handle`.
    ///
    /// # Errors
    ///
    /// See [`TeardownController::teardown`].
    pub async fn apply(
        &self,
        key: &RequestKey,
        handle: &ResourceHandle,
        policy: RetentionPolicy,
    ) -> Result<TeardownOutcome, TeardownError> {
        if policy.reused_from_cache {
            info!(%key, "node was reused from the cache");
        }
        self.teardown(key, handle, policy.retain()).await
    }
}
