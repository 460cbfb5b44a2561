//! Session scope: resolve-or-create a node, share it, tear it down once.
//!
//! A [`SessionScope`] moves through
//! `Unresolved → Resolving → Ready → InUse → TearingDown → Closed`.
//! Resolution consults the provisioning cache first and only provisions on
//! a miss. A failed resolution is remembered and returned to every later
//! caller instead of provisioning again.
//!
//! Scopes for the same request share one node through a [`NodePool`]:
//! in-process callers wait on a single in-flight resolution, and separate
//! processes serialise on a per-key lock held by the cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::cache::{CacheError, KeyLock, ProvisionCache};
use crate::provisioner::{ProvisionError, Provisioner};
use crate::request::{ProvisionRequest, RequestError, RequestKey};
use crate::resource::ResourceHandle;
use crate::runner::CommandRunner;
use crate::teardown::{RetentionPolicy, TeardownController, TeardownError, TeardownOutcome};

mod config;
mod node;

pub use config::SessionConfig;
pub use node::{Node, NodeError};

/// Lifecycle states of a [`SessionScope`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScopeState {
    /// Nothing has been resolved yet.
    Unresolved,
    /// A cache lookup, provisioning call, or connection is in progress.
    Resolving,
    /// A node is available but has not been handed out.
    Ready,
    /// The node has been handed to at least one caller.
    InUse,
    /// The session is being closed and teardown is running.
    TearingDown,
    /// The scope is finished.
    Closed,
    /// Resolution failed; the error is returned to every caller.
    Failed,
}

/// Errors raised while resolving or closing a scope.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScopeError {
    /// Raised when the request is malformed.
    #[error(transparent)]
    Validation(#[from] RequestError),
    /// Raised when provisioning fails.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    /// Raised when the cache cannot be read or updated.
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Raised when no session could be opened to the node.
    #[error(transparent)]
    Connect(#[from] BrokerError),
    /// Raised when teardown fails.
    #[error(transparent)]
    Teardown(#[from] TeardownError),
    /// Raised when the scope is used after it was closed.
    #[error("session scope for {key} is closed")]
    Closed {
        /// Request key of the scope.
        key: String,
    },
}

/// Handle resolved for a key, and whether it came from the cache.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Resolved {
    /// The node's handle.
    pub handle: ResourceHandle,
    /// `true` when the handle was found in the cache.
    pub reused_from_cache: bool,
}

type InFlight = Arc<OnceCell<Resolved>>;

#[derive(Debug, Default)]
struct PoolState {
    in_flight: HashMap<RequestKey, InFlight>,
    holders: HashMap<RequestKey, usize>,
}

/// Single-flight resolver shared by every scope in a process.
///
/// Scopes check a node out with [`NodePool::checkout`] and hand it back with
/// [`NodePool::release`]; only the last holder of a key tears the node down.
#[derive(Debug)]
pub struct NodePool<P, C> {
    provisioner: Arc<P>,
    cache: Arc<C>,
    lock_poll_interval: Duration,
    state: Mutex<PoolState>,
}

impl<P: Provisioner, C: ProvisionCache> NodePool<P, C> {
    /// Creates a pool.
    #[must_use]
    pub fn new(provisioner: Arc<P>, cache: Arc<C>, lock_poll_interval: Duration) -> Self {
        Self {
            provisioner,
            cache,
            lock_poll_interval,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Returns the provisioner.
    #[must_use]
    pub const fn provisioner(&self) -> &Arc<P> {
        &self.provisioner
    }

    /// Returns the cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, key: &RequestKey) -> InFlight {
        Arc::clone(self.locked().in_flight.entry(key.clone()).or_default())
    }

    /// Returns how many scopes currently hold the node for `key`.
    #[must_use]
    pub fn holders(&self, key: &RequestKey) -> usize {
        self.locked().holders.get(key).copied().unwrap_or(0)
    }

    /// Returns the handle for `key`, provisioning a node for `request` when
    /// neither this process nor the cache knows one.
    ///
    /// Concurrent callers for the same key share one attempt. A failed
    /// attempt is not memoised here. The caller does not become a holder;
    /// use [`NodePool::checkout`] for that.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Cache`] or [`ScopeError::Provision`].
    pub async fn resolve(
        &self,
        key: &RequestKey,
        request: &ProvisionRequest,
    ) -> Result<Resolved, ScopeError> {
        let slot = self.slot(key);
        Self::resolve_in(&slot, || self.resolve_uncached(key, request)).await
    }

    /// Like [`NodePool::resolve`], but registers the caller as a holder of
    /// the node. Every successful checkout must be paired with one
    /// [`NodePool::release`].
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Cache`] or [`ScopeError::Provision`].
    pub async fn checkout(
        &self,
        key: &RequestKey,
        request: &ProvisionRequest,
    ) -> Result<Resolved, ScopeError> {
        loop {
            let slot = self.slot(key);
            let resolved = Self::resolve_in(&slot, || self.resolve_uncached(key, request)).await?;
            if self.acquire(key, &slot) {
                return Ok(resolved);
            }
            // The last holder released the node while we waited on it.
            debug!(%key, "node was released during checkout; resolving again");
        }
    }

    async fn resolve_in<F, Fut>(slot: &InFlight, init: F) -> Result<Resolved, ScopeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Resolved, ScopeError>>,
    {
        slot.get_or_try_init(init).await.cloned()
    }

    fn acquire(&self, key: &RequestKey, slot: &InFlight) -> bool {
        let mut state = self.locked();
        let current = state
            .in_flight
            .get(key)
            .is_some_and(|active| Arc::ptr_eq(active, slot));
        if !current {
            return false;
        }
        *state.holders.entry(key.clone()).or_default() += 1;
        true
    }

    /// Hands back one hold on `key`. Returns `true` when the caller was the
    /// last holder and must apply the retention policy itself.
    ///
    /// When the last holder will not retain the node, the memoised handle
    /// is dropped at the same time so no new scope can check it out.
    pub fn release(&self, key: &RequestKey, retain: bool) -> bool {
        let mut state = self.locked();
        let remaining = state.holders.get_mut(key).map_or(0, |count| {
            *count = count.saturating_sub(1);
            *count
        });
        if remaining > 0 {
            return false;
        }
        state.holders.remove(key);
        if !retain {
            state.in_flight.remove(key);
        }
        true
    }

    async fn resolve_uncached(
        &self,
        key: &RequestKey,
        request: &ProvisionRequest,
    ) -> Result<Resolved, ScopeError> {
        if let Some(handle) = self.cache.lookup(key)? {
            info!(%key, resource = %handle.resource_name, "cache hit; reusing node");
            return Ok(Resolved {
                handle,
                reused_from_cache: true,
            });
        }

        let _lock = self.lock_key(key).await?;
        if let Some(handle) = self.cache.lookup(key)? {
            info!(
                %key,
                resource = %handle.resource_name,
                "adopting node provisioned by another session"
            );
            return Ok(Resolved {
                handle,
                reused_from_cache: true,
            });
        }

        info!(%key, "cache miss; provisioning node");
        let handle = self.provisioner.provision(request).await?;
        if let Err(err) = self.cache.store(key, &handle) {
            error!(
                %key,
                resource = %handle.resource_name,
                group = %handle.resource_group_name,
                error = %err,
                "failed to record node in cache; manual cleanup required"
            );
            return Err(err.into());
        }
        info!(%key, resource = %handle.resource_name, host = %handle.host_address, "node provisioned");
        Ok(Resolved {
            handle,
            reused_from_cache: false,
        })
    }

    async fn lock_key(&self, key: &RequestKey) -> Result<KeyLock, CacheError> {
        loop {
            if let Some(lock) = self.cache.try_lock_key(key)? {
                return Ok(lock);
            }
            debug!(%key, "another session is provisioning this key; waiting");
            tokio::time::sleep(self.lock_poll_interval).await;
        }
    }
}

/// A node checked out of the pool by one scope.
#[derive(Clone, Debug)]
struct Lease {
    key: RequestKey,
    handle: ResourceHandle,
    reused_from_cache: bool,
}

struct Resolution<P: Provisioner, R: CommandRunner> {
    lease: Lease,
    node: Arc<Node<P, R>>,
}

enum Slot<P: Provisioner, R: CommandRunner> {
    Empty,
    Live(Resolution<P, R>),
    /// Resolution failed; `lease` is set when a node was checked out before
    /// the failure, so closing still applies the retention policy to it.
    Failed {
        error: ScopeError,
        lease: Option<Lease>,
    },
    Closed,
}

/// Lifetime of one node within a test session.
pub struct SessionScope<P: Provisioner, C: ProvisionCache, R: CommandRunner> {
    request: ProvisionRequest,
    config: SessionConfig,
    ping_bin: String,
    pool: Arc<NodePool<P, C>>,
    broker: Arc<Broker<R>>,
    teardown: TeardownController<Arc<P>, Arc<C>>,
    state: Mutex<ScopeState>,
    slot: tokio::sync::Mutex<Slot<P, R>>,
}

impl<P: Provisioner, C: ProvisionCache, R: CommandRunner> SessionScope<P, C, R> {
    /// Creates an unresolved scope for `request`.
    #[must_use]
    pub fn new(
        request: ProvisionRequest,
        config: SessionConfig,
        pool: Arc<NodePool<P, C>>,
        broker: Arc<Broker<R>>,
    ) -> Self {
        let teardown =
            TeardownController::new(Arc::clone(pool.provisioner()), Arc::clone(pool.cache()));
        let ping_bin = broker.config().ping_bin.clone();
        Self {
            request,
            config,
            ping_bin,
            pool,
            broker,
            teardown,
            state: Mutex::new(ScopeState::Unresolved),
            slot: tokio::sync::Mutex::new(Slot::Empty),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ScopeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ScopeState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(from = ?*state, to = ?next, "scope state change");
        *state = next;
    }

    /// Returns the request this scope serves.
    #[must_use]
    pub const fn request(&self) -> &ProvisionRequest {
        &self.request
    }

    /// Resolves the node without handing it out.
    ///
    /// # Errors
    ///
    /// See [`SessionScope::node`].
    pub async fn resolve(&self) -> Result<(), ScopeError> {
        let mut slot = self.slot.lock().await;
        self.ensure_resolved(&mut slot).await.map(|_| ())
    }

    /// Returns the shared node, resolving it on first use.
    ///
    /// # Errors
    ///
    /// Returns the resolution error (the same one on every call once
    /// resolution has failed), or [`ScopeError::Closed`] after
    /// [`SessionScope::close`].
    pub async fn node(&self) -> Result<Arc<Node<P, R>>, ScopeError> {
        let mut slot = self.slot.lock().await;
        let node = self.ensure_resolved(&mut slot).await?;
        self.set_state(ScopeState::InUse);
        Ok(node)
    }

    async fn ensure_resolved(&self, slot: &mut Slot<P, R>) -> Result<Arc<Node<P, R>>, ScopeError> {
        match slot {
            Slot::Live(resolution) => return Ok(Arc::clone(&resolution.node)),
            Slot::Failed { error, .. } => return Err(error.clone()),
            Slot::Closed => {
                return Err(ScopeError::Closed {
                    key: self.display_key(),
                });
            }
            Slot::Empty => {}
        }

        self.set_state(ScopeState::Resolving);
        let lease = match self.checkout().await {
            Ok(lease) => lease,
            Err(err) => return Err(self.fail(slot, err, None)),
        };
        match self.connect(&lease).await {
            Ok(node) => {
                *slot = Slot::Live(Resolution {
                    lease,
                    node: Arc::clone(&node),
                });
                self.set_state(ScopeState::Ready);
                Ok(node)
            }
            Err(err) => Err(self.fail(slot, err.into(), Some(lease))),
        }
    }

    fn fail(&self, slot: &mut Slot<P, R>, error: ScopeError, lease: Option<Lease>) -> ScopeError {
        error!(request = ?self.request, error = %error, "session scope resolution failed");
        *slot = Slot::Failed {
            error: error.clone(),
            lease,
        };
        self.set_state(ScopeState::Failed);
        error
    }

    async fn checkout(&self) -> Result<Lease, ScopeError> {
        let key = self.request.key()?;
        let resolved = self.pool.checkout(&key, &self.request).await?;
        Ok(Lease {
            key,
            handle: resolved.handle,
            reused_from_cache: resolved.reused_from_cache,
        })
    }

    async fn connect(&self, lease: &Lease) -> Result<Arc<Node<P, R>>, BrokerError> {
        let session = self.broker.open(&lease.handle).await?;
        Ok(Arc::new(Node::new(
            session,
            Arc::clone(self.pool.provisioner()),
            self.config.retry_policy(),
            self.ping_bin.clone(),
        )))
    }

    fn display_key(&self) -> String {
        self.request
            .key()
            .map_or_else(|_| String::from("<invalid request>"), |key| key.to_string())
    }

    /// Closes the session and hands the node back to the pool. The last
    /// scope holding a node applies the retention policy; earlier ones
    /// return [`TeardownOutcome::Deferred`]. Runs at most once; later calls
    /// return `Ok(None)`.
    ///
    /// A node that was provisioned but never became reachable is still
    /// subject to the retention policy. Returns `Ok(None)` when no node was
    /// ever checked out.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Teardown`] when the node could not be
    /// destroyed. The scope is closed regardless.
    pub async fn close(&self) -> Result<Option<TeardownOutcome>, ScopeError> {
        let mut slot = self.slot.lock().await;
        let previous = std::mem::replace(&mut *slot, Slot::Closed);
        let (lease, node) = match previous {
            Slot::Live(resolution) => (resolution.lease, Some(resolution.node)),
            Slot::Failed {
                lease: Some(lease), ..
            } => (lease, None),
            Slot::Empty | Slot::Failed { lease: None, .. } | Slot::Closed => {
                self.set_state(ScopeState::Closed);
                return Ok(None);
            }
        };

        self.set_state(ScopeState::TearingDown);
        if let Some(node) = node {
            if let Err(err) = node.session().close().await {
                warn!(key = %lease.key, error = %err, "failed to close session");
            }
        }

        let policy = RetentionPolicy::new(self.config.keep_resources(), lease.reused_from_cache);
        if !self.pool.release(&lease.key, policy.retain()) {
            info!(key = %lease.key, "node still held by another scope; teardown deferred");
            self.set_state(ScopeState::Closed);
            return Ok(Some(TeardownOutcome::Deferred));
        }

        let result = self.teardown.apply(&lease.key, &lease.handle, policy).await;
        self.set_state(ScopeState::Closed);
        Ok(Some(result?))
    }
}
