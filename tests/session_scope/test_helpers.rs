//! Fixtures for session scope behavioural tests.
//!
//! Every clone of [`ScopeContext`] shares the same fake provider, cache,
//! scripted runner, and recorded outcomes, so steps can hand the context
//! along by value or by reference.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nodekeeper::test_support::{FakeProvisioner, ScriptedRunner};
use nodekeeper::{
    Broker, BrokerError, CommandResult, ConnectionConfig, MemoryCache, NodePool,
    ProvisionRequest, RequestKey, RetryPolicy, ScopeError, SessionConfig, SessionScope,
    TeardownOutcome,
};
use rstest::fixture;
use thiserror::Error;

pub type TestScope = SessionScope<FakeProvisioner, MemoryCache, ScriptedRunner>;

/// Failures raised by step definitions.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
    #[error("failed to build tokio runtime: {0}")]
    Runtime(String),
}

#[derive(Debug, Default)]
pub struct Observed {
    pub keep_resources: bool,
    pub resolution: Option<Result<(), ScopeError>>,
    pub commands: Vec<Result<CommandResult, BrokerError>>,
    pub closed: Option<Result<Option<TeardownOutcome>, ScopeError>>,
}

#[derive(Clone)]
pub struct ScopeContext {
    pub provisioner: FakeProvisioner,
    pub cache: Arc<MemoryCache>,
    pub runner: ScriptedRunner,
    pool: Arc<NodePool<FakeProvisioner, MemoryCache>>,
    broker: Arc<Broker<ScriptedRunner>>,
    scope: Arc<Mutex<Option<Arc<TestScope>>>>,
    observed: Arc<Mutex<Observed>>,
}

impl ScopeContext {
    fn new() -> Self {
        let provisioner = FakeProvisioner::new();
        let cache = Arc::new(MemoryCache::new());
        let runner = ScriptedRunner::always_succeeding();
        let pool = Arc::new(NodePool::new(
            Arc::new(provisioner.clone()),
            Arc::clone(&cache),
            Duration::from_millis(10),
        ));
        let broker = match Broker::new(ConnectionConfig::default(), runner.clone()) {
            Ok(broker) => broker.with_retry_policy(RetryPolicy::new(3, Duration::ZERO, Duration::ZERO)),
            Err(err) => panic!("default connection config should be valid: {err}"),
        };
        Self {
            provisioner,
            cache,
            runner,
            pool,
            broker: Arc::new(broker),
            scope: Arc::new(Mutex::new(None)),
            observed: Arc::new(Mutex::new(Observed::default())),
        }
    }

    /// Returns the request every scenario resolves.
    pub fn request() -> Result<ProvisionRequest, StepError> {
        ProvisionRequest::builder()
            .location("eastus2")
            .image_reference("UbuntuLTS")
            .size_class("Standard_DS1_v2")
            .build()
            .map_err(|err| StepError::Assertion(err.to_string()))
    }

    /// Returns the cache key of [`ScopeContext::request`].
    pub fn key() -> Result<RequestKey, StepError> {
        Self::request()?
            .key()
            .map_err(|err| StepError::Assertion(err.to_string()))
    }

    /// Returns the scope, creating it on first use.
    pub fn scope(&self) -> Result<Arc<TestScope>, StepError> {
        let mut slot = self.scope.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(scope) = slot.as_ref() {
            return Ok(Arc::clone(scope));
        }
        let config = SessionConfig {
            keep_resources: Some(self.observed().keep_resources),
            retry_initial_delay_ms: 0,
            retry_max_delay_ms: 0,
            lock_poll_interval_ms: 10,
            ..SessionConfig::default()
        };
        let scope = Arc::new(SessionScope::new(
            Self::request()?,
            config,
            Arc::clone(&self.pool),
            Arc::clone(&self.broker),
        ));
        *slot = Some(Arc::clone(&scope));
        Ok(scope)
    }

    pub fn observed(&self) -> std::sync::MutexGuard<'_, Observed> {
        self.observed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[fixture]
pub fn scope_context() -> ScopeContext {
    ScopeContext::new()
}

pub fn runtime() -> Result<tokio::runtime::Runtime, StepError> {
    tokio::runtime::Runtime::new().map_err(|err| StepError::Runtime(err.to_string()))
}

pub fn ensure(condition: bool, message: impl Into<String>) -> Result<(), StepError> {
    if condition {
        Ok(())
    } else {
        Err(StepError::Assertion(message.into()))
    }
}
