//! Core library for the nodekeeper test node lifecycle manager.
//!
//! The crate provisions disposable Azure VMs for integration test sessions,
//! caches them by request so later sessions reuse them, runs commands on
//! them over SSH, and tears them down when the session ends (unless told to
//! keep them).

pub mod broker;
pub mod cache;
pub mod config;
pub mod provisioner;
pub mod request;
pub mod resource;
pub mod retry;
pub mod runner;
pub mod scope;
pub mod teardown;
pub mod test_support;

pub use broker::{Broker, BrokerError, CommandResult, ConnectionConfig, Session, Target};
pub use cache::{CacheError, FileCache, KeyLock, MemoryCache, ProvisionCache};
pub use config::{AzureConfig, ConfigError};
pub use provisioner::{AzureProvisioner, DestroyOutcome, ProvisionError, Provisioner};
pub use request::{ProvisionRequest, ProvisionRequestBuilder, RequestError, RequestKey, build_key};
pub use resource::ResourceHandle;
pub use retry::{RetryError, RetryPolicy, with_retry, with_retry_within};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessCommandRunner, RunnerError};
pub use scope::{
    Node, NodeError, NodePool, Resolved, ScopeError, ScopeState, SessionConfig, SessionScope,
};
pub use teardown::{RetentionPolicy, TeardownController, TeardownError, TeardownOutcome};
