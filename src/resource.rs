//! Handles describing live provisioned nodes.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Record describing a live provisioned node and how to reach it.
///
/// Handles are created by a provisioner, persisted in the provisioning cache,
/// and consumed by the connection broker and the teardown controller.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Provider name of the machine; used for boot logs and restarts.
    pub resource_name: String,
    /// Grouping container holding every resource created for the machine.
    pub resource_group_name: String,
    /// Public address used for SSH and ping.
    pub host_address: String,
    /// SSH port.
    pub port: u16,
    /// Shared storage account receiving boot diagnostics.
    pub boot_diagnostics_account: String,
    /// Time the handle was created by the provisioner.
    pub created_at: SystemTime,
}
