//! Command-line interface definitions for the `nodekeeper` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `nodekeeper` binary.
#[derive(Debug, Parser)]
#[command(
    name = "nodekeeper",
    about = "Provision, reuse, and tear down disposable Azure test nodes",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Resolve a node (reusing a cached one when possible) and run a command
    /// on it.
    #[command(name = "run", about = "Resolve a node and run a command on it over SSH")]
    Run(RunCommand),
    /// Destroy the cached node for a request and clear its cache entry.
    #[command(name = "teardown", about = "Destroy the cached node for a request")]
    Teardown(RequestArgs),
    /// Print the boot diagnostics log of the cached node for a request.
    #[command(name = "boot-log", about = "Print the boot log of the cached node")]
    BootLog(RequestArgs),
    /// Print every cache entry as JSON.
    #[command(name = "list", about = "List cached nodes as JSON")]
    List,
}

/// Request overrides shared by every subcommand that targets one node.
///
/// Unset values fall back to the configured defaults.
#[derive(Debug, Args)]
pub(crate) struct RequestArgs {
    /// Azure region, for example `eastus2`.
    #[arg(long, value_name = "LOCATION")]
    pub(crate) location: Option<String>,
    /// Image reference, for example `UbuntuLTS` or a publisher URN.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) image: Option<String>,
    /// VM size, for example `Standard_DS1_v2`.
    #[arg(long, value_name = "SIZE")]
    pub(crate) size: Option<String>,
    /// Setup variant baked into the node, for example `dpdk`.
    #[arg(long, value_name = "VARIANT")]
    pub(crate) setup: Option<String>,
    /// Networking mode; `SRIOV` enables accelerated networking.
    #[arg(long, value_name = "MODE")]
    pub(crate) networking: Option<String>,
}

/// Arguments for the `nodekeeper run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Node selection.
    #[command(flatten)]
    pub(crate) request: RequestArgs,
    /// Keep the node running (and cached) after the command finishes.
    #[arg(long)]
    pub(crate) keep: bool,
    /// Override the command timeout, in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout_secs: Option<u64>,
    /// Command to execute on the node (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}
