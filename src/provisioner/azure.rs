//! Azure provisioner that shells out to the `az` CLI.
//!
//! Every node gets its own resource group (`<name>-rg`) so teardown is a
//! single group deletion. Boot diagnostics for all nodes go to one shared
//! storage account living in a fixed control group.

use std::ffi::OsString;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AzureConfig, ConfigError};
use crate::request::ProvisionRequest;
use crate::resource::ResourceHandle;
use crate::runner::{
    CommandEnv, CommandOutput, CommandRunner, CommandSpec, LOCAL_PASSTHROUGH_VARS,
    ProcessCommandRunner,
};

use super::{DestroyOutcome, ProvisionError, ProvisionFuture, Provisioner};

const NSG_RULE_DIRECTIONS: [&str; 2] = ["Inbound", "Outbound"];

#[derive(Debug, Deserialize)]
struct AzAccount {
    #[serde(rename = "isDefault", default)]
    is_default: bool,
    #[serde(default)]
    name: String,
    #[serde(default)]
    user: Option<AzAccountUser>,
}

#[derive(Debug, Deserialize)]
struct AzAccountUser {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct AzVmCreated {
    #[serde(rename = "publicIpAddress", default)]
    public_ip_address: String,
}

/// Provisions nodes through the Azure CLI.
#[derive(Debug)]
pub struct AzureProvisioner<R: CommandRunner> {
    config: AzureConfig,
    runner: R,
    preflight: OnceCell<()>,
}

impl AzureProvisioner<ProcessCommandRunner> {
    /// Creates a provisioner wired to the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration is incomplete.
    pub fn with_process_runner(config: AzureConfig) -> Result<Self, ConfigError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> AzureProvisioner<R> {
    /// Creates a provisioner using the provided configuration and runner.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration is incomplete.
    pub fn new(config: AzureConfig, runner: R) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            runner,
            preflight: OnceCell::new(),
        })
    }

    /// Returns the provisioner configuration.
    #[must_use]
    pub const fn config(&self) -> &AzureConfig {
        &self.config
    }

    fn az_spec(&self, args: &[String]) -> CommandSpec {
        CommandSpec::new(
            self.config.az_bin.clone(),
            args.iter().map(OsString::from).collect(),
        )
        .with_env(CommandEnv::passthrough(LOCAL_PASSTHROUGH_VARS))
        .with_timeout(Duration::from_secs(self.config.command_timeout_secs))
    }

    async fn run_az_unchecked(&self, args: &[String]) -> Result<CommandOutput, ProvisionError> {
        let spec = self.az_spec(args);
        debug!(command = %spec.display(), "running provider command");
        Ok(self.runner.run(&spec).await?)
    }

    async fn run_az(&self, step: &str, args: &[String]) -> Result<CommandOutput, ProvisionError> {
        let output = self.run_az_unchecked(args).await?;
        if output.is_success() {
            return Ok(output);
        }
        Err(self.command_failure(step, &output))
    }

    fn command_failure(&self, step: &str, output: &CommandOutput) -> ProvisionError {
        ProvisionError::CommandFailure {
            program: self.config.az_bin.clone(),
            step: step.to_owned(),
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        }
    }

    async fn ensure_preflight(&self) -> Result<(), ProvisionError> {
        self.preflight
            .get_or_try_init(|| self.check_cli())
            .await
            .map(|_| ())
    }

    async fn check_cli(&self) -> Result<(), ProvisionError> {
        let version = self
            .run_az_unchecked(&args(&["--version"]))
            .await
            .map_err(|err| {
                ProvisionError::Preflight(format!(
                    "{err}; install the Azure CLI or set NODEKEEPER_AZURE_AZ_BIN"
                ))
            })?;
        if !version.is_success() {
            return Err(ProvisionError::Preflight(format!(
                "{} --version failed; install the Azure CLI",
                self.config.az_bin
            )));
        }

        let account = self
            .run_az_unchecked(&args(&["account", "show", "-o", "json"]))
            .await?;
        if !account.is_success() {
            return Err(ProvisionError::Preflight(String::from(
                "no active account; run `az login`",
            )));
        }
        let parsed: AzAccount =
            serde_json::from_str(&account.stdout).map_err(|err| ProvisionError::Parse {
                step: String::from("account show"),
                message: err.to_string(),
            })?;
        if !parsed.is_default {
            return Err(ProvisionError::Preflight(String::from(
                "no default subscription; run `az account set -s <subscription>`",
            )));
        }

        let user = parsed.user.map(|user| user.name).unwrap_or_default();
        info!(user = %user, subscription = %parsed.name, "using Azure account");
        Ok(())
    }

    async fn ensure_group(&self, group: &str, location: &str) -> Result<(), ProvisionError> {
        let output = self
            .run_az_unchecked(&args(&[
                "group", "create", "-n", group, "--location", location, "-o", "none",
            ]))
            .await?;
        if output.is_success() || is_already_exists(&output.stderr) {
            return Ok(());
        }
        Err(self.command_failure("group create", &output))
    }

    async fn ensure_diagnostics_storage(&self, location: &str) -> Result<String, ProvisionError> {
        let group = &self.config.diagnostics_group;
        let account = &self.config.diagnostics_account;

        // `az group exists` always exits 0 and prints `true` or `false`.
        let exists = self
            .run_az("group exists", &args(&["group", "exists", "-n", group]))
            .await?;
        if exists.stdout.trim() != "true" {
            self.ensure_group(group, location).await?;
        }

        let show = self
            .run_az_unchecked(&args(&[
                "storage", "account", "show", "-g", group, "-n", account, "-o", "none",
            ]))
            .await?;
        if !show.is_success() {
            info!(account = %account, group = %group, "creating boot diagnostics storage");
            let created = self
                .run_az_unchecked(&args(&[
                    "storage",
                    "account",
                    "create",
                    "-g",
                    group,
                    "-n",
                    account,
                    "--location",
                    location,
                    "-o",
                    "none",
                ]))
                .await?;
            if !created.is_success() && !is_already_exists(&created.stderr) {
                return Err(self.command_failure("storage account create", &created));
            }
        }
        Ok(account.clone())
    }

    fn vm_create_args(
        &self,
        name: &str,
        group: &str,
        diagnostics: &str,
        request: &ProvisionRequest,
    ) -> Vec<String> {
        let mut vm_args = args(&[
            "vm",
            "create",
            "-g",
            group,
            "-n",
            name,
            "--image",
            &request.image_reference,
            "--size",
            &request.size_class,
            "--location",
            &request.location,
            "--boot-diagnostics-storage",
            diagnostics,
            "--admin-username",
            &self.config.admin_username,
            "--generate-ssh-keys",
            "-o",
            "json",
        ]);
        if request.wants_accelerated_networking() {
            vm_args.push(String::from("--accelerated-networking"));
            vm_args.push(String::from("true"));
        }
        vm_args
    }

    async fn create_vm(
        &self,
        name: &str,
        group: &str,
        diagnostics: &str,
        request: &ProvisionRequest,
    ) -> Result<AzVmCreated, ProvisionError> {
        let output = self
            .run_az_unchecked(&self.vm_create_args(name, group, diagnostics, request))
            .await?;
        if !output.is_success() {
            return Err(self.command_failure("vm create", &output));
        }

        let created: AzVmCreated =
            serde_json::from_str(&output.stdout).map_err(|err| ProvisionError::Parse {
                step: String::from("vm create"),
                message: err.to_string(),
            })?;
        if created.public_ip_address.trim().is_empty() {
            return Err(ProvisionError::Parse {
                step: String::from("vm create"),
                message: String::from("publicIpAddress missing from output"),
            });
        }
        Ok(created)
    }

    /// Removes the group of a node whose creation failed so it does not leak.
    async fn discard_group(&self, group: &str) {
        let result = self
            .run_az_unchecked(&args(&["group", "delete", "-n", group, "--yes", "--no-wait"]))
            .await;
        match result {
            Ok(output) if output.is_success() => {
                info!(group = %group, "requested deletion of partially created node");
            }
            Ok(output) => warn!(
                group = %group,
                stderr = %output.stderr.trim(),
                "failed to delete partially created node; manual cleanup required"
            ),
            Err(err) => warn!(
                group = %group,
                error = %err,
                "failed to delete partially created node; manual cleanup required"
            ),
        }
    }

    /// Opens ICMP in the node's security group so tests can ping it.
    ///
    /// Failures are logged and ignored: the node is usable without them.
    async fn allow_ping(&self, name: &str, group: &str) {
        let nsg = format!("{name}NSG");
        for direction in NSG_RULE_DIRECTIONS {
            let rule = format!("allow{direction}ICMP");
            let result = self
                .run_az(
                    "nsg rule create",
                    &args(&[
                        "network",
                        "nsg",
                        "rule",
                        "create",
                        "--name",
                        &rule,
                        "--nsg-name",
                        &nsg,
                        "--priority",
                        "100",
                        "--resource-group",
                        group,
                        "--access",
                        "Allow",
                        "--direction",
                        direction,
                        "--protocol",
                        "Icmp",
                        "--source-port-ranges",
                        "*",
                        "--destination-port-ranges",
                        "*",
                        "-o",
                        "none",
                    ]),
                )
                .await;
            if let Err(err) = result {
                warn!(rule = %rule, nsg = %nsg, error = %err, "failed to create ICMP allow rule");
            }
        }
    }

    async fn provision_node(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ResourceHandle, ProvisionError> {
        request.validate()?;
        self.ensure_preflight().await?;

        let name = format!("{}-{}", self.config.name_prefix, Uuid::new_v4());
        let group = format!("{name}-rg");
        info!(
            group = %group,
            location = %request.location,
            image = %request.image_reference,
            size = %request.size_class,
            "deploying node"
        );

        self.ensure_group(&group, &request.location).await?;
        match self.deploy_into_group(&name, &group, request).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                // Anything created in the group so far would otherwise leak.
                self.discard_group(&group).await;
                Err(err)
            }
        }
    }

    async fn deploy_into_group(
        &self,
        name: &str,
        group: &str,
        request: &ProvisionRequest,
    ) -> Result<ResourceHandle, ProvisionError> {
        let diagnostics = self.ensure_diagnostics_storage(&request.location).await?;
        let created = self.create_vm(name, group, &diagnostics, request).await?;
        self.allow_ping(name, group).await;

        Ok(ResourceHandle {
            resource_name: name.to_owned(),
            resource_group_name: group.to_owned(),
            host_address: created.public_ip_address.trim().to_owned(),
            port: self.config.ssh_port,
            boot_diagnostics_account: diagnostics,
            created_at: SystemTime::now(),
        })
    }

    async fn destroy_node(&self, handle: &ResourceHandle) -> Result<DestroyOutcome, ProvisionError> {
        info!(group = %handle.resource_group_name, "deleting resource group");
        let output = self
            .run_az_unchecked(&args(&[
                "group",
                "delete",
                "-n",
                &handle.resource_group_name,
                "--yes",
                "--no-wait",
            ]))
            .await?;
        if output.is_success() {
            return Ok(DestroyOutcome::Requested);
        }
        if is_not_found(&output.stderr) {
            return Ok(DestroyOutcome::AlreadyGone);
        }
        Err(self.command_failure("group delete", &output))
    }

    async fn vm_action(
        &self,
        step: &str,
        action: &[&str],
        handle: &ResourceHandle,
    ) -> Result<CommandOutput, ProvisionError> {
        let mut vm_args = args(&["vm"]);
        vm_args.extend(args(action));
        vm_args.extend(args(&[
            "-n",
            &handle.resource_name,
            "-g",
            &handle.resource_group_name,
        ]));
        self.run_az(step, &vm_args).await
    }
}

impl<R: CommandRunner> Provisioner for AzureProvisioner<R> {
    fn provision<'a>(
        &'a self,
        request: &'a ProvisionRequest,
    ) -> ProvisionFuture<'a, ResourceHandle> {
        Box::pin(self.provision_node(request))
    }

    fn destroy<'a>(&'a self, handle: &'a ResourceHandle) -> ProvisionFuture<'a, DestroyOutcome> {
        Box::pin(self.destroy_node(handle))
    }

    fn boot_log<'a>(&'a self, handle: &'a ResourceHandle) -> ProvisionFuture<'a, CommandOutput> {
        Box::pin(self.vm_action(
            "boot-diagnostics get-boot-log",
            &["boot-diagnostics", "get-boot-log"],
            handle,
        ))
    }

    fn restart<'a>(&'a self, handle: &'a ResourceHandle) -> ProvisionFuture<'a, CommandOutput> {
        Box::pin(self.vm_action("restart", &["restart"], handle))
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

fn is_already_exists(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    lowered.contains("already exists") || lowered.contains("alreadyexists")
}

fn is_not_found(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    lowered.contains("resourcegroupnotfound") || lowered.contains("could not be found")
}
