//! Provider configuration loading via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::request::ProvisionRequest;

/// Azure provisioning settings derived from environment variables and
/// configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "NODEKEEPER_AZURE",
    discovery(
        app_name = "nodekeeper",
        env_var = "NODEKEEPER_CONFIG_PATH",
        config_file_name = "nodekeeper.toml",
        dotfile_name = ".nodekeeper.toml",
        project_file_name = "nodekeeper.toml"
    )
)]
pub struct AzureConfig {
    /// Path to the `az` executable.
    #[ortho_config(default = "az".to_owned())]
    pub az_bin: String,
    /// Prefix for generated node names (`<prefix>-<uuid>`).
    #[ortho_config(default = "nodekeeper".to_owned())]
    pub name_prefix: String,
    /// Administrator account created on new nodes.
    #[ortho_config(default = "azureuser".to_owned())]
    pub admin_username: String,
    /// Resource group holding the shared boot diagnostics account.
    #[ortho_config(default = "nodekeeper-diag".to_owned())]
    pub diagnostics_group: String,
    /// Storage account receiving boot diagnostics for every node.
    #[ortho_config(default = "nkbootdiag".to_owned())]
    pub diagnostics_account: String,
    /// Region used when a request does not name one.
    #[ortho_config(default = "eastus2".to_owned())]
    pub default_location: String,
    /// Image used when a request does not name one.
    #[ortho_config(default = "UbuntuLTS".to_owned())]
    pub default_image: String,
    /// Size used when a request does not name one.
    #[ortho_config(default = "Standard_DS1_v2".to_owned())]
    pub default_size: String,
    /// SSH port recorded on new handles.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Upper bound on a single `az` invocation, in seconds.
    #[ortho_config(default = 1800)]
    pub command_timeout_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl AzureConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to nodekeeper.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("nodekeeper")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Builds a [`ProvisionRequest`] from the configured defaults, letting
    /// callers override individual fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn request_with(
        &self,
        location: Option<&str>,
        image: Option<&str>,
        size: Option<&str>,
        setup: Option<&str>,
        networking: Option<&str>,
    ) -> Result<ProvisionRequest, ConfigError> {
        self.validate()?;
        ProvisionRequest::builder()
            .location(location.unwrap_or(&self.default_location))
            .image_reference(image.unwrap_or(&self.default_image))
            .size_class(size.unwrap_or(&self.default_size))
            .setup_variant(setup.unwrap_or_default())
            .networking_mode(networking.unwrap_or_default())
            .build()
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, metadata) in [
            (
                &self.az_bin,
                FieldMetadata::new("Azure CLI binary", "NODEKEEPER_AZURE_AZ_BIN", "az_bin"),
            ),
            (
                &self.name_prefix,
                FieldMetadata::new(
                    "node name prefix",
                    "NODEKEEPER_AZURE_NAME_PREFIX",
                    "name_prefix",
                ),
            ),
            (
                &self.admin_username,
                FieldMetadata::new(
                    "administrator user name",
                    "NODEKEEPER_AZURE_ADMIN_USERNAME",
                    "admin_username",
                ),
            ),
            (
                &self.diagnostics_group,
                FieldMetadata::new(
                    "diagnostics resource group",
                    "NODEKEEPER_AZURE_DIAGNOSTICS_GROUP",
                    "diagnostics_group",
                ),
            ),
            (
                &self.diagnostics_account,
                FieldMetadata::new(
                    "diagnostics storage account",
                    "NODEKEEPER_AZURE_DIAGNOSTICS_ACCOUNT",
                    "diagnostics_account",
                ),
            ),
        ] {
            Self::require_field(value, &metadata)?;
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
