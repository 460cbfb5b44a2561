//! Provisioning requests and the canonical keys derived from them.
//!
//! A [`ProvisionRequest`] describes the node a test session needs. Two
//! requests with identical fields are interchangeable, so the cache indexes
//! provisioned nodes by a [`RequestKey`] built from the fields that affect
//! fungibility. Free-form labels are carried for logging only and never take
//! part in the key.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix shared by every request key.
pub const KEY_PREFIX: &str = "node";

/// Separator between key segments.
pub const KEY_SEPARATOR: char = '/';

/// Networking mode value that turns on accelerated networking.
pub const ACCELERATED_NETWORKING_MODE: &str = "SRIOV";

/// Immutable description of the node a session wants to use.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Provider region (for example `eastus2`).
    pub location: String,
    /// Provider image identifier (for example `UbuntuLTS` or a URN).
    pub image_reference: String,
    /// Provider SKU or size (for example `Standard_DS1_v2`).
    pub size_class: String,
    /// Optional setup variant; empty when unused.
    pub setup_variant: String,
    /// Optional networking mode; empty when unused.
    pub networking_mode: String,
    /// Free-form labels used for logging; excluded from the request key.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ProvisionRequest {
    /// Starts a builder for a [`ProvisionRequest`].
    #[must_use]
    pub fn builder() -> ProvisionRequestBuilder {
        ProvisionRequestBuilder::new()
    }

    /// Validates the request, returning the first missing required field.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Validation`] when `location`,
    /// `image_reference`, or `size_class` is blank, and
    /// [`RequestError::Separator`] when `setup_variant` or `networking_mode`
    /// contains the key separator.
    pub fn validate(&self) -> Result<(), RequestError> {
        for (field, value) in [
            ("location", &self.location),
            ("image_reference", &self.image_reference),
            ("size_class", &self.size_class),
        ] {
            if value.trim().is_empty() {
                return Err(RequestError::Validation(field.to_owned()));
            }
        }
        // Optional segments are tagged, so a separator inside one could forge
        // the tag of the next.
        for (field, value) in [
            ("setup_variant", &self.setup_variant),
            ("networking_mode", &self.networking_mode),
        ] {
            if value.contains(KEY_SEPARATOR) {
                return Err(RequestError::Separator(field.to_owned()));
            }
        }
        Ok(())
    }

    /// Returns `true` when the request asks for accelerated networking.
    #[must_use]
    pub fn wants_accelerated_networking(&self) -> bool {
        self.networking_mode
            .trim()
            .eq_ignore_ascii_case(ACCELERATED_NETWORKING_MODE)
    }

    /// Derives the canonical cache key for this request.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Validation`] when the request is malformed.
    pub fn key(&self) -> Result<RequestKey, RequestError> {
        build_key(self)
    }
}

/// Builder for [`ProvisionRequest`] that trims inputs and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ProvisionRequestBuilder {
    location: String,
    image_reference: String,
    size_class: String,
    setup_variant: String,
    networking_mode: String,
    labels: BTreeMap<String, String>,
}

impl ProvisionRequestBuilder {
    /// Creates an empty builder; required fields must be set before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the provider region.
    #[must_use]
    pub fn location(mut self, value: impl Into<String>) -> Self {
        self.location = value.into();
        self
    }

    /// Sets the image identifier.
    #[must_use]
    pub fn image_reference(mut self, value: impl Into<String>) -> Self {
        self.image_reference = value.into();
        self
    }

    /// Sets the size class.
    #[must_use]
    pub fn size_class(mut self, value: impl Into<String>) -> Self {
        self.size_class = value.into();
        self
    }

    /// Sets the setup variant.
    #[must_use]
    pub fn setup_variant(mut self, value: impl Into<String>) -> Self {
        self.setup_variant = value.into();
        self
    }

    /// Sets the networking mode.
    #[must_use]
    pub fn networking_mode(mut self, value: impl Into<String>) -> Self {
        self.networking_mode = value.into();
        self
    }

    /// Adds a free-form label.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Builds and validates the [`ProvisionRequest`].
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Validation`] when a required field is blank.
    pub fn build(self) -> Result<ProvisionRequest, RequestError> {
        let request = ProvisionRequest {
            location: self.location.trim().to_owned(),
            image_reference: self.image_reference.trim().to_owned(),
            size_class: self.size_class.trim().to_owned(),
            setup_variant: self.setup_variant.trim().to_owned(),
            networking_mode: self.networking_mode.trim().to_owned(),
            labels: self.labels,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Stable cache index derived from a [`ProvisionRequest`].
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a file-name-safe rendering of the key, used for lock files.
    #[must_use]
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                    ch
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Builds the canonical key for `request`.
///
/// The key is `node/<location>/<image_reference>/<size_class>` followed by
/// `setup=<variant>` and `net=<mode>` segments when those optional fields are
/// set. Values are trimmed; the networking mode is upper-cased because the
/// provider treats it case-insensitively.
///
/// # Errors
///
/// Returns [`RequestError::Validation`] when a required field is blank.
pub fn build_key(request: &ProvisionRequest) -> Result<RequestKey, RequestError> {
    request.validate()?;

    let mut key = String::from(KEY_PREFIX);
    for part in [
        request.location.trim(),
        request.image_reference.trim(),
        request.size_class.trim(),
    ] {
        key.push(KEY_SEPARATOR);
        key.push_str(part);
    }

    let setup = request.setup_variant.trim();
    if !setup.is_empty() {
        key.push_str("/setup=");
        key.push_str(setup);
    }

    let networking = request.networking_mode.trim().to_ascii_uppercase();
    if !networking.is_empty() {
        key.push_str("/net=");
        key.push_str(&networking);
    }

    Ok(RequestKey(key))
}

/// Errors raised while validating a request.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RequestError {
    /// Raised when a required field is missing or blank.
    #[error("invalid provisioning request: missing or empty field {0}")]
    Validation(String),
    /// Raised when an optional key segment contains the key separator.
    #[error("invalid provisioning request: field {0} must not contain '/'")]
    Separator(String),
}

#[cfg(test)]
mod tests;
