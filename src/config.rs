//! Configuration loading via `ortho-config`.
//!
//! Two layered structs are loaded independently: [`ScalewayConfig`] holds the
//! cloud account (prefix `SCW`, shared with the Scaleway CLI) and
//! [`ForesterConfig`] holds registry, fallback, and timeout settings (prefix
//! `FORESTER`). Both read `forester.toml` when present.

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::cloud_init::{CloudInitError, NodeUserData, resolve_cloud_init_user_data};
use crate::orchestrator::{ConflictRetry, OrchestratorSettings};
use crate::registry::{LocalRegistry, Registry, RegistryError, RemoteRegistry};

/// Default registry file used when no remote registry is configured.
pub const DEFAULT_REGISTRY_FILE: &str = "forester-registry.json";

/// Scaleway specific configuration derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SCW",
    discovery(
        app_name = "forester",
        env_var = "FORESTER_CONFIG_PATH",
        config_file_name = "forester.toml",
        dotfile_name = ".forester.toml",
        project_file_name = "forester.toml"
    )
)]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application. Not needed for API
    /// calls; accepted so a shared `SCW_*` environment loads cleanly.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and resource scoping.
    pub default_project_id: String,
    /// Zone used for catalogue lookups and as the first preferred zone.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Primary commercial type for new nodes.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Human-friendly image label (for example `Ubuntu 24.04 Noble Numbat`).
    #[ortho_config(default = "Ubuntu 24.04 Noble Numbat".to_owned())]
    pub default_image: String,
    /// CPU architecture used to select the correct image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in forester.toml",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::Invalid(format!(
            "{} {reason}: check {} or {} in [{}] of forester.toml",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(metadata.missing());
    }
    Ok(())
}

fn require_optional(value: Option<&str>, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    match value {
        Some(text) if text.trim().is_empty() => Err(metadata.invalid("must not be blank")),
        _ => Ok(()),
    }
}

/// Splits a comma separated list, dropping blank entries.
#[must_use]
pub fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_owned)
        .collect()
}

impl ScalewayConfig {
    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("forester")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.secret_key,
            &FieldMetadata::new(
                "Scaleway API secret key",
                "SCW_SECRET_KEY",
                "secret_key",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_project_id,
            &FieldMetadata::new(
                "Scaleway project ID",
                "SCW_DEFAULT_PROJECT_ID",
                "default_project_id",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_image,
            &FieldMetadata::new("VM image", "SCW_DEFAULT_IMAGE", "default_image", "scaleway"),
        )?;
        require_field(
            &self.default_instance_type,
            &FieldMetadata::new(
                "instance type",
                "SCW_DEFAULT_INSTANCE_TYPE",
                "default_instance_type",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_zone,
            &FieldMetadata::new(
                "availability zone",
                "SCW_DEFAULT_ZONE",
                "default_zone",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_architecture,
            &FieldMetadata::new(
                "CPU architecture",
                "SCW_DEFAULT_ARCHITECTURE",
                "default_architecture",
                "scaleway",
            ),
        )?;
        Ok(())
    }
}

/// Registry, fallback, and timeout settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FORESTER",
    discovery(
        app_name = "forester",
        env_var = "FORESTER_CONFIG_PATH",
        config_file_name = "forester.toml",
        dotfile_name = ".forester.toml",
        project_file_name = "forester.toml"
    )
)]
pub struct ForesterConfig {
    /// Path of the local registry file. Ignored when `registry_url` is set.
    #[ortho_config(default = DEFAULT_REGISTRY_FILE.to_owned())]
    pub registry_file: String,
    /// URL of a remote registry document; selects the HTTP backend.
    pub registry_url: Option<String>,
    /// Bearer token sent to the remote registry.
    pub registry_token: Option<String>,
    /// Comma separated machine types tried after the primary one.
    pub fallback_instance_types: Option<String>,
    /// Comma separated zones tried first, in order.
    pub preferred_zones: Option<String>,
    /// Seconds a new node may take to reach the running state.
    #[ortho_config(default = 300)]
    pub node_wait_timeout_secs: u64,
    /// Deadline in seconds for every other provider or registry call.
    #[ortho_config(default = 600)]
    pub call_timeout_secs: u64,
    /// Attempts per registry write when a concurrent modification is detected.
    #[ortho_config(default = 3)]
    pub conflict_retries: u32,
    /// Inline cloud-init user-data sent to every node.
    pub cloud_init_user_data: Option<String>,
    /// Path to a cloud-init user-data file sent to every node.
    pub cloud_init_user_data_file: Option<String>,
}

impl ForesterConfig {
    /// Loads configuration without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("forester")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the offending variable and TOML key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = FieldMetadata::new(
            "registry URL",
            "FORESTER_REGISTRY_URL",
            "registry_url",
            "forester",
        );
        match self.registry_url.as_deref().map(str::trim) {
            Some(value) if value.is_empty() => return Err(url.invalid("must not be blank")),
            Some(value) if !value.starts_with("http://") && !value.starts_with("https://") => {
                return Err(url.invalid("must start with http:// or https://"));
            }
            Some(_) => {}
            None => require_field(
                &self.registry_file,
                &FieldMetadata::new(
                    "registry file",
                    "FORESTER_REGISTRY_FILE",
                    "registry_file",
                    "forester",
                ),
            )?,
        }
        if self.node_wait_timeout_secs == 0 {
            return Err(FieldMetadata::new(
                "node wait timeout",
                "FORESTER_NODE_WAIT_TIMEOUT_SECS",
                "node_wait_timeout_secs",
                "forester",
            )
            .invalid("must be positive"));
        }
        if self.call_timeout_secs == 0 {
            return Err(FieldMetadata::new(
                "call timeout",
                "FORESTER_CALL_TIMEOUT_SECS",
                "call_timeout_secs",
                "forester",
            )
            .invalid("must be positive"));
        }
        if self.conflict_retries == 0 {
            return Err(FieldMetadata::new(
                "conflict retry count",
                "FORESTER_CONFLICT_RETRIES",
                "conflict_retries",
                "forester",
            )
            .invalid("must be at least 1"));
        }
        require_optional(
            self.registry_token.as_deref(),
            &FieldMetadata::new(
                "registry token",
                "FORESTER_REGISTRY_TOKEN",
                "registry_token",
                "forester",
            ),
        )?;
        Ok(())
    }

    /// Fallback machine types in priority order.
    #[must_use]
    pub fn fallback_instance_types(&self) -> Vec<String> {
        split_list(self.fallback_instance_types.as_deref())
    }

    /// Preferred zones in priority order.
    #[must_use]
    pub fn preferred_zones(&self) -> Vec<String> {
        split_list(self.preferred_zones.as_deref())
    }

    /// Orchestrator timeouts and retry policy.
    #[must_use]
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            node_wait_timeout: Duration::from_secs(self.node_wait_timeout_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            conflict_retry: ConflictRetry::with_attempts(self.conflict_retries),
        }
    }

    /// Resolves the configured cloud-init user-data.
    ///
    /// # Errors
    ///
    /// Returns [`CloudInitError`] when both sources are set, a source is
    /// blank, or the file cannot be read.
    pub fn user_data(&self) -> Result<NodeUserData, CloudInitError> {
        resolve_cloud_init_user_data(
            self.cloud_init_user_data.as_deref(),
            self.cloud_init_user_data_file.as_deref(),
        )
        .map(NodeUserData::new)
    }

    /// Opens the configured registry backend.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the local file exists but cannot be
    /// read or parsed.
    pub fn open_registry(&self) -> Result<Arc<dyn Registry>, RegistryError> {
        if let Some(url) = self.registry_url.as_deref() {
            return Ok(Arc::new(RemoteRegistry::new(
                url.trim(),
                self.registry_token.clone(),
            )));
        }
        Ok(Arc::new(LocalRegistry::open(self.registry_file.trim())?))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
