//! Error types for the Scaleway provider.

use crate::config::ConfigError;
use crate::provider::ProviderError;
use scaleway_rs::ScalewayError;
use thiserror::Error;

/// Errors raised by the Scaleway provider.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayProviderError {
    /// Raised when the high-level configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a request is missing a required field.
    #[error("invalid server request: {0}")]
    Validation(String),
    /// Raised when the requested image label cannot be resolved.
    #[error("image '{label}' (arch {arch}) not found in zone {zone}")]
    ImageNotFound {
        /// Image label passed by the caller.
        label: String,
        /// Architecture requested by the caller.
        arch: String,
        /// Zone used for the lookup.
        zone: String,
    },
    /// Raised when the server type cannot be placed in the zone at all.
    #[error("server type '{server_type}' is not available in zone {zone}")]
    ServerTypeUnavailable {
        /// Requested commercial type.
        server_type: String,
        /// Target zone.
        zone: String,
    },
    /// Raised when the zone has no stock left for the server type.
    #[error("server type '{server_type}' is out of stock in zone {zone}")]
    OutOfStock {
        /// Requested commercial type.
        server_type: String,
        /// Target zone.
        zone: String,
    },
    /// Raised when an asynchronous operation exceeds the timeout.
    #[error("timeout waiting for {action} on server {server_id}")]
    Timeout {
        /// Action being waited on.
        action: String,
        /// Provider server identifier.
        server_id: String,
    },
    /// Raised when a server enters a state it cannot leave on its own.
    #[error("server {server_id} entered state {state}")]
    ServerFailed {
        /// Provider server identifier.
        server_id: String,
        /// State reported by the provider.
        state: String,
    },
    /// Raised when teardown leaves a server visible in the API.
    #[error("server {server_id} still present after teardown")]
    ResidualResource {
        /// Provider server identifier.
        server_id: String,
    },
    /// Raised when a server cannot be powered on.
    #[error("server {server_id} in state {state} cannot be powered on")]
    PowerOnNotAllowed {
        /// Provider server identifier.
        server_id: String,
        /// Current state reported by the provider.
        state: String,
    },
    /// Raised when the API answers with an unexpected status.
    #[error("Scaleway API returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or error message.
        message: String,
    },
    /// Wrapper for transport and SDK level failures.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the HTTP client or SDK.
        message: String,
    },
}

impl From<ScalewayError> for ScalewayProviderError {
    fn from(value: ScalewayError) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}

impl From<reqwest::Error> for ScalewayProviderError {
    fn from(value: reqwest::Error) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for ScalewayProviderError {
    fn from(value: serde_json::Error) -> Self {
        Self::Provider {
            message: format!("unexpected response body: {value}"),
        }
    }
}

impl From<ProviderError> for ScalewayProviderError {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::Validation(field) => Self::Validation(field),
        }
    }
}

impl From<ConfigError> for ScalewayProviderError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
