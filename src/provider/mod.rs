//! Machine provider capability consumed by the selection algorithm and the
//! orchestrator.
//!
//! The orchestrator never talks to a concrete cloud API. Everything it needs
//! from a provider is expressed by [`MachineProvider`]; the Scaleway
//! implementation lives in [`crate::scaleway`] and tests use the scripted
//! double in [`crate::test_support`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label key used to tag every server with its owning forest.
pub const FOREST_LABEL: &str = "forest";
/// Label key used to tag every server with its node role.
pub const ROLE_LABEL: &str = "role";

/// Parameters required to create a new server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerSpec {
    /// Server name, also used as the node's deterministic name.
    pub name: String,
    /// Commercial type or flavour to request (for example `DEV1-S`).
    pub machine_type: String,
    /// Target location (availability zone).
    pub location: String,
    /// Human readable image label resolved by the provider.
    pub image: String,
    /// Labels attached to the server (forest ownership, role).
    pub labels: BTreeMap<String, String>,
    /// Optional cloud-init user-data applied on first boot.
    pub user_data: Option<String>,
}

impl ServerSpec {
    /// Creates a spec with no labels and no user-data.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        machine_type: impl Into<String>,
        location: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            machine_type: machine_type.into(),
            location: location.into(),
            image: image.into(),
            labels: BTreeMap::new(),
            user_data: None,
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Sets optional cloud-init user-data.
    #[must_use]
    pub fn with_user_data(mut self, user_data: Option<String>) -> Self {
        self.user_data = user_data;
        self
    }

    /// Validates the server spec, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] when any required string field is
    /// blank or the user-data is blank.
    pub fn validate(&self) -> Result<(), ProviderError> {
        let required = [
            ("name", &self.name),
            ("machine_type", &self.machine_type),
            ("location", &self.location),
            ("image", &self.image),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ProviderError::Validation((*field).to_owned()));
        }
        if self
            .user_data
            .as_deref()
            .is_some_and(|data| data.trim().is_empty())
        {
            return Err(ProviderError::Validation("user_data".to_owned()));
        }
        Ok(())
    }

    /// Returns the forest this server belongs to, when labelled.
    #[must_use]
    pub fn forest_id(&self) -> Option<&str> {
        self.labels.get(FOREST_LABEL).map(String::as_str)
    }
}

/// Handle returned by a provider once a server has been created.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ServerHandle {
    /// Provider specific identifier for the server.
    pub id: String,
    /// Location in which the server was created.
    pub location: String,
}

/// Lifecycle state reported by a provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerState {
    /// Server is booting or being allocated.
    Starting,
    /// Server is running.
    Running,
    /// Server is powered off.
    Stopped,
    /// Server is being removed.
    Deleting,
    /// Any provider state without a portable meaning.
    Other(String),
}

impl ServerState {
    /// Maps a provider state string onto a portable state.
    #[must_use]
    pub fn from_provider(value: &str) -> Self {
        match value {
            "starting" | "initializing" | "allocating" => Self::Starting,
            "running" => Self::Running,
            "stopped" | "stopped in place" | "off" => Self::Stopped,
            "stopping" | "deleting" | "terminating" => Self::Deleting,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Deleting => f.write_str("deleting"),
            Self::Other(state) => f.write_str(state),
        }
    }
}

/// Dual-stack address pair; at least one family is always present.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNodeAddresses")]
pub struct NodeAddresses {
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
}

/// Wire form of [`NodeAddresses`] before the one-family rule is checked.
#[derive(Deserialize)]
struct RawNodeAddresses {
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
}

impl TryFrom<RawNodeAddresses> for NodeAddresses {
    type Error = &'static str;

    fn try_from(raw: RawNodeAddresses) -> Result<Self, Self::Error> {
        Self::new(raw.ipv4, raw.ipv6).ok_or("node addresses need an IPv4 or an IPv6 address")
    }
}

impl NodeAddresses {
    /// Builds an address pair, returning `None` when both families are absent.
    #[must_use]
    pub const fn new(ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) -> Option<Self> {
        if ipv4.is_none() && ipv6.is_none() {
            return None;
        }
        Some(Self { ipv4, ipv6 })
    }

    /// Public IPv4 address, when assigned.
    #[must_use]
    pub const fn ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4
    }

    /// Public IPv6 address, when assigned.
    #[must_use]
    pub const fn ipv6(&self) -> Option<Ipv6Addr> {
        self.ipv6
    }
}

impl fmt::Display for NodeAddresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ipv4, self.ipv6) {
            (Some(v4), Some(v6)) => write!(f, "{v4} / {v6}"),
            (Some(v4), None) => write!(f, "{v4}"),
            (None, Some(v6)) => write!(f, "{v6}"),
            (None, None) => f.write_str("-"),
        }
    }
}

/// Snapshot of a server as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerDetails {
    /// Handle identifying the server.
    pub handle: ServerHandle,
    /// Server name.
    pub name: String,
    /// Current lifecycle state.
    pub state: ServerState,
    /// Public addresses, when any have been assigned.
    pub addresses: Option<NodeAddresses>,
    /// Labels attached to the server.
    pub labels: BTreeMap<String, String>,
}

/// Filters applied when listing servers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerFilter {
    /// Only return servers carrying every one of these labels.
    pub labels: BTreeMap<String, String>,
    /// Restrict the search to these locations; empty means every location.
    pub locations: Vec<String>,
}

impl ServerFilter {
    /// Filter matching every server labelled with the given forest.
    #[must_use]
    pub fn for_forest(forest_id: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(FOREST_LABEL.to_owned(), forest_id.to_owned());
        Self {
            labels,
            locations: Vec::new(),
        }
    }

    /// Returns true when the server's labels satisfy the filter.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

/// Errors raised while building provider requests.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Capability set the orchestrator needs from a single cloud account.
///
/// Errors whose text names a capacity or location problem are treated as
/// retryable elsewhere by [`crate::selection::is_capacity_error`]; every other
/// error is fatal for the operation in progress.
pub trait MachineProvider: Send + Sync {
    /// Provider specific error type returned by the provider.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Short provider name recorded on each forest.
    fn name(&self) -> &str;

    /// Creates a server and returns a handle used for subsequent calls.
    fn create_server<'a>(
        &'a self,
        spec: &'a ServerSpec,
    ) -> ProviderFuture<'a, ServerHandle, Self::Error>;

    /// Polls until the server reaches `target`, failing after `timeout`.
    fn wait_for_server<'a>(
        &'a self,
        handle: &'a ServerHandle,
        target: ServerState,
        timeout: Duration,
    ) -> ProviderFuture<'a, ServerDetails, Self::Error>;

    /// Deletes the server. A server that is already gone is not an error.
    fn delete_server(&self, handle: ServerHandle) -> ProviderFuture<'_, (), Self::Error>;

    /// Lists servers matching the filter.
    fn list_servers<'a>(
        &'a self,
        filter: &'a ServerFilter,
    ) -> ProviderFuture<'a, Vec<ServerDetails>, Self::Error>;

    /// Returns the locations where `machine_type` can currently be created.
    fn available_locations<'a>(
        &'a self,
        machine_type: &'a str,
    ) -> ProviderFuture<'a, Vec<String>, Self::Error>;

    /// Returns whether `machine_type` exists in the provider's catalogue.
    fn validate_server_type<'a>(
        &'a self,
        machine_type: &'a str,
    ) -> ProviderFuture<'a, bool, Self::Error>;
}
