//! Core library for the Forester cluster provisioning tool.
//!
//! A forest is a group of servers created together on one cloud account and
//! tracked in a shared registry. The crate exposes:
//!
//! - [`provider::MachineProvider`], the capability set consumed from a cloud
//!   API, and its Scaleway implementation [`ScalewayProvider`];
//! - [`registry::Registry`] with a local JSON file backend and a remote HTTP
//!   backend using conditional writes;
//! - the placement [`selection`] algorithm that falls back across machine
//!   types and zones when capacity runs out;
//! - [`ForestOrchestrator`], which provisions, grows, and tears down forests
//!   and rolls back partial failures.

pub mod cloud_init;
pub mod config;
pub mod dns;
pub mod interrupt;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod scaleway;
pub mod selection;
pub mod test_support;

pub use cloud_init::{CloudInitError, NodeUserData};
pub use config::{ConfigError, ForesterConfig, ScalewayConfig};
pub use dns::{DnsError, DnsProvisioner};
pub use interrupt::{CallGuard, Interrupted};
pub use orchestrator::{
    ConflictRetry, ForestOrchestrator, ForestReport, OrchestratorError, OrchestratorSettings,
    ProvisionRequest, TeardownSummary,
};
pub use provider::{
    MachineProvider, NodeAddresses, ServerDetails, ServerFilter, ServerHandle, ServerSpec,
    ServerState,
};
pub use registry::{
    Forest, ForestChange, ForestStatus, LocalRegistry, Node, NodeRole, NodeStatus, Registry,
    RegistryData, RegistryError, RemoteRegistry,
};
pub use scaleway::{ScalewayProvider, ScalewayProviderError};
pub use selection::{Placement, SelectionError, SelectionRequest, Selector, is_capacity_error};
