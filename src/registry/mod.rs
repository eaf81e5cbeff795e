//! Forest and node registry.
//!
//! The registry is the single source of truth for which forests exist and
//! which nodes belong to them. Two backends share the [`Registry`] contract:
//!
//! - [`LocalRegistry`] keeps the snapshot in memory and persists it to a JSON
//!   file on every mutation. It is only safe for a single process.
//! - [`RemoteRegistry`] stores the same JSON document behind an HTTP endpoint
//!   and uses entity tags for compare-and-swap writes so concurrent writers
//!   never lose each other's updates.
//!
//! Neither backend retries a conflicting write; a
//! [`RegistryError::ConcurrentModification`] is returned to the caller, which
//! decides whether to re-read and try again.

mod error;
mod local;
mod model;
mod remote;

use std::future::Future;
use std::pin::Pin;

pub use error::RegistryError;
pub use local::LocalRegistry;
pub use model::{
    FOREST_ID_PREFIX, Forest, ForestChange, ForestStatus, Node, NodeRole, NodeStatus, RegistryData,
    generate_forest_id, node_name,
};
pub use remote::{RemoteRegistry, Snapshot};

/// Future returned by fallible registry operations.
pub type RegistryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RegistryError>> + Send + 'a>>;

/// Future returned by registry operations that cannot fail.
pub type InfallibleFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persistence contract shared by every registry backend.
pub trait Registry: Send + Sync {
    /// Human readable location of the backing store (path or URL).
    fn endpoint(&self) -> String;

    /// Registers a new forest in `provisioning` status with no nodes.
    fn register_forest(&self, forest: Forest) -> RegistryFuture<'_, ()>;

    /// Appends a node to an existing forest. Identifiers and sequence
    /// numbers are unique within a forest.
    fn register_node(&self, node: Node) -> RegistryFuture<'_, ()>;

    /// Removes one node record and returns it.
    fn remove_node<'a>(&'a self, forest_id: &'a str, node_id: &'a str)
    -> RegistryFuture<'a, Node>;

    /// Fetches a forest record.
    fn get_forest<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, Forest>;

    /// Fetches the nodes of a forest in registration order.
    fn get_nodes<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, Vec<Node>>;

    /// Replaces the mutable fields of a forest, keeping its creation time.
    fn update_forest(&self, forest: Forest) -> RegistryFuture<'_, ()>;

    /// Applies a targeted change to a forest in one read-modify-write and
    /// returns the stored record.
    fn amend_forest<'a>(
        &'a self,
        forest_id: &'a str,
        change: ForestChange,
    ) -> RegistryFuture<'a, Forest>;

    /// Sets the status of a forest.
    fn update_forest_status<'a>(
        &'a self,
        forest_id: &'a str,
        status: ForestStatus,
    ) -> RegistryFuture<'a, ()>;

    /// Sets the status of a node.
    fn update_node_status<'a>(
        &'a self,
        forest_id: &'a str,
        node_id: &'a str,
        status: NodeStatus,
    ) -> RegistryFuture<'a, ()>;

    /// Removes a forest and every node it owns in one write.
    fn delete_forest<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, ()>;

    /// Lists every forest. Read failures are logged and yield an empty list.
    fn list_forests(&self) -> InfallibleFuture<'_, Vec<Forest>>;

    /// Checks that the backing store is reachable and accepts our credentials.
    fn check_reachable(&self) -> RegistryFuture<'_, ()>;
}
