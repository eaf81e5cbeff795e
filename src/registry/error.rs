//! Error types shared by every registry backend.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised by the registry contract.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Raised when the forest is not registered.
    #[error("forest {forest_id} not found")]
    ForestNotFound {
        /// Identifier that was looked up.
        forest_id: String,
    },
    /// Raised when the node is not registered under the forest.
    #[error("node {node_id} not found in forest {forest_id}")]
    NodeNotFound {
        /// Owning forest identifier.
        forest_id: String,
        /// Node identifier that was looked up.
        node_id: String,
    },
    /// Raised when a forest with the same identifier already exists.
    #[error("forest {forest_id} already exists")]
    ForestExists {
        /// Conflicting identifier.
        forest_id: String,
    },
    /// Raised when a node with the same identifier is already registered.
    #[error("node {node_id} already registered in forest {forest_id}")]
    NodeExists {
        /// Owning forest identifier.
        forest_id: String,
        /// Conflicting node identifier.
        node_id: String,
    },
    /// Raised when another node of the forest already holds the sequence.
    #[error("sequence {sequence} is already taken in forest {forest_id}")]
    SequenceTaken {
        /// Owning forest identifier.
        forest_id: String,
        /// Conflicting sequence number.
        sequence: u32,
    },
    /// Raised when another writer changed the registry since it was read.
    #[error("registry was modified concurrently; re-read and retry")]
    ConcurrentModification,
    /// Raised when the registry endpoint cannot be reached at all.
    #[error("cannot reach registry at {endpoint}: {message}")]
    Unreachable {
        /// Endpoint that was contacted.
        endpoint: String,
        /// Transport error message.
        message: String,
    },
    /// Raised when the registry rejects the supplied credential.
    #[error("registry at {endpoint} rejected credentials (HTTP {status})")]
    Unauthorized {
        /// Endpoint that was contacted.
        endpoint: String,
        /// HTTP status code returned.
        status: u16,
    },
    /// Raised when the registry answers with an unexpected status.
    #[error("registry at {endpoint} returned HTTP {status}: {message}")]
    UnexpectedStatus {
        /// Endpoint that was contacted.
        endpoint: String,
        /// HTTP status code returned.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },
    /// Raised when the local registry file cannot be read or written.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the registry document cannot be encoded or decoded.
    #[error("invalid registry document: {message}")]
    Document {
        /// Parser or encoder error message.
        message: String,
    },
}

impl RegistryError {
    /// Returns true for the optimistic-concurrency conflict sentinel.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrentModification)
    }

    /// Returns true when the error reports a missing forest or node.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::ForestNotFound { .. } | Self::NodeNotFound { .. })
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(value: serde_json::Error) -> Self {
        Self::Document {
            message: value.to_string(),
        }
    }
}
