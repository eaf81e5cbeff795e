//! Errors surfaced by the forest orchestrator.

use thiserror::Error;

use crate::interrupt::Interrupted;
use crate::registry::{ForestStatus, RegistryError};
use crate::selection::{Placement, SelectionError};

/// Errors surfaced while provisioning, growing, or tearing down a forest.
#[derive(Debug, Error)]
pub enum OrchestratorError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Raised when growth targets a forest that is not active.
    #[error("forest {forest_id} is {status}; only active forests can grow")]
    ForestNotActive {
        /// Forest identifier.
        forest_id: String,
        /// Current status.
        status: ForestStatus,
    },
    /// Raised when a registry call fails.
    #[error("registry {operation} failed: {source}")]
    Registry {
        /// Registry operation that failed.
        operation: &'static str,
        /// Registry error.
        source: RegistryError,
    },
    /// Raised when no placement accepts the first node.
    #[error("no placement for {node}: {source}")]
    Selection {
        /// Node name.
        node: String,
        /// Selection error.
        source: SelectionError<E>,
    },
    /// Raised when the provider refuses to create a server.
    #[error("failed to create {node} ({placement}): {source}")]
    Create {
        /// Node name.
        node: String,
        /// Placement requested.
        placement: Placement,
        /// Provider error.
        source: E,
    },
    /// Raised when a server does not reach the running state.
    #[error("{node} did not become ready: {source}")]
    Wait {
        /// Node name.
        node: String,
        /// Provider error.
        source: E,
    },
    /// Raised when a running server reports no public address.
    #[error("{node} is running but has no public address")]
    MissingAddress {
        /// Node name.
        node: String,
    },
    /// Raised when a call was cancelled or exceeded its deadline.
    #[error("{stage} interrupted: {reason}")]
    Interrupted {
        /// What was in progress.
        stage: String,
        /// Cancellation or timeout.
        reason: Interrupted,
    },
    /// Raised after a failed provisioning run has been rolled back.
    #[error(
        "{source}; forest {forest_id} rolled back ({deleted} server(s) deleted{})",
        failure_note(.failures)
    )]
    RolledBack {
        /// Forest identifier.
        forest_id: String,
        /// Servers deleted by the rollback.
        deleted: usize,
        /// Clean-up steps that failed.
        failures: Vec<String>,
        /// Error that triggered the rollback.
        source: Box<Self>,
    },
}

impl<E> OrchestratorError<E>
where
    E: std::error::Error + 'static,
{
    /// Error that started the failure, looking through a rollback wrapper.
    #[must_use]
    pub fn cause(&self) -> &Self {
        match self {
            Self::RolledBack { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Returns true when the operation stopped because it was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.cause(),
            Self::Interrupted {
                reason: Interrupted::Cancelled,
                ..
            } | Self::Selection {
                source: SelectionError::Interrupted {
                    reason: Interrupted::Cancelled,
                    ..
                },
                ..
            }
        )
    }
}

fn failure_note(failures: &[String]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        format!("; clean-up also failed: {}", failures.join("; "))
    }
}
