//! DNS hook invoked for every registered node.
//!
//! Record creation is best effort: the orchestrator logs a failed publish
//! and carries on, so a broken DNS zone never rolls back healthy servers.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::registry::{Forest, Node};

/// Errors raised by a [`DnsProvisioner`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DnsError {
    /// Raised when the DNS service refuses the record.
    #[error("DNS record {record} rejected: {message}")]
    Rejected {
        /// Record name.
        record: String,
        /// Reason reported by the DNS service.
        message: String,
    },
    /// Raised when the DNS service cannot be reached.
    #[error("DNS service unreachable: {0}")]
    Unreachable(String),
}

/// Future returned by DNS hook operations.
pub type DnsFuture<'a> = Pin<Box<dyn Future<Output = Result<(), DnsError>> + Send + 'a>>;

/// Publishes and retracts address records for forest nodes.
pub trait DnsProvisioner: Send + Sync {
    /// Creates or updates the records for `node`.
    fn publish<'a>(&'a self, forest: &'a Forest, node: &'a Node) -> DnsFuture<'a>;

    /// Removes the records for `node`.
    fn retract<'a>(&'a self, forest: &'a Forest, node: &'a Node) -> DnsFuture<'a>;
}
