//! Best-effort forest teardown.

use std::collections::BTreeSet;

use tracing::{info, warn};

use super::{ForestOrchestrator, OrchestratorError};
use crate::interrupt::CallGuard;
use crate::provider::{MachineProvider, ServerFilter, ServerHandle};
use crate::registry::{Forest, ForestStatus, Node, Registry};

/// Outcome of a teardown.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TeardownSummary {
    /// Forest identifier.
    pub forest_id: String,
    /// Registered nodes whose servers were deleted.
    pub deleted: Vec<String>,
    /// Forest-labelled servers that had no node record and were deleted.
    pub orphans: Vec<String>,
    /// Servers that could not be deleted, with the reason.
    pub failures: Vec<(String, String)>,
}

impl TeardownSummary {
    /// Returns true when every server was deleted.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl<P, R> ForestOrchestrator<P, R>
where
    P: MachineProvider,
    R: Registry + ?Sized,
{
    /// Deletes every server of a forest and removes its registry records.
    ///
    /// Individual delete failures are logged and collected in the summary;
    /// they never stop the remaining deletions. Forest-labelled servers with
    /// no node record are deleted too. The forest record is removed last.
    ///
    /// # Errors
    ///
    /// Returns a registry error when the forest cannot be read (including
    /// when it does not exist) or its record cannot be removed.
    pub async fn teardown(
        &self,
        forest_id: &str,
    ) -> Result<TeardownSummary, OrchestratorError<P::Error>> {
        let guard = CallGuard::deadline_only(self.settings.call_timeout);
        let forest = self
            .read(&guard, "get forest", || self.registry.get_forest(forest_id))
            .await?;
        let nodes = self
            .read(&guard, "get nodes", || self.registry.get_nodes(forest_id))
            .await?;

        if let Err(err) = self
            .write(&guard, "mark forest destroying", || {
                self.registry
                    .update_forest_status(forest_id, ForestStatus::Destroying)
            })
            .await
        {
            warn!(forest_id, error = %err, "could not mark forest as destroying");
        }
        info!(forest_id, nodes = nodes.len(), "tearing down forest");

        let mut summary = TeardownSummary {
            forest_id: forest_id.to_owned(),
            ..TeardownSummary::default()
        };
        for node in &nodes {
            let handle = ServerHandle {
                id: node.id.clone(),
                location: node.location.clone(),
            };
            match guard.run(self.provider.delete_server(handle)).await {
                Ok(Ok(())) => {
                    info!(forest_id, node = %node.name, server_id = %node.id, "node deleted");
                    summary.deleted.push(node.id.clone());
                    self.retract_dns(&forest, node, &guard).await;
                }
                Ok(Err(err)) => {
                    warn!(forest_id, node = %node.name, error = %err, "failed to delete node");
                    summary.failures.push((node.id.clone(), err.to_string()));
                }
                Err(reason) => {
                    warn!(forest_id, node = %node.name, error = %reason, "node deletion interrupted");
                    summary.failures.push((node.id.clone(), reason.to_string()));
                }
            }
        }

        let known: BTreeSet<&str> = nodes.iter().map(|node| node.id.as_str()).collect();
        self.sweep_orphans(&forest, &known, &guard, &mut summary)
            .await;

        self.write(&guard, "delete forest", || {
            self.registry.delete_forest(forest_id)
        })
        .await?;

        if summary.is_clean() {
            info!(
                forest_id,
                deleted = summary.deleted.len(),
                orphans = summary.orphans.len(),
                "forest destroyed"
            );
        } else {
            warn!(
                forest_id,
                deleted = summary.deleted.len(),
                failures = summary.failures.len(),
                "forest removed from the registry; some servers may still exist"
            );
        }
        Ok(summary)
    }

    async fn sweep_orphans(
        &self,
        forest: &Forest,
        known: &BTreeSet<&str>,
        guard: &CallGuard,
        summary: &mut TeardownSummary,
    ) {
        let filter = ServerFilter::for_forest(&forest.id);
        let servers = match guard.run(self.provider.list_servers(&filter)).await {
            Ok(Ok(servers)) => servers,
            Ok(Err(err)) => {
                warn!(forest_id = %forest.id, error = %err, "could not list forest servers");
                return;
            }
            Err(reason) => {
                warn!(forest_id = %forest.id, error = %reason, "listing forest servers interrupted");
                return;
            }
        };
        for server in servers {
            if known.contains(server.handle.id.as_str()) {
                continue;
            }
            let id = server.handle.id.clone();
            match guard.run(self.provider.delete_server(server.handle)).await {
                Ok(Ok(())) => {
                    info!(forest_id = %forest.id, server_id = %id, "orphaned server deleted");
                    summary.orphans.push(id);
                }
                Ok(Err(err)) => {
                    warn!(forest_id = %forest.id, server_id = %id, error = %err, "failed to delete orphaned server");
                    summary.failures.push((id, err.to_string()));
                }
                Err(reason) => {
                    summary.failures.push((id, reason.to_string()));
                }
            }
        }
    }

    pub(super) async fn retract_dns(&self, forest: &Forest, node: &Node, guard: &CallGuard) {
        let Some(dns) = &self.dns else {
            return;
        };
        match guard.run(dns.retract(forest, node)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(forest_id = %forest.id, node = %node.name, error = %err, "DNS retract failed");
            }
            Err(reason) => {
                warn!(forest_id = %forest.id, node = %node.name, error = %reason, "DNS retract interrupted");
            }
        }
    }
}
