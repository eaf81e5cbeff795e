//! Undoing a failed provisioning or growth attempt.

use std::collections::BTreeSet;
use std::future::Future;

use tracing::{info, warn};

use super::{ForestOrchestrator, OrchestratorError, Progress};
use crate::interrupt::CallGuard;
use crate::provider::{MachineProvider, ServerFilter, ServerHandle};
use crate::registry::{
    Forest, ForestChange, ForestStatus, NodeStatus, Registry, RegistryError,
};

/// What the failed attempt was doing to the forest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum RollbackScope {
    /// Creating the forest from scratch.
    Provision,
    /// Adding nodes to an active forest.
    Growth,
}

impl<P, R> ForestOrchestrator<P, R>
where
    P: MachineProvider,
    R: Registry + ?Sized,
{
    /// Deletes every server the attempt created and brings the registry back
    /// in line with what still exists.
    ///
    /// Clean-up ignores cancellation; each call is still bounded by the
    /// per-call deadline. Servers listed in `keep` are never touched.
    pub(super) async fn roll_back(
        &self,
        forest: &Forest,
        progress: &Progress,
        keep: &BTreeSet<String>,
        scope: RollbackScope,
        cause: OrchestratorError<P::Error>,
        guard: &CallGuard,
    ) -> OrchestratorError<P::Error> {
        let cleanup = guard.detached();
        warn!(
            forest_id = %forest.id,
            error = %cause,
            servers = progress.created.len(),
            "rolling back"
        );
        let mut failures = Vec::new();
        let mut attempted = BTreeSet::new();
        let mut deleted = BTreeSet::new();

        for handle in progress.created.iter().rev() {
            attempted.insert(handle.id.clone());
            if self
                .delete_for_rollback(handle.clone(), &cleanup, &mut failures)
                .await
            {
                deleted.insert(handle.id.clone());
            }
        }

        // Creates that were abandoned mid-call may still have produced a server.
        let filter = ServerFilter::for_forest(&forest.id);
        match cleanup.run(self.provider.list_servers(&filter)).await {
            Ok(Ok(servers)) => {
                for server in servers {
                    let id = server.handle.id.clone();
                    if keep.contains(&id) || attempted.contains(&id) {
                        continue;
                    }
                    info!(forest_id = %forest.id, server_id = %id, "deleting orphaned server");
                    attempted.insert(id.clone());
                    if self
                        .delete_for_rollback(server.handle, &cleanup, &mut failures)
                        .await
                    {
                        deleted.insert(id);
                    }
                }
            }
            Ok(Err(err)) => failures.push(format!("list servers: {err}")),
            Err(reason) => failures.push(format!("list servers: {reason}")),
        }

        let registered: BTreeSet<&str> = progress
            .registered
            .iter()
            .map(|node| node.id.as_str())
            .collect();
        for node in &progress.registered {
            if deleted.contains(&node.id) {
                if let Err(note) = self
                    .cleanup_write(&cleanup, "remove node", || {
                        self.registry.remove_node(&forest.id, &node.id)
                    })
                    .await
                {
                    failures.push(format!("remove node record {}: {note}", node.name));
                }
                self.retract_dns(forest, node, &cleanup).await;
            } else {
                if let Err(note) = self
                    .cleanup_write(&cleanup, "mark node failed", || {
                        self.registry
                            .update_node_status(&forest.id, &node.id, NodeStatus::Failed)
                    })
                    .await
                {
                    failures.push(format!("mark node {} failed: {note}", node.name));
                }
            }
        }
        // A registration interrupted mid-write may have landed unobserved.
        for id in deleted.iter().filter(|id| !registered.contains(id.as_str())) {
            if let Err(note) = self
                .cleanup_write(&cleanup, "remove node", || {
                    self.registry.remove_node(&forest.id, id)
                })
                .await
            {
                failures.push(format!("remove node record {id}: {note}"));
            }
        }

        // The size is recounted inside the write so a concurrent writer's
        // nodes are never dropped from it.
        let status = match scope {
            RollbackScope::Provision => Some(ForestStatus::Failed),
            RollbackScope::Growth => None,
        };
        if let Err(note) = self
            .cleanup_write(&cleanup, "settle forest", || {
                self.registry
                    .amend_forest(&forest.id, ForestChange::settle(status))
            })
            .await
        {
            failures.push(format!("update forest record: {note}"));
        }

        if failures.is_empty() {
            info!(forest_id = %forest.id, deleted = deleted.len(), "rollback complete");
        } else {
            warn!(
                forest_id = %forest.id,
                deleted = deleted.len(),
                failures = failures.len(),
                "rollback incomplete"
            );
        }
        OrchestratorError::RolledBack {
            forest_id: forest.id.clone(),
            deleted: deleted.len(),
            failures,
            source: Box::new(cause),
        }
    }

    async fn delete_for_rollback(
        &self,
        handle: ServerHandle,
        cleanup: &CallGuard,
        failures: &mut Vec<String>,
    ) -> bool {
        let id = handle.id.clone();
        match cleanup.run(self.provider.delete_server(handle)).await {
            Ok(Ok(())) => {
                info!(server_id = %id, "server deleted");
                true
            }
            Ok(Err(err)) => {
                warn!(server_id = %id, error = %err, "failed to delete server");
                failures.push(format!("delete server {id}: {err}"));
                false
            }
            Err(reason) => {
                warn!(server_id = %id, error = %reason, "server deletion interrupted");
                failures.push(format!("delete server {id}: {reason}"));
                false
            }
        }
    }

    /// Registry write for clean-up paths; a missing record counts as done.
    pub(super) async fn cleanup_write<T, F, Fut>(
        &self,
        cleanup: &CallGuard,
        operation: &'static str,
        call: F,
    ) -> Result<(), String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let retry = self.settings.conflict_retry;
        match cleanup.run(retry.run(operation, call)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) if err.is_not_found() => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(reason) => Err(reason.to_string()),
        }
    }
}
