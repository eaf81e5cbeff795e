//! Forest provisioning, growth, and teardown.
//!
//! The orchestrator drives one [`MachineProvider`] and one [`Registry`]:
//!
//! 1. Register the forest in `provisioning` status.
//! 2. Create the first node through the fallback [`Selector`]; the placement
//!    that accepts it becomes the forest's placement.
//! 3. Create the remaining nodes one at a time at that placement. Each node
//!    is waited on until running, registered as `active`, then handed to the
//!    optional DNS hook.
//! 4. Mark the forest `active`.
//!
//! Any failure, timeout, or cancellation along the way rolls the attempt
//! back: every server created by the attempt is deleted, its node record is
//! removed, and the forest is left in `failed` status for inspection.
//!
//! Provider calls are strictly sequential. Node numbering follows creation
//! order, so growing a forest continues from its highest sequence number.
//! Forest size is always recounted inside the registry write, so concurrent
//! growth of one forest cannot lose another operator's nodes.

mod error;
mod retry;
mod rollback;
mod teardown;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cloud_init::NodeUserData;
use crate::dns::DnsProvisioner;
use crate::interrupt::CallGuard;
use crate::provider::{
    FOREST_LABEL, MachineProvider, ROLE_LABEL, ServerHandle, ServerSpec, ServerState,
};
use crate::registry::{
    Forest, ForestChange, ForestStatus, Node, NodeRole, NodeStatus, Registry, RegistryError,
    generate_forest_id, node_name,
};
use crate::selection::{Placement, SelectionRequest, Selector};

pub use error::OrchestratorError;
pub use retry::ConflictRetry;
pub use teardown::TeardownSummary;

use rollback::RollbackScope;

const DEFAULT_NODE_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(600);
const WAIT_GRACE: Duration = Duration::from_secs(30);

/// Timeouts and retry policy used by the orchestrator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OrchestratorSettings {
    /// How long a new server may take to reach the running state.
    pub node_wait_timeout: Duration,
    /// Deadline applied to every other provider and registry call.
    pub call_timeout: Duration,
    /// Retry policy for conflicting registry writes.
    pub conflict_retry: ConflictRetry,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            node_wait_timeout: DEFAULT_NODE_WAIT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            conflict_retry: ConflictRetry::default(),
        }
    }
}

/// Parameters for provisioning a new forest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionRequest {
    forest_id: Option<String>,
    node_count: u32,
    selection: SelectionRequest,
    image: String,
}

impl ProvisionRequest {
    /// Creates a request for `node_count` nodes booting `image`.
    #[must_use]
    pub fn new(node_count: u32, selection: SelectionRequest, image: impl Into<String>) -> Self {
        Self {
            forest_id: None,
            node_count,
            selection,
            image: image.into().trim().to_owned(),
        }
    }

    /// Uses an explicit forest identifier instead of a generated one.
    #[must_use]
    pub fn with_forest_id(mut self, forest_id: impl Into<String>) -> Self {
        self.forest_id = Some(forest_id.into());
        self
    }

    /// Requested number of nodes.
    #[must_use]
    pub const fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Machine types and locations to try.
    #[must_use]
    pub const fn selection(&self) -> &SelectionRequest {
        &self.selection
    }

    /// Image label.
    #[must_use]
    pub fn image(&self) -> &str {
        &self.image
    }

    fn validate(&self) -> Result<(), String> {
        if self.node_count == 0 {
            return Err(String::from("a forest needs at least one node"));
        }
        if self.image.is_empty() {
            return Err(String::from("an image label is required"));
        }
        if self.selection.machine_types().is_empty() {
            return Err(String::from("at least one machine type is required"));
        }
        if self.selection.is_preferred_only() && self.selection.preferred_locations().is_empty() {
            return Err(String::from("a pinned placement needs a location"));
        }
        if self
            .forest_id
            .as_deref()
            .is_some_and(|id| id.trim().is_empty())
        {
            return Err(String::from("forest identifier must not be empty"));
        }
        Ok(())
    }
}

/// A forest together with its registered nodes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ForestReport {
    /// Forest record as last written.
    pub forest: Forest,
    /// Nodes in sequence order.
    pub nodes: Vec<Node>,
}

/// Servers and node records created by the operation in progress.
#[derive(Debug, Default)]
struct Progress {
    created: Vec<ServerHandle>,
    registered: Vec<Node>,
}

/// Provisions, grows, and tears down forests.
pub struct ForestOrchestrator<P, R: ?Sized> {
    provider: P,
    registry: Arc<R>,
    dns: Option<Arc<dyn DnsProvisioner>>,
    user_data: NodeUserData,
    settings: OrchestratorSettings,
}

impl<P, R> ForestOrchestrator<P, R>
where
    P: MachineProvider,
    R: Registry + ?Sized,
{
    /// Creates an orchestrator with default settings, no DNS hook, and no
    /// user-data.
    #[must_use]
    pub fn new(provider: P, registry: Arc<R>) -> Self {
        Self {
            provider,
            registry,
            dns: None,
            user_data: NodeUserData::default(),
            settings: OrchestratorSettings::default(),
        }
    }

    /// Publishes every registered node through `dns`.
    #[must_use]
    pub fn with_dns(mut self, dns: Arc<dyn DnsProvisioner>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Sends `user_data` to every new server.
    #[must_use]
    pub fn with_user_data(mut self, user_data: NodeUserData) -> Self {
        self.user_data = user_data;
        self
    }

    /// Overrides timeouts and the conflict retry policy.
    #[must_use]
    pub const fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Machine provider.
    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Provisions a new forest.
    ///
    /// On failure the attempt is rolled back before the error is returned;
    /// the forest record stays in the registry with status `failed`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidRequest`] for malformed requests,
    /// a registry error when the forest cannot be registered, and
    /// [`OrchestratorError::RolledBack`] wrapping the original failure for
    /// anything that goes wrong after registration.
    pub async fn provision(
        &self,
        request: &ProvisionRequest,
        cancel: CancellationToken,
    ) -> Result<ForestReport, OrchestratorError<P::Error>> {
        request
            .validate()
            .map_err(OrchestratorError::InvalidRequest)?;
        let guard = CallGuard::new(cancel, self.settings.call_timeout);
        let now = Utc::now();
        let mut forest = Forest {
            id: request
                .forest_id
                .as_deref()
                .map_or_else(|| generate_forest_id(now), |id| id.trim().to_owned()),
            provider: self.provider.name().to_owned(),
            location: request
                .selection
                .preferred_locations()
                .first()
                .cloned()
                .unwrap_or_default(),
            machine_type: request
                .selection
                .machine_types()
                .first()
                .cloned()
                .unwrap_or_default(),
            image: request.image.clone(),
            size: request.node_count,
            status: ForestStatus::Provisioning,
            created_at: now,
            registry_endpoint: Some(self.registry.endpoint()),
            last_expanded_at: None,
        };

        self.write(&guard, "register forest", || {
            self.registry.register_forest(forest.clone())
        })
        .await?;
        info!(forest_id = %forest.id, nodes = request.node_count, "forest registered");

        let mut progress = Progress::default();
        match self
            .provision_nodes(&mut forest, request, &guard, &mut progress)
            .await
        {
            Ok(nodes) => {
                info!(
                    forest_id = %forest.id,
                    location = %forest.location,
                    machine_type = %forest.machine_type,
                    nodes = nodes.len(),
                    "forest active"
                );
                Ok(ForestReport { forest, nodes })
            }
            Err(err) => Err(self
                .roll_back(
                    &forest,
                    &progress,
                    &BTreeSet::new(),
                    RollbackScope::Provision,
                    err,
                    &guard,
                )
                .await),
        }
    }

    async fn provision_nodes(
        &self,
        forest: &mut Forest,
        request: &ProvisionRequest,
        guard: &CallGuard,
        progress: &mut Progress,
    ) -> Result<Vec<Node>, OrchestratorError<P::Error>> {
        let first = node_name(&forest.id, 1);
        let selected = {
            let snapshot: &Forest = forest;
            Selector::new(&self.provider, guard)
                .select(&request.selection, |placement| {
                    let spec = self.spec_for(snapshot, 1, placement);
                    async move { self.provider.create_server(&spec).await }
                })
                .await
                .map_err(|source| OrchestratorError::Selection {
                    node: first.clone(),
                    source,
                })?
        };
        progress.created.push(selected.value.clone());
        info!(
            forest_id = %forest.id,
            node = %first,
            machine_type = %selected.placement.machine_type,
            location = %selected.placement.location,
            attempts = selected.attempts,
            "placement selected"
        );

        let forest_id = forest.id.clone();
        let placement = ForestChange::placement(
            selected.placement.location.as_str(),
            selected.placement.machine_type.as_str(),
        );
        *forest = self
            .write(guard, "record placement", || {
                self.registry.amend_forest(&forest_id, placement.clone())
            })
            .await?;

        let placed: &Forest = forest;
        let count = usize::try_from(request.node_count).unwrap_or(1);
        let mut nodes = Vec::with_capacity(count);
        nodes.push(
            self.bring_up(placed, 1, selected.value, guard, progress)
                .await?,
        );
        for sequence in 2..=request.node_count {
            nodes.push(
                self.create_at(placed, sequence, &selected.placement, guard, progress)
                    .await?,
            );
        }

        *forest = self
            .write(guard, "activate forest", || {
                self.registry
                    .amend_forest(&forest_id, ForestChange::settle(Some(ForestStatus::Active)))
            })
            .await?;
        Ok(nodes)
    }

    /// Adds `additional` nodes to an active forest.
    ///
    /// New nodes continue the forest's numbering and use its recorded
    /// placement. On success the forest's size is recounted from the
    /// registered nodes and its expansion timestamp is stamped; on failure
    /// only the new nodes are rolled back.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ForestNotActive`] unless the forest is
    /// active, a registry error when it cannot be read, and
    /// [`OrchestratorError::RolledBack`] for failures after the first new
    /// server was requested.
    pub async fn grow(
        &self,
        forest_id: &str,
        additional: u32,
        cancel: CancellationToken,
    ) -> Result<ForestReport, OrchestratorError<P::Error>> {
        if additional == 0 {
            return Err(OrchestratorError::InvalidRequest(String::from(
                "growth must add at least one node",
            )));
        }
        let guard = CallGuard::new(cancel, self.settings.call_timeout);
        let forest = self
            .read(&guard, "get forest", || self.registry.get_forest(forest_id))
            .await?;
        if forest.status != ForestStatus::Active {
            return Err(OrchestratorError::ForestNotActive {
                forest_id: forest.id,
                status: forest.status,
            });
        }
        let existing = self
            .read(&guard, "get nodes", || self.registry.get_nodes(forest_id))
            .await?;

        let registered = u32::try_from(existing.len()).unwrap_or(u32::MAX);
        let highest = existing
            .iter()
            .map(|node| node.sequence)
            .max()
            .unwrap_or(0)
            .max(registered);
        let placement = Placement::new(forest.machine_type.clone(), forest.location.clone());
        let keep: BTreeSet<String> = existing.iter().map(|node| node.id.clone()).collect();
        info!(
            forest_id = %forest.id,
            existing = existing.len(),
            additional,
            first_sequence = highest.saturating_add(1),
            "growing forest"
        );

        let mut progress = Progress::default();
        let mut added = Vec::new();
        for offset in 1..=additional {
            let sequence = highest.saturating_add(offset);
            match self
                .create_at(&forest, sequence, &placement, &guard, &mut progress)
                .await
            {
                Ok(node) => added.push(node),
                Err(err) => {
                    return Err(self
                        .roll_back(
                            &forest,
                            &progress,
                            &keep,
                            RollbackScope::Growth,
                            err,
                            &guard,
                        )
                        .await);
                }
            }
        }

        let grown = match self
            .write(&guard, "record growth", || {
                self.registry
                    .amend_forest(forest_id, ForestChange::growth(Utc::now()))
            })
            .await
        {
            Ok(grown) => grown,
            Err(err) => {
                return Err(self
                    .roll_back(&forest, &progress, &keep, RollbackScope::Growth, err, &guard)
                    .await);
            }
        };
        info!(forest_id = %grown.id, size = grown.size, "forest grown");

        let nodes = match self
            .read(&guard, "get nodes", || self.registry.get_nodes(forest_id))
            .await
        {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(
                    forest_id = %grown.id,
                    error = %err,
                    "could not re-read nodes after growth"
                );
                let mut nodes = existing;
                nodes.extend(added);
                nodes
            }
        };
        Ok(ForestReport {
            forest: grown,
            nodes,
        })
    }

    fn spec_for(&self, forest: &Forest, sequence: u32, placement: &Placement) -> ServerSpec {
        let name = node_name(&forest.id, sequence);
        let role = NodeRole::for_sequence(sequence);
        let user_data = self.user_data.render(&forest.id, &name, role);
        ServerSpec::new(
            name,
            placement.machine_type.as_str(),
            placement.location.as_str(),
            forest.image.as_str(),
        )
        .with_label(FOREST_LABEL, forest.id.as_str())
        .with_label(ROLE_LABEL, role.as_str())
        .with_user_data(user_data)
    }

    async fn create_at(
        &self,
        forest: &Forest,
        sequence: u32,
        placement: &Placement,
        guard: &CallGuard,
        progress: &mut Progress,
    ) -> Result<Node, OrchestratorError<P::Error>> {
        let spec = self.spec_for(forest, sequence, placement);
        let handle = guard
            .run(self.provider.create_server(&spec))
            .await
            .map_err(|reason| OrchestratorError::Interrupted {
                stage: format!("creating {}", spec.name),
                reason,
            })?
            .map_err(|source| OrchestratorError::Create {
                node: spec.name.clone(),
                placement: placement.clone(),
                source,
            })?;
        progress.created.push(handle.clone());
        self.bring_up(forest, sequence, handle, guard, progress)
            .await
    }

    async fn bring_up(
        &self,
        forest: &Forest,
        sequence: u32,
        handle: ServerHandle,
        guard: &CallGuard,
        progress: &mut Progress,
    ) -> Result<Node, OrchestratorError<P::Error>> {
        let name = node_name(&forest.id, sequence);
        let wait_timeout = self.settings.node_wait_timeout;
        let details = guard
            .with_timeout(wait_timeout.saturating_add(WAIT_GRACE))
            .run(
                self.provider
                    .wait_for_server(&handle, ServerState::Running, wait_timeout),
            )
            .await
            .map_err(|reason| OrchestratorError::Interrupted {
                stage: format!("waiting for {name}"),
                reason,
            })?
            .map_err(|source| OrchestratorError::Wait {
                node: name.clone(),
                source,
            })?;
        let addresses = details
            .addresses
            .ok_or_else(|| OrchestratorError::MissingAddress { node: name.clone() })?;

        let mut metadata = BTreeMap::new();
        metadata.insert(String::from("image"), forest.image.clone());
        metadata.insert(String::from("provider"), self.provider.name().to_owned());
        let node = Node {
            id: handle.id.clone(),
            forest_id: forest.id.clone(),
            name,
            sequence,
            role: NodeRole::for_sequence(sequence),
            location: handle.location.clone(),
            machine_type: forest.machine_type.clone(),
            status: NodeStatus::Active,
            addresses,
            metadata,
            created_at: Utc::now(),
        };
        self.write(guard, "register node", || {
            self.registry.register_node(node.clone())
        })
        .await?;
        progress.registered.push(node.clone());
        info!(
            forest_id = %forest.id,
            node = %node.name,
            server_id = %node.id,
            address = %node.addresses,
            "node active"
        );

        self.publish_dns(forest, &node, guard).await;
        Ok(node)
    }

    async fn publish_dns(&self, forest: &Forest, node: &Node, guard: &CallGuard) {
        let Some(dns) = &self.dns else {
            return;
        };
        match guard.run(dns.publish(forest, node)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(forest_id = %forest.id, node = %node.name, error = %err, "DNS publish failed");
            }
            Err(reason) => {
                warn!(forest_id = %forest.id, node = %node.name, error = %reason, "DNS publish interrupted");
            }
        }
    }

    async fn read<T, F, Fut>(
        &self,
        guard: &CallGuard,
        operation: &'static str,
        call: F,
    ) -> Result<T, OrchestratorError<P::Error>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        guard
            .run(call())
            .await
            .map_err(|reason| OrchestratorError::Interrupted {
                stage: format!("registry {operation}"),
                reason,
            })?
            .map_err(|source| OrchestratorError::Registry { operation, source })
    }

    async fn write<T, F, Fut>(
        &self,
        guard: &CallGuard,
        operation: &'static str,
        call: F,
    ) -> Result<T, OrchestratorError<P::Error>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let retry = self.settings.conflict_retry;
        self.read(guard, operation, || retry.run(operation, call))
            .await
    }
}
