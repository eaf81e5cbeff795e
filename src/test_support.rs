//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, Notify};

use crate::dns::{DnsError, DnsFuture, DnsProvisioner};
use crate::provider::{
    MachineProvider, NodeAddresses, ProviderFuture, ServerDetails, ServerFilter, ServerHandle,
    ServerSpec, ServerState,
};
use crate::registry::{
    Forest, ForestChange, ForestStatus, InfallibleFuture, Node, NodeStatus, Registry,
    RegistryError, RegistryFuture,
};
use crate::selection::Placement;

/// Error returned by [`ScriptedProvider`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct ScriptedProviderError {
    /// Scripted error text.
    pub message: String,
}

impl ScriptedProviderError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
struct ProviderState {
    availability: BTreeMap<String, Vec<String>>,
    placement_failures: BTreeMap<Placement, String>,
    create_failures: BTreeMap<usize, String>,
    create_hangs: BTreeSet<usize>,
    wait_failures: BTreeMap<usize, String>,
    delete_failure: Option<String>,
    servers: BTreeMap<String, ServerDetails>,
    created: Vec<ServerSpec>,
    attempted: Vec<Placement>,
    deleted: Vec<String>,
    waits: usize,
    next_id: u32,
}

/// In-memory [`MachineProvider`] with scripted failures.
///
/// Machine types are registered with the locations they are available in.
/// Failures can be attached to specific placements or to the n-th call of
/// an operation (1-based). Created servers stay "running" until deleted.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl ScriptedProvider {
    /// Creates a provider with an empty catalogue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.state
            .lock()
            .unwrap_or_else(|err| panic!("scripted provider lock poisoned: {err}"))
    }

    /// Adds a machine type available in `locations`, in that order.
    #[must_use]
    pub fn with_machine_type(self, machine_type: &str, locations: &[&str]) -> Self {
        self.state().availability.insert(
            machine_type.to_owned(),
            locations.iter().map(|location| (*location).to_owned()).collect(),
        );
        self
    }

    /// Makes every create at the placement fail with `message`.
    #[must_use]
    pub fn fail_placement(self, machine_type: &str, location: &str, message: &str) -> Self {
        self.state()
            .placement_failures
            .insert(Placement::new(machine_type, location), message.to_owned());
        self
    }

    /// Makes the n-th create call fail with `message`.
    #[must_use]
    pub fn fail_create_call(self, call: usize, message: &str) -> Self {
        self.state().create_failures.insert(call, message.to_owned());
        self
    }

    /// Makes the n-th create call never complete.
    #[must_use]
    pub fn hang_create_call(self, call: usize) -> Self {
        self.state().create_hangs.insert(call);
        self
    }

    /// Makes the n-th wait call fail with `message`.
    #[must_use]
    pub fn fail_wait_call(self, call: usize, message: &str) -> Self {
        self.state().wait_failures.insert(call, message.to_owned());
        self
    }

    /// Makes every delete call fail with `message`.
    #[must_use]
    pub fn fail_deletes(self, message: &str) -> Self {
        self.state().delete_failure = Some(message.to_owned());
        self
    }

    /// Seeds a running server that was not created through this provider.
    pub fn insert_server(&self, id: &str, location: &str, labels: &[(&str, &str)]) {
        let details = ServerDetails {
            handle: ServerHandle {
                id: id.to_owned(),
                location: location.to_owned(),
            },
            name: id.to_owned(),
            state: ServerState::Running,
            addresses: NodeAddresses::new(Some(Ipv4Addr::new(198, 51, 100, 1)), None),
            labels: labels
                .iter()
                .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
                .collect(),
        };
        self.state().servers.insert(id.to_owned(), details);
    }

    /// Servers that currently exist.
    #[must_use]
    pub fn running_servers(&self) -> Vec<ServerDetails> {
        self.state().servers.values().cloned().collect()
    }

    /// Specs of every successful create call, in order.
    #[must_use]
    pub fn created_specs(&self) -> Vec<ServerSpec> {
        self.state().created.clone()
    }

    /// Every placement a create was attempted at, in order.
    #[must_use]
    pub fn attempted_placements(&self) -> Vec<Placement> {
        self.state().attempted.clone()
    }

    /// Identifiers passed to delete, in order.
    #[must_use]
    pub fn deleted_ids(&self) -> Vec<String> {
        self.state().deleted.clone()
    }
}

impl MachineProvider for ScriptedProvider {
    type Error = ScriptedProviderError;

    fn name(&self) -> &str {
        "scripted"
    }

    fn create_server<'a>(
        &'a self,
        spec: &'a ServerSpec,
    ) -> ProviderFuture<'a, ServerHandle, Self::Error> {
        Box::pin(async move {
            let hang = {
                let mut state = self.state();
                let placement = Placement::new(spec.machine_type.clone(), spec.location.clone());
                state.attempted.push(placement.clone());
                let call = state.attempted.len();
                if let Some(message) = state.placement_failures.get(&placement) {
                    return Err(ScriptedProviderError::new(message.clone()));
                }
                if let Some(message) = state.create_failures.get(&call) {
                    return Err(ScriptedProviderError::new(message.clone()));
                }
                state.create_hangs.contains(&call)
            };
            if hang {
                std::future::pending::<()>().await;
            }

            let mut state = self.state();
            state.next_id += 1;
            let sequence = state.next_id;
            let handle = ServerHandle {
                id: format!("srv-{sequence}"),
                location: spec.location.clone(),
            };
            let octet = u8::try_from(sequence % 250).unwrap_or(1);
            let details = ServerDetails {
                handle: handle.clone(),
                name: spec.name.clone(),
                state: ServerState::Running,
                addresses: NodeAddresses::new(Some(Ipv4Addr::new(10, 0, 0, octet)), None),
                labels: spec.labels.clone(),
            };
            state.servers.insert(handle.id.clone(), details);
            state.created.push(spec.clone());
            Ok(handle)
        })
    }

    fn wait_for_server<'a>(
        &'a self,
        handle: &'a ServerHandle,
        _target: ServerState,
        _timeout: Duration,
    ) -> ProviderFuture<'a, ServerDetails, Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            state.waits += 1;
            let call = state.waits;
            if let Some(message) = state.wait_failures.get(&call) {
                return Err(ScriptedProviderError::new(message.clone()));
            }
            state
                .servers
                .get(&handle.id)
                .cloned()
                .ok_or_else(|| ScriptedProviderError::new(format!("server {} not found", handle.id)))
        })
    }

    fn delete_server(&self, handle: ServerHandle) -> ProviderFuture<'_, (), Self::Error> {
        Box::pin(async move {
            let mut state = self.state();
            state.deleted.push(handle.id.clone());
            if let Some(message) = &state.delete_failure {
                return Err(ScriptedProviderError::new(message.clone()));
            }
            state.servers.remove(&handle.id);
            Ok(())
        })
    }

    fn list_servers<'a>(
        &'a self,
        filter: &'a ServerFilter,
    ) -> ProviderFuture<'a, Vec<ServerDetails>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .state()
                .servers
                .values()
                .filter(|server| filter.matches(&server.labels))
                .filter(|server| {
                    filter.locations.is_empty()
                        || filter.locations.contains(&server.handle.location)
                })
                .cloned()
                .collect())
        })
    }

    fn available_locations<'a>(
        &'a self,
        machine_type: &'a str,
    ) -> ProviderFuture<'a, Vec<String>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .state()
                .availability
                .get(machine_type)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn validate_server_type<'a>(
        &'a self,
        machine_type: &'a str,
    ) -> ProviderFuture<'a, bool, Self::Error> {
        Box::pin(async move { Ok(self.state().availability.contains_key(machine_type)) })
    }
}

/// DNS hook that records every published node and can be told to fail.
#[derive(Clone, Debug, Default)]
pub struct RecordingDns {
    published: Arc<Mutex<Vec<String>>>,
    retracted: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl RecordingDns {
    /// Creates a hook that accepts every record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a hook that rejects every record.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Names of the nodes published so far.
    #[must_use]
    pub fn published(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap_or_else(|err| panic!("recording dns lock poisoned: {err}"))
            .clone()
    }

    /// Names of the nodes retracted so far.
    #[must_use]
    pub fn retracted(&self) -> Vec<String> {
        self.retracted
            .lock()
            .unwrap_or_else(|err| panic!("recording dns lock poisoned: {err}"))
            .clone()
    }

    fn record(&self, log: &Mutex<Vec<String>>, forest: &Forest, node: &Node) -> Result<(), DnsError> {
        if self.fail {
            return Err(DnsError::Rejected {
                record: node.name.clone(),
                message: format!("zone for {} is read-only", forest.id),
            });
        }
        log.lock()
            .unwrap_or_else(|err| panic!("recording dns lock poisoned: {err}"))
            .push(node.name.clone());
        Ok(())
    }
}

impl DnsProvisioner for RecordingDns {
    fn publish<'a>(&'a self, forest: &'a Forest, node: &'a Node) -> DnsFuture<'a> {
        Box::pin(async move { self.record(&self.published, forest, node) })
    }

    fn retract<'a>(&'a self, forest: &'a Forest, node: &'a Node) -> DnsFuture<'a> {
        Box::pin(async move { self.record(&self.retracted, forest, node) })
    }
}

/// Registry wrapper that rejects the first `n` writes with a conflict.
///
/// Reads always pass through to the wrapped registry.
#[derive(Debug)]
pub struct ConflictingRegistry<R> {
    inner: R,
    remaining: Mutex<usize>,
}

impl<R> ConflictingRegistry<R> {
    /// Wraps `inner`, failing the next `conflicts` writes.
    #[must_use]
    pub const fn new(inner: R, conflicts: usize) -> Self {
        Self {
            inner,
            remaining: Mutex::new(conflicts),
        }
    }

    /// Wrapped registry.
    #[must_use]
    pub const fn inner(&self) -> &R {
        &self.inner
    }

    fn conflict(&self) -> Result<(), RegistryError> {
        let mut remaining = self
            .remaining
            .lock()
            .unwrap_or_else(|err| panic!("conflict counter lock poisoned: {err}"));
        if *remaining == 0 {
            return Ok(());
        }
        *remaining -= 1;
        Err(RegistryError::ConcurrentModification)
    }
}

impl<R: Registry> Registry for ConflictingRegistry<R> {
    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }

    fn register_forest(&self, forest: Forest) -> RegistryFuture<'_, ()> {
        Box::pin(async move {
            self.conflict()?;
            self.inner.register_forest(forest).await
        })
    }

    fn register_node(&self, node: Node) -> RegistryFuture<'_, ()> {
        Box::pin(async move {
            self.conflict()?;
            self.inner.register_node(node).await
        })
    }

    fn remove_node<'a>(
        &'a self,
        forest_id: &'a str,
        node_id: &'a str,
    ) -> RegistryFuture<'a, Node> {
        Box::pin(async move {
            self.conflict()?;
            self.inner.remove_node(forest_id, node_id).await
        })
    }

    fn get_forest<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, Forest> {
        self.inner.get_forest(forest_id)
    }

    fn get_nodes<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, Vec<Node>> {
        self.inner.get_nodes(forest_id)
    }

    fn update_forest(&self, forest: Forest) -> RegistryFuture<'_, ()> {
        Box::pin(async move {
            self.conflict()?;
            self.inner.update_forest(forest).await
        })
    }

    fn amend_forest<'a>(
        &'a self,
        forest_id: &'a str,
        change: ForestChange,
    ) -> RegistryFuture<'a, Forest> {
        Box::pin(async move {
            self.conflict()?;
            self.inner.amend_forest(forest_id, change).await
        })
    }

    fn update_forest_status<'a>(
        &'a self,
        forest_id: &'a str,
        status: ForestStatus,
    ) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.conflict()?;
            self.inner.update_forest_status(forest_id, status).await
        })
    }

    fn update_node_status<'a>(
        &'a self,
        forest_id: &'a str,
        node_id: &'a str,
        status: NodeStatus,
    ) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.conflict()?;
            self.inner.update_node_status(forest_id, node_id, status).await
        })
    }

    fn delete_forest<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.conflict()?;
            self.inner.delete_forest(forest_id).await
        })
    }

    fn list_forests(&self) -> InfallibleFuture<'_, Vec<Forest>> {
        self.inner.list_forests()
    }

    fn check_reachable(&self) -> RegistryFuture<'_, ()> {
        self.inner.check_reachable()
    }
}

/// Registry wrapper that holds the first `amend_forest` call until
/// [`GatedRegistry::release`] is called.
///
/// Lets a test interleave a second writer between an operation's node
/// registrations and its forest update.
#[derive(Debug)]
pub struct GatedRegistry<R: ?Sized> {
    inner: Arc<R>,
    armed: AtomicBool,
    held: Notify,
    released: Notify,
}

impl<R: ?Sized> GatedRegistry<R> {
    /// Wraps a shared registry with the gate armed.
    #[must_use]
    pub fn new(inner: Arc<R>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(true),
            held: Notify::new(),
            released: Notify::new(),
        }
    }

    /// Resolves once a forest update is waiting at the gate.
    pub async fn wait_until_held(&self) {
        self.held.notified().await;
    }

    /// Lets the held forest update through.
    pub fn release(&self) {
        self.released.notify_one();
    }
}

impl<R: Registry + ?Sized> Registry for GatedRegistry<R> {
    fn endpoint(&self) -> String {
        self.inner.endpoint()
    }

    fn register_forest(&self, forest: Forest) -> RegistryFuture<'_, ()> {
        self.inner.register_forest(forest)
    }

    fn register_node(&self, node: Node) -> RegistryFuture<'_, ()> {
        self.inner.register_node(node)
    }

    fn remove_node<'a>(
        &'a self,
        forest_id: &'a str,
        node_id: &'a str,
    ) -> RegistryFuture<'a, Node> {
        self.inner.remove_node(forest_id, node_id)
    }

    fn get_forest<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, Forest> {
        self.inner.get_forest(forest_id)
    }

    fn get_nodes<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, Vec<Node>> {
        self.inner.get_nodes(forest_id)
    }

    fn update_forest(&self, forest: Forest) -> RegistryFuture<'_, ()> {
        self.inner.update_forest(forest)
    }

    fn amend_forest<'a>(
        &'a self,
        forest_id: &'a str,
        change: ForestChange,
    ) -> RegistryFuture<'a, Forest> {
        Box::pin(async move {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.held.notify_one();
                self.released.notified().await;
            }
            self.inner.amend_forest(forest_id, change).await
        })
    }

    fn update_forest_status<'a>(
        &'a self,
        forest_id: &'a str,
        status: ForestStatus,
    ) -> RegistryFuture<'a, ()> {
        self.inner.update_forest_status(forest_id, status)
    }

    fn update_node_status<'a>(
        &'a self,
        forest_id: &'a str,
        node_id: &'a str,
        status: NodeStatus,
    ) -> RegistryFuture<'a, ()> {
        self.inner.update_node_status(forest_id, node_id, status)
    }

    fn delete_forest<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, ()> {
        self.inner.delete_forest(forest_id)
    }

    fn list_forests(&self) -> InfallibleFuture<'_, Vec<Forest>> {
        self.inner.list_forests()
    }

    fn check_reachable(&self) -> RegistryFuture<'_, ()> {
        self.inner.check_reachable()
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }

    /// Removes variables for the lifetime of the guard.
    pub async fn unset_vars(keys: &[&str]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(keys.len());
        for key in keys {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::remove_var(key) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
