//! Persisted forest and node records plus the snapshot they live in.
//!
//! Every mutation of [`RegistryData`] is implemented here once so the local
//! and remote backends apply identical rules; the backends only differ in
//! how the snapshot is locked and persisted.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RegistryError;
use crate::provider::NodeAddresses;

/// Prefix of generated forest identifiers.
pub const FOREST_ID_PREFIX: &str = "forest-";

/// Generates a time-based forest identifier (`forest-<unix-seconds>`).
///
/// Two forests created within the same second collide; registration of the
/// second one fails with [`RegistryError::ForestExists`].
#[must_use]
pub fn generate_forest_id(now: DateTime<Utc>) -> String {
    format!("{FOREST_ID_PREFIX}{}", now.timestamp())
}

/// Deterministic node name for the `sequence`-th node of a forest.
#[must_use]
pub fn node_name(forest_id: &str, sequence: u32) -> String {
    format!("{forest_id}-node-{sequence}")
}

/// Lifecycle status of a forest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForestStatus {
    /// Registered; nodes are being created.
    Provisioning,
    /// Every requested node is registered and running.
    Active,
    /// Provisioning failed and was rolled back.
    Failed,
    /// Teardown is in progress.
    Destroying,
}

impl fmt::Display for ForestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => f.write_str("provisioning"),
            Self::Active => f.write_str("active"),
            Self::Failed => f.write_str("failed"),
            Self::Destroying => f.write_str("destroying"),
        }
    }
}

/// Lifecycle status of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Server created, not yet confirmed running.
    Provisioning,
    /// Server running and reachable.
    Active,
    /// Server reported a failure after registration.
    Failed,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioning => f.write_str("provisioning"),
            Self::Active => f.write_str("active"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Role tag of a node inside its forest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// First node of the forest.
    Leader,
    /// Every other node.
    Worker,
}

impl NodeRole {
    /// Role for the node with the given 1-based sequence number.
    #[must_use]
    pub const fn for_sequence(sequence: u32) -> Self {
        if sequence == 1 {
            Self::Leader
        } else {
            Self::Worker
        }
    }

    /// Label value used on provider resources.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named cluster deployment.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Forest {
    /// Opaque identifier (`forest-<unix-seconds>`).
    pub id: String,
    /// Provider that owns the servers.
    pub provider: String,
    /// Location the nodes are placed in.
    pub location: String,
    /// Machine type the nodes use.
    pub machine_type: String,
    /// Image label the nodes boot from.
    pub image: String,
    /// Recorded node count.
    pub size: u32,
    /// Lifecycle status.
    pub status: ForestStatus,
    /// Creation timestamp; never changes after registration.
    pub created_at: DateTime<Utc>,
    /// Registry endpoint used to reach this forest's record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_endpoint: Option<String>,
    /// Timestamp of the most recent growth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_expanded_at: Option<DateTime<Utc>>,
}

impl Forest {
    /// Returns true when the recorded size matches the registered nodes.
    #[must_use]
    pub fn is_reconciled(&self, nodes: &[Node]) -> bool {
        usize::try_from(self.size).is_ok_and(|size| size == nodes.len())
    }
}

/// Targeted change to a forest record, applied inside one registry write.
///
/// Unlike [`RegistryData::replace_forest`], a change never carries a full
/// copy of the forest, so it cannot overwrite fields another writer touched
/// since the caller last read the record. When `recount` is set, `size` is
/// recomputed from the nodes registered at the moment of the write.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ForestChange {
    /// New status, if any.
    pub status: Option<ForestStatus>,
    /// New `(location, machine_type)` placement, if any.
    pub placement: Option<(String, String)>,
    /// New expansion timestamp, if any.
    pub expanded_at: Option<DateTime<Utc>>,
    /// Recompute `size` from the registered nodes.
    pub recount: bool,
}

impl ForestChange {
    /// Records the placement chosen for the forest's nodes.
    #[must_use]
    pub fn placement(location: impl Into<String>, machine_type: impl Into<String>) -> Self {
        Self {
            placement: Some((location.into(), machine_type.into())),
            ..Self::default()
        }
    }

    /// Recounts the forest's size and optionally sets its status.
    #[must_use]
    pub fn settle(status: Option<ForestStatus>) -> Self {
        Self {
            status,
            recount: true,
            ..Self::default()
        }
    }

    /// Recounts the forest's size and stamps the expansion time.
    #[must_use]
    pub fn growth(expanded_at: DateTime<Utc>) -> Self {
        Self {
            expanded_at: Some(expanded_at),
            recount: true,
            ..Self::default()
        }
    }
}

/// One provisioned machine belonging to exactly one forest.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Provider-assigned server identifier.
    pub id: String,
    /// Owning forest identifier.
    pub forest_id: String,
    /// Deterministic name derived from the forest and sequence.
    pub name: String,
    /// 1-based position in creation order.
    pub sequence: u32,
    /// Role tag.
    pub role: NodeRole,
    /// Location the server runs in.
    pub location: String,
    /// Machine type of the server.
    pub machine_type: String,
    /// Lifecycle status.
    pub status: NodeStatus,
    /// Public addresses.
    pub addresses: NodeAddresses,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
}

/// Complete persisted registry snapshot.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RegistryData {
    /// Incremented on every persisted mutation.
    pub version: u64,
    /// Timestamp of the last mutation.
    pub updated_at: DateTime<Utc>,
    /// Forests keyed by identifier.
    #[serde(default)]
    pub forests: BTreeMap<String, Forest>,
    /// Node lists keyed by forest identifier, in registration order.
    #[serde(default)]
    pub nodes: BTreeMap<String, Vec<Node>>,
}

impl Default for RegistryData {
    fn default() -> Self {
        Self {
            version: 1,
            updated_at: Utc::now(),
            forests: BTreeMap::new(),
            nodes: BTreeMap::new(),
        }
    }
}

impl RegistryData {
    /// Creates an empty snapshot at version 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self) {
        self.version = self.version.saturating_add(1);
        self.updated_at = Utc::now();
    }

    fn forest_not_found(forest_id: &str) -> RegistryError {
        RegistryError::ForestNotFound {
            forest_id: forest_id.to_owned(),
        }
    }

    /// Inserts a new forest in `provisioning` status with no nodes.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ForestExists`] without touching the snapshot
    /// when the identifier is taken.
    pub fn insert_forest(&mut self, mut forest: Forest) -> Result<(), RegistryError> {
        if self.forests.contains_key(&forest.id) {
            return Err(RegistryError::ForestExists {
                forest_id: forest.id,
            });
        }
        forest.status = ForestStatus::Provisioning;
        self.nodes.insert(forest.id.clone(), Vec::new());
        self.forests.insert(forest.id.clone(), forest);
        self.touch();
        Ok(())
    }

    /// Appends a node to its forest's list.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ForestNotFound`] when the owning forest is
    /// absent, [`RegistryError::NodeExists`] for a duplicate identifier and
    /// [`RegistryError::SequenceTaken`] when another node holds the same
    /// sequence number.
    pub fn insert_node(&mut self, node: Node) -> Result<(), RegistryError> {
        if !self.forests.contains_key(&node.forest_id) {
            return Err(Self::forest_not_found(&node.forest_id));
        }
        let nodes = self.nodes.entry(node.forest_id.clone()).or_default();
        if nodes.iter().any(|existing| existing.id == node.id) {
            return Err(RegistryError::NodeExists {
                forest_id: node.forest_id,
                node_id: node.id,
            });
        }
        if nodes.iter().any(|existing| existing.sequence == node.sequence) {
            return Err(RegistryError::SequenceTaken {
                forest_id: node.forest_id,
                sequence: node.sequence,
            });
        }
        nodes.push(node);
        self.touch();
        Ok(())
    }

    /// Removes one node record.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when the forest or node is absent.
    pub fn remove_node(&mut self, forest_id: &str, node_id: &str) -> Result<Node, RegistryError> {
        if !self.forests.contains_key(forest_id) {
            return Err(Self::forest_not_found(forest_id));
        }
        let nodes = self.nodes.entry(forest_id.to_owned()).or_default();
        let position = nodes
            .iter()
            .position(|node| node.id == node_id)
            .ok_or_else(|| RegistryError::NodeNotFound {
                forest_id: forest_id.to_owned(),
                node_id: node_id.to_owned(),
            })?;
        let removed = nodes.remove(position);
        self.touch();
        Ok(removed)
    }

    /// Looks up a forest.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ForestNotFound`] when absent.
    pub fn forest(&self, forest_id: &str) -> Result<&Forest, RegistryError> {
        self.forests
            .get(forest_id)
            .ok_or_else(|| Self::forest_not_found(forest_id))
    }

    /// Returns the nodes of a forest in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ForestNotFound`] when the forest is absent.
    pub fn nodes(&self, forest_id: &str) -> Result<&[Node], RegistryError> {
        self.forest(forest_id)?;
        Ok(self.nodes.get(forest_id).map_or(&[], Vec::as_slice))
    }

    /// Replaces every mutable field of an existing forest, keeping its
    /// creation timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ForestNotFound`] when absent.
    pub fn replace_forest(&mut self, mut updated: Forest) -> Result<(), RegistryError> {
        let existing = self
            .forests
            .get_mut(&updated.id)
            .ok_or_else(|| Self::forest_not_found(&updated.id))?;
        updated.created_at = existing.created_at;
        *existing = updated;
        self.touch();
        Ok(())
    }

    /// Applies a targeted change to a forest and returns the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ForestNotFound`] when absent.
    pub fn amend_forest(
        &mut self,
        forest_id: &str,
        change: &ForestChange,
    ) -> Result<Forest, RegistryError> {
        let count = self.nodes.get(forest_id).map_or(0, Vec::len);
        let forest = self
            .forests
            .get_mut(forest_id)
            .ok_or_else(|| Self::forest_not_found(forest_id))?;
        if let Some(status) = change.status {
            forest.status = status;
        }
        if let Some((location, machine_type)) = &change.placement {
            forest.location.clone_from(location);
            forest.machine_type.clone_from(machine_type);
        }
        if let Some(expanded_at) = change.expanded_at {
            forest.last_expanded_at = Some(expanded_at);
        }
        if change.recount {
            forest.size = u32::try_from(count).unwrap_or(u32::MAX);
        }
        let amended = forest.clone();
        self.touch();
        Ok(amended)
    }

    /// Sets a forest's status.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ForestNotFound`] when absent.
    pub fn set_forest_status(
        &mut self,
        forest_id: &str,
        status: ForestStatus,
    ) -> Result<(), RegistryError> {
        let forest = self
            .forests
            .get_mut(forest_id)
            .ok_or_else(|| Self::forest_not_found(forest_id))?;
        forest.status = status;
        self.touch();
        Ok(())
    }

    /// Sets a node's status.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when the forest or node is absent.
    pub fn set_node_status(
        &mut self,
        forest_id: &str,
        node_id: &str,
        status: NodeStatus,
    ) -> Result<(), RegistryError> {
        if !self.forests.contains_key(forest_id) {
            return Err(Self::forest_not_found(forest_id));
        }
        let node = self
            .nodes
            .get_mut(forest_id)
            .and_then(|nodes| nodes.iter_mut().find(|node| node.id == node_id))
            .ok_or_else(|| RegistryError::NodeNotFound {
                forest_id: forest_id.to_owned(),
                node_id: node_id.to_owned(),
            })?;
        node.status = status;
        self.touch();
        Ok(())
    }

    /// Removes a forest together with all of its nodes.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ForestNotFound`] when absent.
    pub fn remove_forest(&mut self, forest_id: &str) -> Result<Forest, RegistryError> {
        let forest = self
            .forests
            .remove(forest_id)
            .ok_or_else(|| Self::forest_not_found(forest_id))?;
        self.nodes.remove(forest_id);
        self.touch();
        Ok(forest)
    }

    /// Returns every forest ordered by identifier.
    #[must_use]
    pub fn forest_list(&self) -> Vec<Forest> {
        self.forests.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use chrono::TimeZone;
    use rstest::{fixture, rstest};

    fn forest(id: &str) -> Forest {
        Forest {
            id: id.to_owned(),
            provider: String::from("scripted"),
            location: String::from("nbg1"),
            machine_type: String::from("cx22"),
            image: String::from("ubuntu"),
            size: 1,
            status: ForestStatus::Active,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            registry_endpoint: None,
            last_expanded_at: None,
        }
    }

    fn node(forest_id: &str, id: &str) -> Node {
        Node {
            id: id.to_owned(),
            forest_id: forest_id.to_owned(),
            name: node_name(forest_id, 1),
            sequence: 1,
            role: NodeRole::Leader,
            location: String::from("nbg1"),
            machine_type: String::from("cx22"),
            status: NodeStatus::Active,
            addresses: NodeAddresses::new(Some(Ipv4Addr::new(10, 0, 0, 1)), None)
                .unwrap_or_else(|| panic!("address pair")),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[fixture]
    fn seeded() -> RegistryData {
        let mut data = RegistryData::new();
        data.insert_forest(forest("forest-1"))
            .unwrap_or_else(|err| panic!("seed forest: {err}"));
        data
    }

    #[rstest]
    fn insert_forest_forces_provisioning_status(seeded: RegistryData) {
        let stored = seeded
            .forest("forest-1")
            .unwrap_or_else(|err| panic!("forest present: {err}"));
        assert_eq!(stored.status, ForestStatus::Provisioning);
        assert_eq!(seeded.version, 2);
        assert!(
            seeded
                .nodes("forest-1")
                .unwrap_or_else(|err| panic!("nodes: {err}"))
                .is_empty()
        );
    }

    #[rstest]
    fn duplicate_forest_leaves_snapshot_untouched(mut seeded: RegistryData) {
        let before = seeded.clone();
        let err = seeded
            .insert_forest(forest("forest-1"))
            .expect_err("duplicate must fail");
        assert!(matches!(err, RegistryError::ForestExists { .. }));
        assert_eq!(seeded, before);
    }

    #[rstest]
    fn orphan_node_is_rejected(mut seeded: RegistryData) {
        let err = seeded
            .insert_node(node("forest-404", "srv-1"))
            .expect_err("orphan must fail");
        assert_eq!(
            err,
            RegistryError::ForestNotFound {
                forest_id: String::from("forest-404")
            }
        );
        assert!(!seeded.nodes.contains_key("forest-404"));
    }

    #[rstest]
    fn duplicate_node_is_rejected(mut seeded: RegistryData) {
        seeded
            .insert_node(node("forest-1", "srv-1"))
            .unwrap_or_else(|err| panic!("first insert: {err}"));
        let err = seeded
            .insert_node(node("forest-1", "srv-1"))
            .expect_err("duplicate node must fail");
        assert!(matches!(err, RegistryError::NodeExists { .. }));
    }

    #[rstest]
    fn taken_sequence_is_rejected(mut seeded: RegistryData) {
        seeded
            .insert_node(node("forest-1", "srv-1"))
            .unwrap_or_else(|err| panic!("first insert: {err}"));
        let err = seeded
            .insert_node(node("forest-1", "srv-2"))
            .expect_err("sequence 1 is taken");
        assert_eq!(
            err,
            RegistryError::SequenceTaken {
                forest_id: String::from("forest-1"),
                sequence: 1,
            }
        );
        assert_eq!(seeded.nodes("forest-1").map(<[Node]>::len), Ok(1));
    }

    #[rstest]
    fn amend_recounts_from_the_current_nodes(mut seeded: RegistryData) {
        let mut stale = seeded
            .forest("forest-1")
            .unwrap_or_else(|err| panic!("forest: {err}"))
            .clone();
        let mut second = node("forest-1", "srv-2");
        second.sequence = 2;
        for registered in [node("forest-1", "srv-1"), second] {
            seeded
                .insert_node(registered)
                .unwrap_or_else(|err| panic!("insert: {err}"));
        }
        stale.size = 7;

        let expanded_at = Utc::now();
        let amended = seeded
            .amend_forest("forest-1", &ForestChange::growth(expanded_at))
            .unwrap_or_else(|err| panic!("amend: {err}"));
        assert_eq!(amended.size, 2);
        assert_eq!(amended.last_expanded_at, Some(expanded_at));
        assert_eq!(amended.status, ForestStatus::Provisioning);
        assert_ne!(amended.size, stale.size);

        let placed = seeded
            .amend_forest("forest-1", &ForestChange::placement("fsn1", "cx32"))
            .unwrap_or_else(|err| panic!("amend placement: {err}"));
        assert_eq!((placed.location.as_str(), placed.machine_type.as_str()), ("fsn1", "cx32"));
        assert_eq!(placed.size, 2);

        let err = seeded
            .amend_forest("forest-404", &ForestChange::settle(None))
            .expect_err("unknown forest");
        assert!(err.is_not_found());
    }

    #[rstest]
    fn replace_forest_keeps_created_at(mut seeded: RegistryData) {
        let original = seeded
            .forest("forest-1")
            .unwrap_or_else(|err| panic!("forest: {err}"))
            .created_at;
        let mut updated = forest("forest-1");
        updated.created_at = Utc::now();
        updated.size = 7;
        seeded
            .replace_forest(updated)
            .unwrap_or_else(|err| panic!("replace: {err}"));
        let stored = seeded
            .forest("forest-1")
            .unwrap_or_else(|err| panic!("forest: {err}"));
        assert_eq!(stored.created_at, original);
        assert_eq!(stored.size, 7);
    }

    #[rstest]
    fn remove_node_and_forest(mut seeded: RegistryData) {
        seeded
            .insert_node(node("forest-1", "srv-1"))
            .unwrap_or_else(|err| panic!("insert: {err}"));
        let removed = seeded
            .remove_node("forest-1", "srv-1")
            .unwrap_or_else(|err| panic!("remove node: {err}"));
        assert_eq!(removed.id, "srv-1");
        assert!(matches!(
            seeded.remove_node("forest-1", "srv-1"),
            Err(RegistryError::NodeNotFound { .. })
        ));

        seeded
            .remove_forest("forest-1")
            .unwrap_or_else(|err| panic!("remove forest: {err}"));
        assert!(seeded.nodes("forest-1").is_err());
        assert!(!seeded.nodes.contains_key("forest-1"));
    }

    #[rstest]
    fn set_node_status_requires_node(mut seeded: RegistryData) {
        let err = seeded
            .set_node_status("forest-1", "missing", NodeStatus::Failed)
            .expect_err("missing node");
        assert!(err.is_not_found());
    }

    #[rstest]
    fn forest_ids_are_time_based() {
        let now = Utc
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .unwrap_or_else(|| panic!("valid timestamp"));
        assert_eq!(generate_forest_id(now), "forest-1700000000");
        assert_eq!(node_name("forest-1", 3), "forest-1-node-3");
    }

    #[rstest]
    fn reconciliation_compares_size_with_nodes(seeded: RegistryData) {
        let stored = seeded
            .forest("forest-1")
            .unwrap_or_else(|err| panic!("forest: {err}"));
        assert!(!stored.is_reconciled(&[]));
        assert!(stored.is_reconciled(&[node("forest-1", "srv-1")]));
    }
}
