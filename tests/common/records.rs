//! Forest and node records shared by the registry tests.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{TimeZone, Utc};
use forester::registry::node_name;
use forester::{Forest, ForestStatus, Node, NodeAddresses, NodeRole, NodeStatus};

/// Forest created at a fixed instant in `nbg1`.
pub fn forest(id: &str) -> Forest {
    Forest {
        id: id.to_owned(),
        provider: String::from("scripted"),
        location: String::from("nbg1"),
        machine_type: String::from("cx22"),
        image: String::from("ubuntu-24.04"),
        size: 0,
        status: ForestStatus::Provisioning,
        created_at: Utc
            .with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
            .single()
            .unwrap_or_default(),
        registry_endpoint: None,
        last_expanded_at: None,
    }
}

/// Active node `sequence` of `forest_id`, backed by server `id`.
pub fn node(forest_id: &str, id: &str, sequence: u32) -> Node {
    let last_octet = u8::try_from(sequence).unwrap_or(u8::MAX);
    Node {
        id: id.to_owned(),
        forest_id: forest_id.to_owned(),
        name: node_name(forest_id, sequence),
        sequence,
        role: NodeRole::for_sequence(sequence),
        location: String::from("nbg1"),
        machine_type: String::from("cx22"),
        status: NodeStatus::Active,
        addresses: NodeAddresses::new(Some(Ipv4Addr::new(10, 0, 0, last_octet)), None)
            .unwrap_or_else(|| panic!("address pair should be valid")),
        metadata: BTreeMap::new(),
        created_at: Utc::now(),
    }
}
