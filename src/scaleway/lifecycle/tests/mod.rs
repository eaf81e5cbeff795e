//! Unit tests for Scaleway lifecycle helpers.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::time::Duration;

use reqwest::StatusCode;
use rstest::{fixture, rstest};
use scaleway_rs::ScalewayImage;

use super::image::ImageQuery;
use super::{ApiResponse, ServerBody, ServerSnapshot, labels_to_tags, tags_to_labels};
use crate::config::ScalewayConfig;
use crate::provider::{FOREST_LABEL, ROLE_LABEL, ServerState};
use crate::scaleway::types::{Action, Zone};
use crate::scaleway::{ScalewayProvider, ScalewayProviderError};

mod api;
mod image;

#[derive(Copy, Clone)]
struct ImageSpec {
    id: &'static str,
    arch: &'static str,
    state: &'static str,
    creation_date: &'static str,
}

fn image(spec: ImageSpec) -> ScalewayImage {
    ScalewayImage {
        id: spec.id.to_owned(),
        name: String::new(),
        arch: spec.arch.to_owned(),
        creation_date: spec.creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: spec.state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::new(),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

fn dummy_config() -> ScalewayConfig {
    ScalewayConfig {
        access_key: None,
        secret_key: String::from("dummy"),
        default_organization_id: None,
        default_project_id: String::from("proj"),
        default_zone: String::from("fr-par-1"),
        default_instance_type: String::from("DEV1-S"),
        default_image: String::from("Ubuntu 24.04 Noble Numbat"),
        default_architecture: String::from("x86_64"),
    }
}

fn query() -> ImageQuery {
    ImageQuery {
        label: String::from("label"),
        arch: String::from("x86_64"),
        zone: Zone::from("fr-par-1"),
    }
}

#[fixture]
fn provider() -> ScalewayProvider {
    ScalewayProvider::new(dummy_config())
        .unwrap_or_else(|err| panic!("dummy config should validate: {err}"))
        .with_poll_interval(Duration::from_millis(1))
        .with_delete_timeout(Duration::from_millis(50))
}

fn snapshot(state: &str, allowed: &[&str]) -> ServerSnapshot {
    ServerSnapshot {
        id: "srv-1".into(),
        name: String::from("forest-1-node-1"),
        zone: Zone::from("fr-par-1"),
        state: state.to_owned(),
        allowed_actions: allowed.iter().copied().map(Action::from).collect(),
        addresses: None,
        tags: Vec::new(),
    }
}

fn body(json: &serde_json::Value) -> ServerBody {
    serde_json::from_value(json.clone())
        .unwrap_or_else(|err| panic!("server body should decode: {err}"))
}

fn api_response(status: StatusCode, json: &serde_json::Value) -> ApiResponse {
    ApiResponse {
        status,
        body: json.to_string().into_bytes(),
    }
}

#[rstest]
fn default_zone_is_searched_first() {
    let config = ScalewayConfig {
        default_zone: String::from("nl-ams-2"),
        ..dummy_config()
    };
    let provider = ScalewayProvider::new(config)
        .unwrap_or_else(|err| panic!("config should validate: {err}"));
    assert_eq!(provider.zones().first().map(String::as_str), Some("nl-ams-2"));
    assert_eq!(
        provider.zones().iter().filter(|zone| *zone == "nl-ams-2").count(),
        1
    );
}

#[rstest]
fn blank_secret_key_is_rejected() {
    let config = ScalewayConfig {
        secret_key: String::from(" "),
        ..dummy_config()
    };
    let Err(err) = ScalewayProvider::new(config) else {
        panic!("blank secret key should be rejected");
    };
    assert!(matches!(err, ScalewayProviderError::Config(message) if message.contains("SCW_SECRET_KEY")));
}

#[rstest]
fn labels_survive_the_tag_encoding() {
    let mut labels = BTreeMap::new();
    labels.insert(FOREST_LABEL.to_owned(), String::from("forest-7"));
    labels.insert(ROLE_LABEL.to_owned(), String::from("worker"));

    let tags = labels_to_tags(&labels);
    assert_eq!(
        tags,
        vec![
            String::from("forester"),
            String::from("forest=forest-7"),
            String::from("role=worker"),
        ]
    );
    assert_eq!(tags_to_labels(&tags), labels);
}

#[rstest]
fn snapshot_picks_one_address_per_family() {
    let parsed = ServerSnapshot::from_body(
        body(&serde_json::json!({
            "id": "srv-9",
            "name": "forest-1-node-2",
            "state": "running",
            "allowed_actions": ["poweroff", "terminate"],
            "tags": ["forester", "forest=forest-1"],
            "public_ip": null,
            "public_ips": [
                {"address": "2001:db8::7"},
                {"address": "51.15.10.2"},
                {"address": "51.15.10.3"}
            ]
        })),
        "fr-par-2",
    );

    let addresses = parsed
        .addresses
        .unwrap_or_else(|| panic!("addresses should be parsed"));
    assert_eq!(addresses.ipv4(), Some(Ipv4Addr::new(51, 15, 10, 2)));
    assert_eq!(
        addresses.ipv6().map(|address| address.to_string()),
        Some(String::from("2001:db8::7"))
    );
    assert!(parsed.allows("terminate"));

    let details = parsed.details();
    assert_eq!(details.handle.location, "fr-par-2");
    assert_eq!(details.state, ServerState::Running);
    assert_eq!(details.labels.get(FOREST_LABEL).map(String::as_str), Some("forest-1"));
}

#[rstest]
fn snapshot_without_addresses_reports_none() {
    let parsed = ServerSnapshot::from_body(
        body(&serde_json::json!({"id": "srv-3", "state": "starting"})),
        "fr-par-1",
    );
    assert!(parsed.addresses.is_none());
    assert_eq!(parsed.details().state, ServerState::Starting);
}

#[rstest]
#[case::out_of_stock(
    serde_json::json!({"type": "out_of_stock", "message": "no more resources"}),
    "out of stock"
)]
#[case::resource(
    serde_json::json!({"type": "invalid_arguments", "message": "bad", "resource": "commercial_type"}),
    "not available"
)]
#[case::resource_id(
    serde_json::json!({"type": "not_found", "message": "gone", "resource_id": "GPU-3070-S"}),
    "not available"
)]
fn create_failures_name_capacity_problems(
    #[case] error: serde_json::Value,
    #[case] expected: &str,
) {
    let err = api_response(StatusCode::BAD_REQUEST, &error)
        .into_create_error("GPU-3070-S", "fr-par-2");
    assert!(
        err.to_string().contains(expected),
        "unexpected message: {err}"
    );
    assert!(err.to_string().contains("fr-par-2"));
}

#[rstest]
fn other_create_failures_keep_the_api_status() {
    let err = api_response(
        StatusCode::FORBIDDEN,
        &serde_json::json!({"type": "permissions_denied", "message": "quota"}),
    )
    .into_create_error("DEV1-S", "fr-par-1");
    assert!(matches!(err, ScalewayProviderError::Api { status: 403, .. }));
}

#[rstest]
#[tokio::test]
async fn power_on_is_skipped_for_running_servers(provider: ScalewayProvider) {
    provider
        .power_on_if_needed(&snapshot("running", &["poweroff"]))
        .await
        .unwrap_or_else(|err| panic!("running server needs no action: {err}"));
}

#[rstest]
#[tokio::test]
async fn power_on_requires_the_action(provider: ScalewayProvider) {
    let err = provider
        .power_on_if_needed(&snapshot("stopped", &[]))
        .await
        .expect_err("power on should be refused");
    assert!(matches!(
        err,
        ScalewayProviderError::PowerOnNotAllowed { state, .. } if state == "stopped"
    ));
}
