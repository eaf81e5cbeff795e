//! End-to-end lifecycle tests against an in-process fake Instances API.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use rstest::rstest;
use serde_json::{Value, json};
use tokio::sync::oneshot;

use super::dummy_config;
use crate::provider::{
    FOREST_LABEL, MachineProvider, ServerFilter, ServerHandle, ServerSpec, ServerState,
};
use crate::scaleway::{ScalewayProvider, ScalewayProviderError};

const IMAGE_ID: &str = "3f1c2d4e-5a6b-4c7d-8e9f-0a1b2c3d4e5f";

#[derive(Clone)]
struct FakeServer {
    zone: String,
    name: String,
    state: String,
    tags: Vec<String>,
    address: Option<String>,
    commercial_type: String,
}

impl FakeServer {
    fn allowed_actions(&self) -> Vec<&'static str> {
        match self.state.as_str() {
            "stopped" => vec!["poweron"],
            "running" => vec!["poweroff", "terminate"],
            _ => Vec::new(),
        }
    }

    fn to_json(&self, id: &str) -> Value {
        json!({
            "id": id,
            "name": self.name,
            "state": self.state,
            "commercial_type": self.commercial_type,
            "allowed_actions": self.allowed_actions(),
            "tags": self.tags,
            "public_ip": self.address.as_ref().map(|address| json!({"address": address})),
        })
    }
}

#[derive(Default)]
struct FakeState {
    servers: BTreeMap<String, FakeServer>,
    next_id: u32,
    catalogue: Vec<String>,
    stock: BTreeMap<(String, String), String>,
    broken_zones: BTreeSet<String>,
    out_of_stock: BTreeSet<String>,
    without_address: bool,
    actions: Vec<String>,
}

type Shared = Arc<Mutex<FakeState>>;

fn lock(state: &Shared) -> MutexGuard<'_, FakeState> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn authorised(headers: &HeaderMap) -> bool {
    headers
        .get("X-Auth-Token")
        .is_some_and(|token| token == "dummy")
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"type": "unknown_resource", "message": "not found"})),
    )
        .into_response()
}

async fn create(
    State(state): State<Shared>,
    Path(zone): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorised(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let commercial_type = body["commercial_type"].as_str().unwrap_or_default().to_owned();
    let mut fake = lock(&state);
    if fake.out_of_stock.contains(&commercial_type) {
        return (
            StatusCode::PRECONDITION_FAILED,
            Json(json!({"type": "out_of_stock", "message": "no capacity left"})),
        )
            .into_response();
    }
    assert_eq!(body["stopped"], json!(true), "servers are created stopped");
    assert_eq!(body["image"], json!(IMAGE_ID));
    fake.next_id += 1;
    let id = format!("srv-{}", fake.next_id);
    let server = FakeServer {
        zone,
        name: body["name"].as_str().unwrap_or_default().to_owned(),
        state: String::from("stopped"),
        tags: serde_json::from_value(body["tags"].clone()).unwrap_or_default(),
        address: None,
        commercial_type,
    };
    let reply = server.to_json(&id);
    fake.servers.insert(id, server);
    (StatusCode::CREATED, Json(json!({"server": reply}))).into_response()
}

async fn action(
    State(state): State<Shared>,
    Path((_zone, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let requested = body["action"].as_str().unwrap_or_default().to_owned();
    let mut fake = lock(&state);
    fake.actions.push(format!("{requested} {id}"));
    let without_address = fake.without_address;
    let count = fake.servers.len();
    match requested.as_str() {
        "poweron" => {
            let Some(server) = fake.servers.get_mut(&id) else {
                return not_found();
            };
            server.state = String::from("running");
            if !without_address {
                server.address = Some(format!("51.15.0.{count}"));
            }
        }
        "terminate" => {
            fake.servers.remove(&id);
        }
        _ => return StatusCode::BAD_REQUEST.into_response(),
    }
    (StatusCode::ACCEPTED, Json(json!({"task": {"id": "task-1"}}))).into_response()
}

async fn fetch(State(state): State<Shared>, Path((_zone, id)): Path<(String, String)>) -> Response {
    let fake = lock(&state);
    match fake.servers.get(&id) {
        Some(server) => Json(json!({"server": server.to_json(&id)})).into_response(),
        None => not_found(),
    }
}

async fn remove(State(state): State<Shared>, Path((_zone, id)): Path<(String, String)>) -> Response {
    let mut fake = lock(&state);
    fake.actions.push(format!("delete {id}"));
    match fake.servers.remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => not_found(),
    }
}

async fn list(
    State(state): State<Shared>,
    Path(zone): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let fake = lock(&state);
    let wanted: Vec<&str> = params
        .get("tags")
        .map(|tags| tags.split(',').collect())
        .unwrap_or_default();
    let page = params
        .get("page")
        .and_then(|page| page.parse::<u32>().ok())
        .unwrap_or(1);
    let servers: Vec<Value> = if page > 1 {
        Vec::new()
    } else {
        fake.servers
            .iter()
            .filter(|(_, server)| server.zone == zone)
            .filter(|(_, server)| wanted.iter().all(|tag| server.tags.iter().any(|t| t == tag)))
            .map(|(id, server)| server.to_json(id))
            .collect()
    };
    Json(json!({"servers": servers})).into_response()
}

async fn catalogue(State(state): State<Shared>) -> Response {
    let fake = lock(&state);
    let servers: serde_json::Map<String, Value> = fake
        .catalogue
        .iter()
        .map(|name| (name.clone(), json!({"ncpus": 2})))
        .collect();
    Json(json!({"servers": servers})).into_response()
}

async fn availability(State(state): State<Shared>, Path(zone): Path<String>) -> Response {
    let fake = lock(&state);
    if fake.broken_zones.contains(&zone) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let servers: serde_json::Map<String, Value> = fake
        .stock
        .iter()
        .filter(|((stock_zone, _), _)| *stock_zone == zone)
        .map(|((_, name), level)| (name.clone(), json!({"availability": level})))
        .collect();
    Json(json!({"servers": servers})).into_response()
}

struct FakeApi {
    state: Shared,
    base_url: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FakeApi {
    async fn start(state: FakeState) -> Self {
        let shared: Shared = Arc::new(Mutex::new(state));
        let app = Router::new()
            .route("/zones/{zone}/servers", post(create).get(list))
            .route("/zones/{zone}/servers/{id}", get(fetch).delete(remove))
            .route("/zones/{zone}/servers/{id}/action", post(action))
            .route("/zones/{zone}/products/servers", get(catalogue))
            .route(
                "/zones/{zone}/products/servers/availability",
                get(availability),
            )
            .with_state(Arc::clone(&shared));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind fake api: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("fake api address: {err}"));
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _closed = shutdown_rx.await;
            });
            let _finished = server.await;
        });

        Self {
            state: shared,
            base_url: format!("http://{addr}"),
            shutdown: Some(shutdown),
        }
    }

    fn provider(&self) -> ScalewayProvider {
        ScalewayProvider::new(dummy_config())
            .unwrap_or_else(|err| panic!("dummy config should validate: {err}"))
            .with_api_base(&self.base_url)
            .with_zones(["fr-par-1", "fr-par-2"])
            .with_poll_interval(Duration::from_millis(5))
            .with_delete_timeout(Duration::from_secs(2))
    }

    fn actions(&self) -> Vec<String> {
        lock(&self.state).actions.clone()
    }

    fn server_count(&self) -> usize {
        lock(&self.state).servers.len()
    }
}

impl Drop for FakeApi {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _sent = tx.send(());
        }
    }
}

fn spec(name: &str, zone: &str) -> ServerSpec {
    ServerSpec::new(name, "DEV1-S", zone, IMAGE_ID)
        .with_label(FOREST_LABEL, "forest-1")
        .with_user_data(Some(String::from("#cloud-config\n")))
}

#[rstest]
#[tokio::test]
async fn created_servers_boot_with_addresses() {
    let api = FakeApi::start(FakeState::default()).await;
    let provider = api.provider();

    let handle = provider
        .create_server(&spec("forest-1-node-1", "fr-par-2"))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));
    assert_eq!(handle.location, "fr-par-2");

    let details = provider
        .wait_for_server(&handle, ServerState::Running, Duration::from_secs(2))
        .await
        .unwrap_or_else(|err| panic!("server should come up: {err}"));
    assert_eq!(details.state, ServerState::Running);
    assert!(details.addresses.is_some());
    assert_eq!(details.labels.get(FOREST_LABEL).map(String::as_str), Some("forest-1"));
    assert_eq!(api.actions(), vec![format!("poweron {}", handle.id)]);
}

#[rstest]
#[tokio::test]
async fn running_server_without_address_is_returned_at_the_deadline() {
    let api = FakeApi::start(FakeState {
        without_address: true,
        ..FakeState::default()
    })
    .await;
    let provider = api.provider();
    let handle = provider
        .create_server(&spec("forest-1-node-1", "fr-par-1"))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    let details = provider
        .wait_for_server(&handle, ServerState::Running, Duration::from_millis(50))
        .await
        .unwrap_or_else(|err| panic!("running server should be reported: {err}"));
    assert!(details.addresses.is_none());
}

#[rstest]
#[tokio::test]
async fn waiting_for_an_unreached_state_times_out() {
    let api = FakeApi::start(FakeState::default()).await;
    let provider = api.provider();
    let handle = provider
        .create_server(&spec("forest-1-node-1", "fr-par-1"))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    let err = provider
        .wait_for_server(&handle, ServerState::Stopped, Duration::from_millis(30))
        .await
        .expect_err("server never stops");
    assert!(matches!(err, ScalewayProviderError::Timeout { .. }));
}

#[rstest]
#[tokio::test]
async fn out_of_stock_is_reported_as_capacity() {
    let api = FakeApi::start(FakeState {
        out_of_stock: BTreeSet::from([String::from("DEV1-S")]),
        ..FakeState::default()
    })
    .await;

    let err = api
        .provider()
        .create_server(&spec("forest-1-node-1", "fr-par-1"))
        .await
        .expect_err("create should fail");
    assert!(matches!(err, ScalewayProviderError::OutOfStock { .. }));
    assert!(crate::selection::is_capacity_error(&err.to_string()));
    assert_eq!(api.server_count(), 0);
}

#[rstest]
#[tokio::test]
async fn running_servers_are_terminated() {
    let api = FakeApi::start(FakeState::default()).await;
    let provider = api.provider();
    let handle = provider
        .create_server(&spec("forest-1-node-1", "fr-par-1"))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    provider
        .delete_server(handle.clone())
        .await
        .unwrap_or_else(|err| panic!("delete should succeed: {err}"));
    assert_eq!(api.server_count(), 0);
    assert_eq!(
        api.actions().last().map(String::as_str),
        Some(format!("terminate {}", handle.id).as_str())
    );
}

#[rstest]
#[tokio::test]
async fn deleting_a_missing_server_succeeds() {
    let api = FakeApi::start(FakeState::default()).await;
    api.provider()
        .delete_server(ServerHandle {
            id: String::from("srv-404"),
            location: String::from("fr-par-1"),
        })
        .await
        .unwrap_or_else(|err| panic!("missing server counts as deleted: {err}"));
    assert!(api.actions().is_empty());
}

#[rstest]
#[tokio::test]
async fn listing_filters_by_forest_across_zones() {
    let api = FakeApi::start(FakeState::default()).await;
    let provider = api.provider();
    for (name, zone) in [("forest-1-node-1", "fr-par-1"), ("forest-1-node-2", "fr-par-2")] {
        provider
            .create_server(&spec(name, zone))
            .await
            .unwrap_or_else(|err| panic!("create should succeed: {err}"));
    }
    provider
        .create_server(
            &ServerSpec::new("forest-2-node-1", "DEV1-S", "fr-par-1", IMAGE_ID)
                .with_label(FOREST_LABEL, "forest-2"),
        )
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    let mut names: Vec<String> = provider
        .list_servers(&ServerFilter::for_forest("forest-1"))
        .await
        .unwrap_or_else(|err| panic!("list should succeed: {err}"))
        .into_iter()
        .map(|details| details.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["forest-1-node-1", "forest-1-node-2"]);
}

#[rstest]
#[tokio::test]
async fn availability_skips_shortages_and_broken_zones() {
    let api = FakeApi::start(FakeState {
        stock: BTreeMap::from([
            (
                (String::from("fr-par-1"), String::from("DEV1-S")),
                String::from("shortage"),
            ),
            (
                (String::from("fr-par-2"), String::from("DEV1-S")),
                String::from("available"),
            ),
            (
                (String::from("fr-par-3"), String::from("DEV1-S")),
                String::from("scarce"),
            ),
        ]),
        broken_zones: BTreeSet::from([String::from("fr-par-3")]),
        ..FakeState::default()
    })
    .await;
    let provider = api.provider().with_zones(["fr-par-1", "fr-par-2", "fr-par-3"]);

    let zones = provider
        .available_locations("DEV1-S")
        .await
        .unwrap_or_else(|err| panic!("availability should succeed: {err}"));
    assert_eq!(zones, vec![String::from("fr-par-2")]);
}

#[rstest]
#[tokio::test]
async fn availability_fails_when_no_zone_answers() {
    let api = FakeApi::start(FakeState {
        broken_zones: BTreeSet::from([String::from("fr-par-1"), String::from("fr-par-2")]),
        ..FakeState::default()
    })
    .await;

    let err = api
        .provider()
        .available_locations("DEV1-S")
        .await
        .expect_err("every zone failed");
    assert!(matches!(err, ScalewayProviderError::Api { status: 500, .. }));
}

#[rstest]
#[case::known("DEV1-S", true)]
#[case::unknown("GPU-9000", false)]
#[tokio::test]
async fn server_types_are_checked_against_the_catalogue(
    #[case] server_type: &str,
    #[case] expected: bool,
) {
    let api = FakeApi::start(FakeState {
        catalogue: vec![String::from("DEV1-S"), String::from("DEV1-M")],
        ..FakeState::default()
    })
    .await;

    let exists = api
        .provider()
        .validate_server_type(server_type)
        .await
        .unwrap_or_else(|err| panic!("catalogue lookup should succeed: {err}"));
    assert_eq!(exists, expected);
}
