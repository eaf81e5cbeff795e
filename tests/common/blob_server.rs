//! In-process HTTP blob store with entity-tag preconditions.
//!
//! Serves a single JSON document at `/registry.json`. `GET` returns the
//! document with an `ETag`; `PUT` honours `If-Match` and `If-None-Match: *`
//! and answers `412 Precondition Failed` when the precondition does not hold.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, ETAG, IF_MATCH, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::oneshot;

#[derive(Default)]
struct Blob {
    body: Option<Vec<u8>>,
    generation: u64,
    token: Option<String>,
    writes: usize,
    rejected: usize,
}

impl Blob {
    fn etag(&self) -> String {
        format!("\"gen-{}\"", self.generation)
    }
}

type Shared = Arc<Mutex<Blob>>;

fn lock(state: &Shared) -> MutexGuard<'_, Blob> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn authorised(blob: &Blob, headers: &HeaderMap) -> bool {
    blob.token.as_ref().is_none_or(|token| {
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == format!("Bearer {token}"))
    })
}

fn with_etag(status: StatusCode, etag: &str, body: Vec<u8>) -> Response {
    let mut response = (status, body).into_response();
    if let Ok(value) = HeaderValue::from_str(etag) {
        response.headers_mut().insert(ETAG, value);
    }
    response
}

async fn read(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let blob = lock(&state);
    if !authorised(&blob, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match &blob.body {
        Some(body) => with_etag(StatusCode::OK, &blob.etag(), body.clone()),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn write(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Response {
    let mut blob = lock(&state);
    if !authorised(&blob, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let current = blob.body.as_ref().map(|_| blob.etag());
    let if_match = headers.get(IF_MATCH).and_then(|value| value.to_str().ok());
    let if_none_match = headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok());
    let accepted = match (if_match, if_none_match) {
        (Some(tag), _) => current.as_deref() == Some(tag),
        (None, Some("*")) => current.is_none(),
        _ => true,
    };
    if !accepted {
        blob.rejected += 1;
        return StatusCode::PRECONDITION_FAILED.into_response();
    }
    blob.generation += 1;
    blob.writes += 1;
    blob.body = Some(body.to_vec());
    let etag = blob.etag();
    with_etag(StatusCode::OK, &etag, Vec::new())
}

async fn options(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let blob = lock(&state);
    if authorised(&blob, &headers) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

/// Blob store running on `127.0.0.1:0` until dropped.
pub struct BlobServer {
    state: Shared,
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
}

#[allow(
    dead_code,
    reason = "each test binary includes this module and uses a different subset"
)]
impl BlobServer {
    /// Starts a server with no document.
    pub async fn start() -> Self {
        Self::start_with(Blob::default()).await
    }

    /// Starts a server that requires `Authorization: Bearer <token>`.
    pub async fn start_with_token(token: &str) -> Self {
        Self::start_with(Blob {
            token: Some(token.to_owned()),
            ..Blob::default()
        })
        .await
    }

    async fn start_with(blob: Blob) -> Self {
        let state: Shared = Arc::new(Mutex::new(blob));
        let app = Router::new()
            .route("/registry.json", get(read).put(write).options(options))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind blob server: {err}"));
        let addr: SocketAddr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("blob server address: {err}"));
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _closed = shutdown_rx.await;
            });
            let _finished = server.await;
        });

        Self {
            state,
            url: format!("http://{addr}/registry.json"),
            shutdown: Some(shutdown),
        }
    }

    /// Document URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        lock(&self.state).writes
    }

    /// Writes rejected by a precondition so far.
    pub fn rejected(&self) -> usize {
        lock(&self.state).rejected
    }

    /// Replaces the stored document without going through HTTP.
    pub fn put_raw(&self, body: &str) {
        let mut blob = lock(&self.state);
        blob.generation += 1;
        blob.body = Some(body.as_bytes().to_vec());
    }

    /// Stored document, if any.
    pub fn raw(&self) -> Option<String> {
        lock(&self.state)
            .body
            .as_ref()
            .map(|body| String::from_utf8_lossy(body).into_owned())
    }
}

impl Drop for BlobServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _sent = tx.send(());
        }
    }
}
