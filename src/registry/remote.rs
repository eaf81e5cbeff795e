//! Registry stored as one JSON document behind an HTTP endpoint.
//!
//! Reads return the document together with its entity tag. Writes are
//! conditional on that tag so a writer holding a stale snapshot is rejected
//! with `412 Precondition Failed` instead of overwriting a newer document.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, ETAG, IF_MATCH, IF_NONE_MATCH};
use reqwest::{Method, RequestBuilder, StatusCode};
use tracing::{debug, warn};

use super::{
    Forest, ForestChange, ForestStatus, InfallibleFuture, Node, NodeStatus, Registry, RegistryData,
    RegistryError, RegistryFuture,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Registry document together with the entity tag it was read at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Snapshot {
    /// Decoded registry document.
    pub data: RegistryData,
    /// Entity tag returned by the server; `None` when the document does not
    /// exist yet.
    pub etag: Option<String>,
}

/// Registry backed by an HTTP blob store with conditional writes.
#[derive(Clone, Debug)]
pub struct RemoteRegistry {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl RemoteRegistry {
    /// Creates a registry for the document at `url`, optionally
    /// authenticating with a bearer token.
    #[must_use]
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url, token)
    }

    /// Creates a registry using an existing HTTP client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            token: token.filter(|value| !value.trim().is_empty()),
        }
    }

    /// Document URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self, method: Method) -> RequestBuilder {
        let builder = self
            .client
            .request(method, &self.url)
            .timeout(REQUEST_TIMEOUT);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, RegistryError> {
        let response = builder
            .send()
            .await
            .map_err(|err| RegistryError::Unreachable {
                endpoint: self.url.clone(),
                message: err.to_string(),
            })?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RegistryError::Unauthorized {
                endpoint: self.url.clone(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn unexpected(&self, response: reqwest::Response) -> RegistryError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_owned()
        } else {
            body.trim().to_owned()
        };
        RegistryError::UnexpectedStatus {
            endpoint: self.url.clone(),
            status: status.as_u16(),
            message,
        }
    }

    /// Reads the current document and its entity tag.
    ///
    /// A missing or empty document yields a fresh snapshot at version 1.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unreachable`], [`RegistryError::Unauthorized`]
    /// or [`RegistryError::UnexpectedStatus`] for transport and HTTP failures
    /// and [`RegistryError::Document`] when the body cannot be decoded.
    pub async fn fetch(&self) -> Result<Snapshot, RegistryError> {
        let response = self.send(self.request(Method::GET)).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Snapshot {
                data: RegistryData::new(),
                etag: None,
            });
        }
        if !status.is_success() {
            return Err(self.unexpected(response).await);
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response
            .text()
            .await
            .map_err(|err| RegistryError::Unreachable {
                endpoint: self.url.clone(),
                message: err.to_string(),
            })?;
        if body.trim().is_empty() {
            return Ok(Snapshot {
                data: RegistryData::new(),
                etag,
            });
        }
        let data = serde_json::from_str(&body)?;
        Ok(Snapshot { data, etag })
    }

    /// Writes `data`, conditional on the document still being at `etag`.
    ///
    /// When `etag` is `None` the write only succeeds if no document exists.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ConcurrentModification`] when the server
    /// rejects the precondition, plus the transport errors of
    /// [`RemoteRegistry::fetch`].
    pub async fn store(&self, data: &RegistryData, etag: Option<&str>) -> Result<(), RegistryError> {
        let body = serde_json::to_vec(data)?;
        let builder = self
            .request(Method::PUT)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        let builder = match etag {
            Some(tag) => builder.header(IF_MATCH, tag),
            None => builder.header(IF_NONE_MATCH, "*"),
        };

        let response = self.send(builder).await?;
        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED || status == StatusCode::CONFLICT {
            debug!(endpoint = %self.url, version = data.version, "registry write lost the race");
            return Err(RegistryError::ConcurrentModification);
        }
        if !status.is_success() {
            return Err(self.unexpected(response).await);
        }
        debug!(endpoint = %self.url, version = data.version, "registry document stored");
        Ok(())
    }

    /// Performs one read-mutate-write cycle.
    ///
    /// The mutation runs against a fresh read; if another writer stores a
    /// newer document before ours lands, the write is rejected and
    /// [`RegistryError::ConcurrentModification`] is returned without retrying.
    ///
    /// # Errors
    ///
    /// Returns the mutation's own error unchanged, or any error of
    /// [`RemoteRegistry::fetch`] and [`RemoteRegistry::store`].
    pub async fn update<T, F>(&self, mutate: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut RegistryData) -> Result<T, RegistryError> + Send,
        T: Send,
    {
        let Snapshot { mut data, etag } = self.fetch().await?;
        let outcome = mutate(&mut data)?;
        self.store(&data, etag.as_deref()).await?;
        Ok(outcome)
    }

    async fn read<T>(
        &self,
        read: impl FnOnce(&RegistryData) -> Result<T, RegistryError> + Send,
    ) -> Result<T, RegistryError> {
        let snapshot = self.fetch().await?;
        read(&snapshot.data)
    }
}

impl Registry for RemoteRegistry {
    fn endpoint(&self) -> String {
        self.url.clone()
    }

    fn register_forest(&self, forest: Forest) -> RegistryFuture<'_, ()> {
        Box::pin(async move { self.update(|data| data.insert_forest(forest)).await })
    }

    fn register_node(&self, node: Node) -> RegistryFuture<'_, ()> {
        Box::pin(async move { self.update(|data| data.insert_node(node)).await })
    }

    fn remove_node<'a>(
        &'a self,
        forest_id: &'a str,
        node_id: &'a str,
    ) -> RegistryFuture<'a, Node> {
        Box::pin(async move {
            self.update(|data| data.remove_node(forest_id, node_id))
                .await
        })
    }

    fn get_forest<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, Forest> {
        Box::pin(async move { self.read(|data| data.forest(forest_id).cloned()).await })
    }

    fn get_nodes<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, Vec<Node>> {
        Box::pin(async move {
            self.read(|data| data.nodes(forest_id).map(<[Node]>::to_vec))
                .await
        })
    }

    fn update_forest(&self, forest: Forest) -> RegistryFuture<'_, ()> {
        Box::pin(async move { self.update(|data| data.replace_forest(forest)).await })
    }

    fn amend_forest<'a>(
        &'a self,
        forest_id: &'a str,
        change: ForestChange,
    ) -> RegistryFuture<'a, Forest> {
        Box::pin(async move {
            self.update(|data| data.amend_forest(forest_id, &change))
                .await
        })
    }

    fn update_forest_status<'a>(
        &'a self,
        forest_id: &'a str,
        status: ForestStatus,
    ) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.update(|data| data.set_forest_status(forest_id, status))
                .await
        })
    }

    fn update_node_status<'a>(
        &'a self,
        forest_id: &'a str,
        node_id: &'a str,
        status: NodeStatus,
    ) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.update(|data| data.set_node_status(forest_id, node_id, status))
                .await
        })
    }

    fn delete_forest<'a>(&'a self, forest_id: &'a str) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.update(|data| data.remove_forest(forest_id).map(|_| ()))
                .await
        })
    }

    fn list_forests(&self) -> InfallibleFuture<'_, Vec<Forest>> {
        Box::pin(async move {
            match self.fetch().await {
                Ok(snapshot) => snapshot.data.forest_list(),
                Err(err) => {
                    warn!(endpoint = %self.url, error = %err, "failed to read registry; listing no forests");
                    Vec::new()
                }
            }
        })
    }

    fn check_reachable(&self) -> RegistryFuture<'_, ()> {
        Box::pin(async move {
            let response = self.send(self.request(Method::OPTIONS)).await?;
            if response.status().is_server_error() {
                return Err(self.unexpected(response).await);
            }
            Ok(())
        })
    }
}
