//! Server lifecycle helpers for the Scaleway provider.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

mod catalog;
mod create;
mod image;
mod wait;

use crate::provider::{NodeAddresses, ServerDetails, ServerHandle, ServerState};
use crate::scaleway::types::{Action, ServerId, Zone};

use super::{ScalewayProvider, ScalewayProviderError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Plain tag carried by every server this crate creates.
pub(crate) const MANAGED_TAG: &str = "forester";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

#[derive(Deserialize)]
struct AddressBody {
    address: String,
}

#[derive(Deserialize)]
pub(crate) struct ServerBody {
    id: String,
    #[serde(default)]
    name: String,
    state: String,
    #[serde(default)]
    allowed_actions: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    public_ip: Option<AddressBody>,
    #[serde(default)]
    public_ips: Vec<AddressBody>,
    #[serde(default)]
    ipv6: Option<AddressBody>,
}

#[derive(Deserialize)]
struct ServerEnvelope {
    server: ServerBody,
}

/// Server fields the lifecycle helpers care about.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ServerSnapshot {
    pub(crate) id: ServerId,
    pub(crate) name: String,
    pub(crate) zone: Zone,
    pub(crate) state: String,
    pub(crate) allowed_actions: Vec<Action>,
    pub(crate) addresses: Option<NodeAddresses>,
    pub(crate) tags: Vec<String>,
}

impl ServerSnapshot {
    pub(crate) fn from_body(body: ServerBody, zone: &str) -> Self {
        let mut ipv4 = None;
        let mut ipv6 = None;
        let candidates = body
            .public_ip
            .iter()
            .chain(body.public_ips.iter())
            .chain(body.ipv6.iter());
        for candidate in candidates {
            match candidate.address.parse::<IpAddr>() {
                Ok(IpAddr::V4(address)) if ipv4.is_none() => ipv4 = Some(address),
                Ok(IpAddr::V6(address)) if ipv6.is_none() => ipv6 = Some(address),
                _ => {}
            }
        }
        Self {
            id: body.id.into(),
            name: body.name,
            zone: zone.into(),
            state: body.state,
            allowed_actions: body.allowed_actions.into_iter().map(Action::from).collect(),
            addresses: NodeAddresses::new(ipv4, ipv6),
            tags: body.tags,
        }
    }

    pub(crate) fn allows(&self, action: &str) -> bool {
        self.allowed_actions
            .iter()
            .any(|allowed| allowed.as_str() == action)
    }

    pub(crate) fn details(&self) -> ServerDetails {
        ServerDetails {
            handle: ServerHandle {
                id: self.id.as_str().to_owned(),
                location: self.zone.as_str().to_owned(),
            },
            name: self.name.clone(),
            state: ServerState::from_provider(&self.state),
            addresses: self.addresses,
            labels: tags_to_labels(&self.tags),
        }
    }
}

/// Tags for a label map: the managed tag, then one `key=value` per label.
pub(crate) fn labels_to_tags(labels: &BTreeMap<String, String>) -> Vec<String> {
    std::iter::once(MANAGED_TAG.to_owned())
        .chain(labels.iter().map(|(key, value)| format!("{key}={value}")))
        .collect()
}

/// Recovers labels from `key=value` tags; plain tags are ignored.
pub(crate) fn tags_to_labels(tags: &[String]) -> BTreeMap<String, String> {
    tags.iter()
        .filter_map(|tag| tag.split_once('='))
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}

/// Error document returned by the Instances API.
#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    resource: Option<String>,
    #[serde(default)]
    resource_id: Option<String>,
}

/// Raw API answer.
pub(crate) struct ApiResponse {
    status: StatusCode,
    body: Vec<u8>,
}

impl ApiResponse {
    fn parse<T: DeserializeOwned>(&self) -> Result<T, ScalewayProviderError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    fn into_error(self) -> ScalewayProviderError {
        ScalewayProviderError::Api {
            status: self.status.as_u16(),
            message: String::from_utf8_lossy(&self.body).into_owned(),
        }
    }

    /// Maps a failed create into a capacity error when the body says so.
    fn into_create_error(self, server_type: &str, zone: &str) -> ScalewayProviderError {
        if let Ok(api_err) = serde_json::from_slice::<ApiErrorBody>(&self.body) {
            let text = format!("{} {}", api_err.kind, api_err.message).to_ascii_lowercase();
            if text.contains("out_of_stock") || text.contains("out of stock") {
                return ScalewayProviderError::OutOfStock {
                    server_type: server_type.to_owned(),
                    zone: zone.to_owned(),
                };
            }
            if is_server_type_error(&api_err, server_type) {
                return ScalewayProviderError::ServerTypeUnavailable {
                    server_type: server_type.to_owned(),
                    zone: zone.to_owned(),
                };
            }
        }
        self.into_error()
    }
}

fn is_server_type_error(api_err: &ApiErrorBody, server_type: &str) -> bool {
    matches!(api_err.resource.as_deref(), Some("commercial_type"))
        || api_err
            .resource_id
            .as_deref()
            .is_some_and(|id| id == server_type)
        || (api_err.kind == "invalid_arguments"
            && api_err
                .message
                .to_ascii_lowercase()
                .contains("commercial_type"))
}

impl ScalewayProvider {
    pub(in crate::scaleway) fn zone_url(&self, zone: &str, path: &str) -> String {
        format!("{}/zones/{zone}/{path}", self.api_base)
    }

    pub(in crate::scaleway) fn request(&self, method: Method, url: &str) -> RequestBuilder {
        HTTP_CLIENT
            .request(method, url)
            .header("X-Auth-Token", &self.config.secret_key)
    }

    pub(in crate::scaleway) async fn send(
        &self,
        builder: RequestBuilder,
    ) -> Result<ApiResponse, ScalewayProviderError> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests;
