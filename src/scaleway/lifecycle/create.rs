//! Server creation helpers for the Scaleway provider.
//!
//! Scaleway servers must receive cloud-init user-data before first boot.
//! The creation request sets `stopped: true` so the payload is in place when
//! the server is powered on.

use reqwest::Method;
use serde::Serialize;

use crate::provider::ServerSpec;

use super::super::{ScalewayProvider, ScalewayProviderError};
use super::{ServerEnvelope, ServerSnapshot, labels_to_tags};

#[derive(Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
    commercial_type: &'a str,
    image: &'a str,
    project: &'a str,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: Vec<String>,
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud_init: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<&'a str>,
}

#[derive(Serialize)]
struct ActionRequest<'a> {
    action: &'a str,
}

impl ScalewayProvider {
    /// Creates a server in a stopped state.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayProviderError::OutOfStock`] or
    /// [`ScalewayProviderError::ServerTypeUnavailable`] when the zone cannot
    /// host the server type, and other variants for any other failure.
    pub(in crate::scaleway) async fn create_server_stopped(
        &self,
        spec: &ServerSpec,
        image_id: &str,
    ) -> Result<ServerSnapshot, ScalewayProviderError> {
        let url = self.zone_url(&spec.location, "servers");
        let payload = CreateServerRequest {
            name: &spec.name,
            commercial_type: &spec.machine_type,
            image: image_id,
            project: &self.config.default_project_id,
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: labels_to_tags(&spec.labels),
            stopped: true,
            cloud_init: spec.user_data.as_deref(),
            organization: self.config.default_organization_id.as_deref(),
        };

        let response = self
            .send(self.request(Method::POST, &url).json(&payload))
            .await?;
        if !response.status.is_success() {
            return Err(response.into_create_error(&spec.machine_type, &spec.location));
        }
        let envelope: ServerEnvelope = response.parse()?;
        Ok(ServerSnapshot::from_body(envelope.server, &spec.location))
    }

    pub(in crate::scaleway) async fn power_on_if_needed(
        &self,
        snapshot: &ServerSnapshot,
    ) -> Result<(), ScalewayProviderError> {
        if snapshot.state == "running" {
            return Ok(());
        }

        if snapshot.allows("poweron") {
            return self
                .perform_action(snapshot.zone.as_str(), snapshot.id.as_str(), "poweron")
                .await;
        }

        Err(ScalewayProviderError::PowerOnNotAllowed {
            server_id: snapshot.id.as_str().to_owned(),
            state: snapshot.state.clone(),
        })
    }

    pub(in crate::scaleway) async fn perform_action(
        &self,
        zone: &str,
        server_id: &str,
        action: &str,
    ) -> Result<(), ScalewayProviderError> {
        let url = self.zone_url(zone, &format!("servers/{server_id}/action"));
        let response = self
            .send(
                self.request(Method::POST, &url)
                    .json(&ActionRequest { action }),
            )
            .await?;
        if response.status.is_success() {
            Ok(())
        } else {
            Err(response.into_error())
        }
    }
}
