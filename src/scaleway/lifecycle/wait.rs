//! State polling and teardown helpers for the Scaleway provider.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::provider::{ServerDetails, ServerHandle, ServerState};

use super::super::{ScalewayProvider, ScalewayProviderError};
use super::{ServerEnvelope, ServerSnapshot};

impl ScalewayProvider {
    pub(in crate::scaleway) async fn fetch_server(
        &self,
        handle: &ServerHandle,
    ) -> Result<Option<ServerSnapshot>, ScalewayProviderError> {
        let url = self.zone_url(&handle.location, &format!("servers/{}", handle.id));
        let response = self.send(self.request(Method::GET, &url)).await?;
        if response.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status.is_success() {
            return Err(response.into_error());
        }
        let envelope: ServerEnvelope = response.parse()?;
        Ok(Some(ServerSnapshot::from_body(
            envelope.server,
            &handle.location,
        )))
    }

    /// Polls until the server reaches `target`.
    ///
    /// A running server is only reported once it has a public address, unless
    /// the deadline passes first; the caller then sees it without addresses.
    pub(in crate::scaleway) async fn wait_for_state(
        &self,
        handle: &ServerHandle,
        target: &ServerState,
        timeout: Duration,
    ) -> Result<ServerDetails, ScalewayProviderError> {
        let deadline = Instant::now() + timeout;
        let mut reached = None;

        loop {
            let Some(snapshot) = self.fetch_server(handle).await? else {
                return Err(ScalewayProviderError::ServerFailed {
                    server_id: handle.id.clone(),
                    state: String::from("gone"),
                });
            };
            let state = ServerState::from_provider(&snapshot.state);
            if let ServerState::Other(raw) = &state {
                return Err(ScalewayProviderError::ServerFailed {
                    server_id: handle.id.clone(),
                    state: raw.clone(),
                });
            }
            if state == *target {
                if *target != ServerState::Running || snapshot.addresses.is_some() {
                    return Ok(snapshot.details());
                }
                reached = Some(snapshot);
            }
            debug!(server_id = %handle.id, state = %state, target = %target, "waiting for server");

            if Instant::now() >= deadline {
                break;
            }
            sleep(self.poll_interval).await;
        }

        reached
            .map(|snapshot| snapshot.details())
            .ok_or_else(|| ScalewayProviderError::Timeout {
                action: format!("state {target}"),
                server_id: handle.id.clone(),
            })
    }

    /// Deletes a server and waits until the API no longer lists it.
    ///
    /// Running servers are terminated, which also releases their local
    /// volumes; stopped servers are deleted directly.
    pub(in crate::scaleway) async fn delete(
        &self,
        handle: ServerHandle,
    ) -> Result<(), ScalewayProviderError> {
        let Some(snapshot) = self.fetch_server(&handle).await? else {
            return Ok(());
        };

        if snapshot.allows("terminate") {
            self.perform_action(&handle.location, &handle.id, "terminate")
                .await?;
        } else {
            let url = self.zone_url(&handle.location, &format!("servers/{}", handle.id));
            let response = self.send(self.request(Method::DELETE, &url)).await?;
            if !response.status.is_success() && response.status != StatusCode::NOT_FOUND {
                return Err(response.into_error());
            }
        }

        self.wait_until_gone(&handle).await
    }

    pub(in crate::scaleway) async fn wait_until_gone(
        &self,
        handle: &ServerHandle,
    ) -> Result<(), ScalewayProviderError> {
        let deadline = Instant::now() + self.delete_timeout;
        while Instant::now() <= deadline {
            if self.fetch_server(handle).await?.is_none() {
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }

        Err(ScalewayProviderError::ResidualResource {
            server_id: handle.id.clone(),
        })
    }
}
