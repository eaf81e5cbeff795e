//! Scaleway implementation of [`MachineProvider`].
//!
//! Servers are created stopped with their cloud-init payload, then powered
//! on. Every server carries a `forester` tag plus one `key=value` tag per
//! label, which is how forest membership is recovered when listing.

mod error;
mod lifecycle;
mod types;

use std::time::Duration;

use scaleway_rs::ScalewayApi;
use tracing::{info, warn};

use crate::config::ScalewayConfig;
use crate::provider::{
    MachineProvider, ProviderFuture, ServerDetails, ServerFilter, ServerHandle, ServerSpec,
    ServerState,
};
use types::Zone;

pub use error::ScalewayProviderError;

/// Zones searched for capacity and for forest servers.
pub const SCALEWAY_ZONES: &[&str] = &[
    "fr-par-1", "fr-par-2", "fr-par-3", "nl-ams-1", "nl-ams-2", "nl-ams-3", "pl-waw-1",
    "pl-waw-2", "pl-waw-3",
];

const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const DELETE_TIMEOUT: Duration = Duration::from_secs(300);

/// Provider that manages servers through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayProvider {
    api: ScalewayApi,
    config: ScalewayConfig,
    api_base: String,
    zones: Vec<String>,
    poll_interval: Duration,
    delete_timeout: Duration,
}

impl ScalewayProvider {
    /// Constructs a provider from configuration.
    ///
    /// The configured default zone is searched first, followed by every
    /// other zone in [`SCALEWAY_ZONES`].
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayProviderError::Config`] when the provided
    /// configuration fails validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ScalewayProviderError> {
        config.validate()?;
        let default_zone = config.default_zone.trim().to_owned();
        let mut zones = vec![default_zone.clone()];
        zones.extend(
            SCALEWAY_ZONES
                .iter()
                .filter(|zone| **zone != default_zone)
                .map(|zone| (*zone).to_owned()),
        );
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config,
            api_base: SCALEWAY_INSTANCE_API_BASE.to_owned(),
            zones,
            poll_interval: POLL_INTERVAL,
            delete_timeout: DELETE_TIMEOUT,
        })
    }

    /// Sends Instances API calls to `base` instead of the public endpoint.
    #[must_use]
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_owned();
        self
    }

    /// Restricts the zones searched for capacity and forest servers.
    #[must_use]
    pub fn with_zones<I, S>(mut self, zones: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.zones = zones.into_iter().map(Into::into).collect();
        self
    }

    /// Overrides the delay between state polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides how long a deletion may take to disappear from the API.
    #[must_use]
    pub const fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    /// Zones searched, in order.
    #[must_use]
    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    /// Validated configuration.
    #[must_use]
    pub const fn config(&self) -> &ScalewayConfig {
        &self.config
    }
}

impl MachineProvider for ScalewayProvider {
    type Error = ScalewayProviderError;

    fn name(&self) -> &str {
        "scaleway"
    }

    fn create_server<'a>(
        &'a self,
        spec: &'a ServerSpec,
    ) -> ProviderFuture<'a, ServerHandle, Self::Error> {
        Box::pin(async move {
            spec.validate()?;
            let zone = Zone::from(spec.location.as_str());
            let image_id = self.resolve_image_id(&zone, &spec.image).await?;
            let snapshot = self.create_server_stopped(spec, &image_id).await?;
            let handle = ServerHandle {
                id: snapshot.id.as_str().to_owned(),
                location: spec.location.clone(),
            };

            if let Err(err) = self.power_on_if_needed(&snapshot).await {
                if let Err(cleanup) = self.delete(handle.clone()).await {
                    warn!(server_id = %handle.id, error = %cleanup, "failed to remove server that never booted");
                }
                return Err(err);
            }

            info!(
                server_id = %handle.id,
                zone = %handle.location,
                server_type = %spec.machine_type,
                "server created"
            );
            Ok(handle)
        })
    }

    fn wait_for_server<'a>(
        &'a self,
        handle: &'a ServerHandle,
        target: ServerState,
        timeout: Duration,
    ) -> ProviderFuture<'a, ServerDetails, Self::Error> {
        Box::pin(async move { self.wait_for_state(handle, &target, timeout).await })
    }

    fn delete_server(&self, handle: ServerHandle) -> ProviderFuture<'_, (), Self::Error> {
        Box::pin(async move { self.delete(handle).await })
    }

    fn list_servers<'a>(
        &'a self,
        filter: &'a ServerFilter,
    ) -> ProviderFuture<'a, Vec<ServerDetails>, Self::Error> {
        Box::pin(async move { self.list_labelled(filter).await })
    }

    fn available_locations<'a>(
        &'a self,
        machine_type: &'a str,
    ) -> ProviderFuture<'a, Vec<String>, Self::Error> {
        Box::pin(async move { self.available_zones(machine_type).await })
    }

    fn validate_server_type<'a>(
        &'a self,
        machine_type: &'a str,
    ) -> ProviderFuture<'a, bool, Self::Error> {
        Box::pin(async move { self.server_type_exists(machine_type).await })
    }
}
