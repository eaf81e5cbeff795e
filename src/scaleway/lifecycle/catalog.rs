//! Server type catalogue, zone availability, and labelled server listing.

use std::collections::BTreeMap;

use reqwest::Method;
use serde::Deserialize;
use serde::de::IgnoredAny;
use tracing::warn;

use crate::provider::{FOREST_LABEL, ServerDetails, ServerFilter};

use super::super::{ScalewayProvider, ScalewayProviderError};
use super::{ServerBody, ServerSnapshot};

const PAGE_SIZE: usize = 100;
const SHORTAGE: &str = "shortage";

#[derive(Deserialize)]
struct CatalogPage {
    #[serde(default)]
    servers: BTreeMap<String, IgnoredAny>,
}

#[derive(Deserialize)]
struct AvailabilityEntry {
    availability: String,
}

#[derive(Deserialize)]
struct AvailabilityPage {
    #[serde(default)]
    servers: BTreeMap<String, AvailabilityEntry>,
}

#[derive(Deserialize)]
struct ServerPage {
    #[serde(default)]
    servers: Vec<ServerBody>,
}

impl ScalewayProvider {
    /// Looks `server_type` up in the default zone's product catalogue.
    pub(in crate::scaleway) async fn server_type_exists(
        &self,
        server_type: &str,
    ) -> Result<bool, ScalewayProviderError> {
        let url = self.zone_url(&self.config.default_zone, "products/servers");
        let mut page = 1_usize;
        loop {
            let response = self
                .send(self.request(Method::GET, &url).query(&[
                    ("per_page", PAGE_SIZE.to_string()),
                    ("page", page.to_string()),
                ]))
                .await?;
            if !response.status.is_success() {
                return Err(response.into_error());
            }
            let body: CatalogPage = response.parse()?;
            if body.servers.contains_key(server_type) {
                return Ok(true);
            }
            if body.servers.len() < PAGE_SIZE {
                return Ok(false);
            }
            page += 1;
        }
    }

    async fn zone_has_stock(
        &self,
        zone: &str,
        server_type: &str,
    ) -> Result<bool, ScalewayProviderError> {
        let url = self.zone_url(zone, "products/servers/availability");
        let response = self.send(self.request(Method::GET, &url)).await?;
        if !response.status.is_success() {
            return Err(response.into_error());
        }
        let body: AvailabilityPage = response.parse()?;
        Ok(body
            .servers
            .get(server_type)
            .is_some_and(|entry| entry.availability != SHORTAGE))
    }

    /// Zones in search order where `server_type` is not in shortage.
    ///
    /// A zone whose availability cannot be read is skipped with a warning;
    /// the call only fails when no zone could be read at all.
    pub(in crate::scaleway) async fn available_zones(
        &self,
        server_type: &str,
    ) -> Result<Vec<String>, ScalewayProviderError> {
        let mut available = Vec::new();
        let mut last_error = None;
        let mut answered = 0_usize;
        for zone in &self.zones {
            match self.zone_has_stock(zone, server_type).await {
                Ok(has_stock) => {
                    answered += 1;
                    if has_stock {
                        available.push(zone.clone());
                    }
                }
                Err(err) => {
                    warn!(zone = %zone, server_type, error = %err, "availability lookup failed");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) if answered == 0 => Err(err),
            _ => Ok(available),
        }
    }

    /// Lists servers carrying every label in `filter`.
    pub(in crate::scaleway) async fn list_labelled(
        &self,
        filter: &ServerFilter,
    ) -> Result<Vec<ServerDetails>, ScalewayProviderError> {
        let zones = if filter.locations.is_empty() {
            &self.zones
        } else {
            &filter.locations
        };
        let tag = filter
            .labels
            .get(FOREST_LABEL)
            .map(|forest| format!("{FOREST_LABEL}={forest}"));

        let mut servers = Vec::new();
        for zone in zones {
            let url = self.zone_url(zone, "servers");
            let mut page = 1_usize;
            loop {
                let mut query = vec![
                    ("per_page", PAGE_SIZE.to_string()),
                    ("page", page.to_string()),
                ];
                if let Some(value) = &tag {
                    query.push(("tags", value.clone()));
                }
                let response = self
                    .send(self.request(Method::GET, &url).query(&query))
                    .await?;
                if !response.status.is_success() {
                    return Err(response.into_error());
                }
                let body: ServerPage = response.parse()?;
                let count = body.servers.len();
                servers.extend(
                    body.servers
                        .into_iter()
                        .map(|server| ServerSnapshot::from_body(server, zone).details())
                        .filter(|details| filter.matches(&details.labels)),
                );
                if count < PAGE_SIZE {
                    break;
                }
                page += 1;
            }
        }
        Ok(servers)
    }
}
