//! Image resolution helpers for the Scaleway provider.
//!
//! Node specs carry a human readable image label. Project images take
//! precedence over public ones; within a source the newest available image
//! for the configured architecture wins.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};
use uuid::Uuid;

use super::super::{ScalewayProvider, ScalewayProviderError};
use crate::scaleway::types::Zone;

/// Image lookup inputs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ImageQuery {
    pub(crate) label: String,
    pub(crate) arch: String,
    pub(crate) zone: Zone,
}

impl ScalewayProvider {
    /// Resolves `label` to an image identifier in `zone`.
    ///
    /// A label that already parses as a UUID is used as-is.
    pub(in crate::scaleway) async fn resolve_image_id(
        &self,
        zone: &Zone,
        label: &str,
    ) -> Result<String, ScalewayProviderError> {
        if Uuid::parse_str(label).is_ok() {
            return Ok(label.to_owned());
        }

        let query = ImageQuery {
            label: label.to_owned(),
            arch: self.config.default_architecture.clone(),
            zone: zone.clone(),
        };
        let project_id = self.config.default_project_id.as_str();
        let organisation_id = self.config.default_organization_id.as_deref();
        let query_ref = &query;

        self.resolve_image_id_with(
            query_ref,
            || async move {
                if project_id.is_empty() {
                    Ok(Vec::new())
                } else {
                    let mut scoped =
                        ScalewayListInstanceImagesBuilder::new(self.api.clone(), &query_ref.zone)
                            .public(true)
                            .project(project_id)
                            .name(&query_ref.label)
                            .arch(&query_ref.arch);
                    if let Some(org) = organisation_id {
                        scoped = scoped.organization(org);
                    }
                    scoped
                        .run_async()
                        .await
                        .map_err(ScalewayProviderError::from)
                }
            },
            || async move {
                ScalewayListInstanceImagesBuilder::new(self.api.clone(), &query_ref.zone)
                    .public(true)
                    .name(&query_ref.label)
                    .arch(&query_ref.arch)
                    .run_async()
                    .await
                    .map_err(ScalewayProviderError::from)
            },
        )
        .await
    }

    pub(in crate::scaleway) async fn resolve_image_id_with<FutA, FutB, FetchA, FetchB>(
        &self,
        query: &ImageQuery,
        project_fetch: FetchA,
        public_fetch: FetchB,
    ) -> Result<String, ScalewayProviderError>
    where
        FetchA: FnOnce() -> FutA,
        FetchB: FnOnce() -> FutB,
        FutA: Future<Output = Result<Vec<ScalewayImage>, ScalewayProviderError>>,
        FutB: Future<Output = Result<Vec<ScalewayImage>, ScalewayProviderError>>,
    {
        let project_images = project_fetch().await?;

        let public_images = if project_images.is_empty() {
            public_fetch().await?
        } else {
            Vec::new()
        };

        Self::select_image_from_sources(project_images, public_images, query)
    }

    pub(in crate::scaleway) fn select_image_id(
        mut candidates: Vec<ScalewayImage>,
        query: &ImageQuery,
    ) -> Result<String, ScalewayProviderError> {
        if candidates.is_empty() {
            return Err(ScalewayProviderError::ImageNotFound {
                label: query.label.clone(),
                arch: query.arch.clone(),
                zone: query.zone.as_str().to_owned(),
            });
        }
        candidates.sort_by(|lhs, rhs| rhs.creation_date.cmp(&lhs.creation_date));
        Ok(candidates.remove(0).id)
    }

    pub(in crate::scaleway) fn select_image_from_sources(
        project_images: Vec<ScalewayImage>,
        public_images: Vec<ScalewayImage>,
        query: &ImageQuery,
    ) -> Result<String, ScalewayProviderError> {
        let primary = if project_images.is_empty() {
            public_images
        } else {
            project_images
        };

        Self::select_image_id(Self::filter_images(primary, query), query)
    }

    pub(in crate::scaleway) fn filter_images(
        images: Vec<ScalewayImage>,
        query: &ImageQuery,
    ) -> Vec<ScalewayImage> {
        images
            .into_iter()
            .filter(|image| image.arch == query.arch)
            .filter(|image| image.state == "available")
            .collect()
    }
}
