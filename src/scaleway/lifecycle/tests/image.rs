//! Tests for image resolution and selection logic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rstest::rstest;
use scaleway_rs::ScalewayImage;

use super::{ImageSpec, image, provider, query};
use crate::scaleway::types::Zone;
use crate::scaleway::{ScalewayProvider, ScalewayProviderError};

const fn available(id: &'static str, creation_date: &'static str) -> ImageSpec {
    ImageSpec {
        id,
        arch: "x86_64",
        state: "available",
        creation_date,
    }
}

#[rstest]
fn newest_available_image_wins() {
    let images = vec![
        image(available("older", "2025-01-01T00:00:00Z")),
        image(available("newest", "2025-02-01T00:00:00Z")),
        image(ImageSpec {
            state: "creating",
            ..available("unfinished", "2025-03-01T00:00:00Z")
        }),
        image(ImageSpec {
            arch: "arm64",
            ..available("wrong-arch", "2025-04-01T00:00:00Z")
        }),
    ];

    let id = ScalewayProvider::select_image_from_sources(images, Vec::new(), &query())
        .unwrap_or_else(|err| panic!("image should be selected: {err}"));
    assert_eq!(id, "newest");
}

#[rstest]
fn empty_candidates_name_the_lookup() {
    let images: Vec<ScalewayImage> = Vec::new();
    let err = ScalewayProvider::select_image_id(images, &query())
        .expect_err("empty candidates should fail");
    assert_eq!(
        err,
        ScalewayProviderError::ImageNotFound {
            label: String::from("label"),
            arch: String::from("x86_64"),
            zone: String::from("fr-par-1"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn project_images_take_precedence() {
    let public_called = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&public_called);

    let result = provider()
        .resolve_image_id_with(
            &query(),
            || async { Ok(vec![image(available("project-img", "2025-01-01T00:00:00Z"))]) },
            move || {
                flag.store(true, Ordering::SeqCst);
                async { Ok(vec![image(available("public-img", "2025-02-01T00:00:00Z"))]) }
            },
        )
        .await
        .unwrap_or_else(|err| panic!("project image should resolve: {err}"));

    assert_eq!(result, "project-img");
    assert!(
        !public_called.load(Ordering::SeqCst),
        "public lookup should not be needed"
    );
}

#[rstest]
#[tokio::test]
async fn public_images_are_the_fallback() {
    let result = provider()
        .resolve_image_id_with(
            &query(),
            || async { Ok(Vec::new()) },
            || async { Ok(vec![image(available("public-img", "2025-01-01T00:00:00Z"))]) },
        )
        .await
        .unwrap_or_else(|err| panic!("public fallback should resolve: {err}"));

    assert_eq!(result, "public-img");
}

#[rstest]
#[tokio::test]
async fn lookup_errors_surface() {
    let err = provider()
        .resolve_image_id_with(
            &query(),
            || async {
                Err(ScalewayProviderError::Provider {
                    message: String::from("boom"),
                })
            },
            || async { Ok(Vec::new()) },
        )
        .await
        .expect_err("error should surface");

    assert!(matches!(err, ScalewayProviderError::Provider { message } if message == "boom"));
}

#[rstest]
#[tokio::test]
async fn image_ids_skip_the_lookup() {
    let id = "9c2f4a5e-0b7d-4a4c-8d1e-2f3a4b5c6d7e";
    let resolved = provider()
        .resolve_image_id(&Zone::from("fr-par-1"), id)
        .await
        .unwrap_or_else(|err| panic!("image id should pass through: {err}"));
    assert_eq!(resolved, id);
}
