//! Image index behavior: normalization on the way in, lookup precedence,
//! size reporting, tagging.

mod support;

use arca_bridge::images::normalize_reference;
use support::Harness;

#[tokio::test]
async fn imported_reference_is_normalized() {
    let harness = Harness::new();
    let record = harness.seed_image("alpine");

    assert_eq!(
        record.references,
        vec!["docker.io/library/alpine:latest".to_string()]
    );
    assert_eq!(
        normalize_reference("alpine"),
        "docker.io/library/alpine:latest"
    );

    // Every lookup spelling resolves to the same image.
    let images = harness.manager.images();
    for query in [
        "alpine",
        "alpine:latest",
        "docker.io/library/alpine:latest",
    ] {
        assert_eq!(images.inspect(query).unwrap().digest, record.digest);
    }
}

#[tokio::test]
async fn short_id_lookup_matches_docker_semantics() {
    let harness = Harness::new();
    let record = harness.seed_image("alpine");

    let images = harness.manager.images();
    let hex = record.id_hex().to_string();

    // 12-char prefix and the full long ID both work.
    assert_eq!(images.inspect(&hex[..12]).unwrap().digest, record.digest);
    assert_eq!(images.inspect(&record.digest).unwrap().digest, record.digest);

    // Shorter prefixes do not.
    assert!(images.inspect(&hex[..8]).unwrap_err().is_not_found());
}

#[tokio::test]
async fn image_shape_is_docker_compatible() {
    let harness = Harness::new();
    let record = harness.seed_image("alpine");

    assert!(record.digest.starts_with("sha256:"));
    assert_eq!(record.id_hex().len(), 64);
    assert_eq!(record.os, "linux");
    assert!(!record.architecture.is_empty());

    // Size is the compressed layer sum.
    let expected: i64 = record.layers.iter().map(|l| l.size).sum();
    assert_eq!(record.size(), expected);
    assert!(expected > 0);
}

#[tokio::test]
async fn tag_and_list() {
    let harness = Harness::new();
    harness.seed_image("alpine");
    harness.seed_image("debian");
    let images = harness.manager.images();

    images.tag("alpine", "mirror.internal/base/alpine:prod").unwrap();
    let by_new_tag = images.inspect("mirror.internal/base/alpine:prod").unwrap();
    assert_eq!(by_new_tag.digest, images.inspect("alpine").unwrap().digest);

    let listed = images.list();
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn delete_respects_container_references() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let id = harness
        .create_container("pinner", "alpine", &["/bin/true"])
        .await;

    let err = harness.manager.images().delete("alpine", false).unwrap_err();
    assert!(matches!(err, arca_bridge::ArcaError::StateConflict(_)));

    harness.manager.remove(&id, false, false).await.unwrap();
    harness.manager.images().delete("alpine", false).unwrap();
    assert!(
        harness
            .manager
            .images()
            .inspect("alpine")
            .unwrap_err()
            .is_not_found()
    );
}
