//! Volume lifecycle: creation, in-use protection, anonymous volumes,
//! filters, prune.

mod support;

use arca_bridge::ArcaError;
use arca_bridge::container::HostConfig;
use arca_bridge::volumes::{CreateVolumeOptions, VolumeFilters};
use std::collections::HashMap;
use support::Harness;

fn small_volume(name: &str) -> CreateVolumeOptions {
    CreateVolumeOptions {
        name: Some(name.to_string()),
        driver_opts: HashMap::from([("size".to_string(), "64M".to_string())]),
        ..Default::default()
    }
}

#[tokio::test]
async fn volume_in_use_blocks_deletion() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let volumes = harness.manager.volumes();
    let v = volumes.create_volume(small_volume("v")).unwrap();
    assert_eq!(v.driver, "local");
    assert_eq!(v.format, "ext4");
    assert!(v.mountpoint.ends_with("v/volume.img"));
    assert!(v.mountpoint.exists());

    let c = harness
        .create_container_with(
            "consumer",
            "alpine",
            &["/bin/true"],
            HostConfig {
                binds: vec!["v:/data".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    match volumes.delete_volume("v", false) {
        Err(ArcaError::VolumeInUse { name, users }) => {
            assert_eq!(name, "v");
            assert_eq!(users, vec![c.as_str().to_string()]);
        }
        other => panic!("expected VolumeInUse, got {other:?}"),
    }

    harness.manager.remove(&c, false, false).await.unwrap();
    let reclaimed = volumes.delete_volume("v", false).unwrap();
    assert!(reclaimed > 0, "a formatted image occupies blocks");
    assert!(volumes.get_volume("v").unwrap_err().is_not_found());
}

#[tokio::test]
async fn anonymous_volumes_follow_the_container() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let c = harness
        .create_container_with(
            "anon",
            "alpine",
            &["/bin/true"],
            HostConfig {
                binds: vec!["/scratch".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mounts = harness.manager.store().get_volume_mounts(&c).unwrap();
    assert_eq!(mounts.len(), 1);
    assert!(mounts[0].is_anonymous);
    assert_eq!(mounts[0].container_path, "/scratch");
    let volume_name = mounts[0].volume_name.clone();

    // remove with volumes=true deletes the anonymous volume too.
    harness.manager.remove(&c, false, true).await.unwrap();
    assert!(
        harness
            .manager
            .volumes()
            .get_volume(&volume_name)
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn named_volumes_outlive_their_containers() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let volumes = harness.manager.volumes();
    volumes.create_volume(small_volume("keep")).unwrap();

    let c = harness
        .create_container_with(
            "user1",
            "alpine",
            &["/bin/true"],
            HostConfig {
                binds: vec!["keep:/data".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    harness.manager.remove(&c, false, true).await.unwrap();
    // Named volumes survive remove -v.
    assert!(volumes.get_volume("keep").is_ok());
}

#[tokio::test]
async fn host_path_binds_are_rejected() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let err = harness
        .create_container_with(
            "hostbind",
            "alpine",
            &["/bin/true"],
            HostConfig {
                binds: vec!["/host/data:/data".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ArcaError::Unsupported(_)));
    // Create rolled everything back.
    assert!(harness.manager.list().unwrap().is_empty());
}

#[tokio::test]
async fn list_filters_and_prune() {
    let harness = Harness::new();
    harness.seed_image("alpine");
    let volumes = harness.manager.volumes();

    let mut labeled = small_volume("tagged");
    labeled.labels.insert("team".to_string(), "infra".to_string());
    volumes.create_volume(labeled).unwrap();
    volumes.create_volume(small_volume("plain")).unwrap();

    let c = harness
        .create_container_with(
            "holder",
            "alpine",
            &["/bin/true"],
            HostConfig {
                binds: vec!["tagged:/data".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Name substring filter.
    let hits = volumes
        .list_volumes(&VolumeFilters {
            name: Some("tag".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name, "tagged");

    // Label filters, with and without value.
    let by_key = volumes
        .list_volumes(&VolumeFilters {
            labels: vec!["team".to_string()],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(by_key.len(), 1);
    let by_kv = volumes
        .list_volumes(&VolumeFilters {
            labels: vec!["team=infra".to_string()],
            ..Default::default()
        })
        .unwrap();
    assert_eq!(by_kv.len(), 1);
    let miss = volumes
        .list_volumes(&VolumeFilters {
            labels: vec!["team=web".to_string()],
            ..Default::default()
        })
        .unwrap();
    assert!(miss.is_empty());

    // Dangling: only "plain" has no mounts.
    let dangling = volumes
        .list_volumes(&VolumeFilters {
            dangling: Some(true),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(dangling.len(), 1);
    assert_eq!(dangling[0].name, "plain");

    // Prune removes exactly the dangling set.
    let (deleted, reclaimed) = volumes.prune_volumes(&VolumeFilters::default()).unwrap();
    assert_eq!(deleted, vec!["plain".to_string()]);
    assert!(reclaimed > 0);
    assert!(volumes.get_volume("tagged").is_ok());

    harness.manager.remove(&c, false, false).await.unwrap();
}

#[tokio::test]
async fn duplicate_volume_name_is_rejected() {
    let harness = Harness::new();
    let volumes = harness.manager.volumes();

    volumes.create_volume(small_volume("dup")).unwrap();
    let err = volumes.create_volume(small_volume("dup")).unwrap_err();
    assert!(matches!(err, ArcaError::AlreadyExists { .. }));
}
