//! Bridge networking: subnet auto-allocation, attach/detach, address
//! invariants, default-network protection.

mod support;

use arca_bridge::ArcaError;
use arca_bridge::net::{AttachOptions, CreateNetworkOptions};
use std::net::Ipv4Addr;
use support::{Harness, MainBehavior};

fn assert_assignable(ip: &str, subnet_second_octet: u8) {
    let ip: Ipv4Addr = ip.parse().unwrap();
    let octets = ip.octets();
    assert_eq!(octets[0], 172);
    assert_eq!(octets[1], subnet_second_octet);
    assert_ne!(ip, Ipv4Addr::new(172, subnet_second_octet, 0, 1), "gateway");
    assert!(!matches!(octets[3], 0 | 1 | 255), "reserved last octet {ip}");
}

#[tokio::test]
async fn auto_subnets_come_from_the_172_band() {
    let harness = Harness::new();

    let net1 = harness
        .manager
        .networks()
        .create_network(CreateNetworkOptions::bridge("net1"))
        .await
        .unwrap();
    assert_eq!(net1.subnet, "172.18.0.0/16");
    assert_eq!(net1.gateway, "172.18.0.1");

    let net2 = harness
        .manager
        .networks()
        .create_network(CreateNetworkOptions::bridge("net2"))
        .await
        .unwrap();
    assert_eq!(net2.subnet, "172.19.0.0/16");
    assert_eq!(net2.gateway, "172.19.0.1");

    assert!(harness.events.contains("router.create_switch"));
}

#[tokio::test]
async fn attach_detach_cycle_hands_out_valid_addresses() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    harness
        .manager
        .networks()
        .create_network(CreateNetworkOptions::bridge("net1"))
        .await
        .unwrap();

    let a = harness.create_container("a", "alpine", &["/bin/server"]).await;
    let b = harness.create_container("b", "alpine", &["/bin/server"]).await;
    for id in [&a, &b] {
        harness.runtime.set_behavior(id, MainBehavior::RunUntilSignal);
        harness.manager.start(id).await.unwrap();
    }

    let outcome_a = harness
        .manager
        .connect_network(&a, "net1", AttachOptions::default())
        .await
        .unwrap();
    assert_assignable(&outcome_a.ip, 18);
    assert_eq!(outcome_a.gateway, "172.18.0.1");
    assert!(outcome_a.mac.starts_with("02:42:"));

    // Attachment row landed with the container's name as an alias.
    let rows = harness.manager.store().load_network_attachments(&a).unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].aliases.contains(&"a".to_string()));

    // Double attach is AlreadyConnected.
    let err = harness
        .manager
        .connect_network(&a, "net1", AttachOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ArcaError::AlreadyConnected { .. }));

    // The guest tap forwarder and the switch both saw the attach.
    assert!(harness.events.contains("tap.attach"));
    assert!(harness.events.contains("router.attach"));

    harness.manager.disconnect_network(&a, "net1").await.unwrap();
    assert!(
        harness
            .manager
            .store()
            .load_network_attachments(&a)
            .unwrap()
            .is_empty()
    );
    assert!(harness.events.contains("tap.detach"));

    // B can attach after A released; the address is valid either way.
    let outcome_b = harness
        .manager
        .connect_network(&b, "net1", AttachOptions::default())
        .await
        .unwrap();
    assert_assignable(&outcome_b.ip, 18);

    for id in [&a, &b] {
        harness.manager.stop(id, None).await.unwrap();
    }
}

#[tokio::test]
async fn requested_static_ip_is_honored() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    harness
        .manager
        .networks()
        .create_network(CreateNetworkOptions::bridge("static"))
        .await
        .unwrap();

    let id = harness.create_container("pinned", "alpine", &["/bin/server"]).await;
    harness.runtime.set_behavior(&id, MainBehavior::RunUntilSignal);
    harness.manager.start(&id).await.unwrap();

    let outcome = harness
        .manager
        .connect_network(
            &id,
            "static",
            AttachOptions {
                ip: Some(Ipv4Addr::new(172, 18, 0, 42)),
                aliases: vec!["db".to_string()],
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.ip, "172.18.0.42");

    let rows = harness.manager.store().load_network_attachments(&id).unwrap();
    assert!(rows[0].aliases.contains(&"db".to_string()));

    harness.manager.stop(&id, None).await.unwrap();
}

#[tokio::test]
async fn default_network_is_undeletable() {
    let harness = Harness::new();
    harness.manager.ensure_default_network("arca0").await.unwrap();

    let err = harness.manager.networks().delete_network("arca0").await.unwrap_err();
    assert!(matches!(err, ArcaError::StateConflict(_)));

    // A second default is also rejected.
    let mut another = CreateNetworkOptions::bridge("arca1");
    another.is_default = true;
    let err = harness
        .manager
        .networks()
        .create_network(another)
        .await
        .unwrap_err();
    assert!(matches!(err, ArcaError::StateConflict(_)));
}

#[tokio::test]
async fn network_with_endpoints_cannot_be_deleted() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    harness
        .manager
        .networks()
        .create_network(CreateNetworkOptions::bridge("busy"))
        .await
        .unwrap();

    let id = harness.create_container("member", "alpine", &["/bin/server"]).await;
    harness.runtime.set_behavior(&id, MainBehavior::RunUntilSignal);
    harness.manager.start(&id).await.unwrap();
    harness
        .manager
        .connect_network(&id, "busy", AttachOptions::default())
        .await
        .unwrap();

    let err = harness.manager.networks().delete_network("busy").await.unwrap_err();
    assert!(matches!(err, ArcaError::StateConflict(_)));

    harness.manager.disconnect_network(&id, "busy").await.unwrap();
    harness.manager.networks().delete_network("busy").await.unwrap();
    assert!(harness.events.contains("router.delete_switch"));

    harness.manager.stop(&id, None).await.unwrap();
}

#[tokio::test]
async fn overlapping_subnets_are_rejected() {
    let harness = Harness::new();

    let mut explicit = CreateNetworkOptions::bridge("explicit");
    explicit.subnet = Some("10.10.0.0/16".to_string());
    explicit.gateway = Some("10.10.0.1".to_string());
    harness.manager.networks().create_network(explicit).await.unwrap();

    let mut overlapping = CreateNetworkOptions::bridge("overlapping");
    overlapping.subnet = Some("10.10.5.0/24".to_string());
    let err = harness
        .manager
        .networks()
        .create_network(overlapping)
        .await
        .unwrap_err();
    assert!(matches!(err, ArcaError::InvalidArgument(_)));
}

#[tokio::test]
async fn subnet_cursor_survives_restart() {
    let mut harness = Harness::new();

    harness
        .manager
        .networks()
        .create_network(CreateNetworkOptions::bridge("net1"))
        .await
        .unwrap();
    harness
        .manager
        .networks()
        .create_network(CreateNetworkOptions::bridge("net2"))
        .await
        .unwrap();

    harness = harness.reopen();
    harness.manager.initialize().await.unwrap();

    // Existing switches were re-created and the cursor kept moving.
    let net3 = harness
        .manager
        .networks()
        .create_network(CreateNetworkOptions::bridge("net3"))
        .await
        .unwrap();
    assert_eq!(net3.subnet, "172.20.0.0/16");

    let names: Vec<String> = harness
        .manager
        .networks()
        .list()
        .unwrap()
        .into_iter()
        .map(|n| n.name)
        .collect();
    assert!(names.contains(&"net1".to_string()));
    assert!(names.contains(&"net2".to_string()));
}

#[tokio::test]
async fn vmnet_rejects_dynamic_attach() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let mut options = CreateNetworkOptions::bridge("shared");
    options.driver = arca_bridge::db::NetworkDriverKind::Vmnet;
    harness.manager.networks().create_network(options).await.unwrap();

    let id = harness.create_container("guest", "alpine", &["/bin/server"]).await;
    harness.runtime.set_behavior(&id, MainBehavior::RunUntilSignal);
    harness.manager.start(&id).await.unwrap();

    let err = harness
        .manager
        .connect_network(&id, "shared", AttachOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ArcaError::DynamicAttachUnsupported { .. }));

    harness.manager.stop(&id, None).await.unwrap();
}
