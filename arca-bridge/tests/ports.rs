//! Port publishing through the container lifecycle: firewall rules on
//! start, conflicts across containers, cleanup on exit.

mod support;

use arca_bridge::container::{HostConfig, PortBindingHost};
use std::collections::HashMap;
use support::{Harness, MainBehavior};

fn published(host_port: &str) -> HostConfig {
    HostConfig {
        port_bindings: HashMap::from([(
            "80/tcp".to_string(),
            vec![PortBindingHost {
                host_ip: "0.0.0.0".to_string(),
                host_port: host_port.to_string(),
            }],
        )]),
        ..Default::default()
    }
}

#[tokio::test]
async fn publish_conflict_resolves_after_unpublish() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let a = harness
        .create_container_with("a", "alpine", &["/bin/server"], published("8080"))
        .await
        .unwrap();
    let b = harness
        .create_container_with("b", "alpine", &["/bin/server"], published("8080"))
        .await
        .unwrap();
    for id in [&a, &b] {
        harness.runtime.set_behavior(id, MainBehavior::RunUntilSignal);
    }

    harness.manager.start(&a).await.unwrap();
    assert!(harness.events.contains("firewall.publish tcp 8080"));
    assert_eq!(
        harness.manager.ports().bindings_of(&a).await,
        vec!["0.0.0.0:8080/tcp"]
    );

    // Second container with the same binding fails with the stable text,
    // and the failed start unwinds the VM.
    let err = harness.manager.start(&b).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Bind for 0.0.0.0:8080 failed: port is already allocated"
    );
    assert!(harness.manager.ports().bindings_of(&b).await.is_empty());

    // Stopping A releases the allocation; B can start now.
    harness.manager.stop(&a, None).await.unwrap();
    for _ in 0..200 {
        if harness.manager.ports().bindings_of(&a).await.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(harness.events.contains("firewall.unpublish tcp 8080"));

    harness.manager.start(&b).await.unwrap();
    assert_eq!(
        harness.manager.ports().bindings_of(&b).await,
        vec!["0.0.0.0:8080/tcp"]
    );
    harness.manager.stop(&b, None).await.unwrap();
}

#[tokio::test]
async fn invalid_bindings_fail_the_start() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let bad_proto = HostConfig {
        port_bindings: HashMap::from([(
            "80/sctp".to_string(),
            vec![PortBindingHost {
                host_ip: String::new(),
                host_port: "8080".to_string(),
            }],
        )]),
        ..Default::default()
    };
    let id = harness
        .create_container_with("badproto", "alpine", &["/bin/server"], bad_proto)
        .await
        .unwrap();
    harness.runtime.set_behavior(&id, MainBehavior::RunUntilSignal);

    let err = harness.manager.start(&id).await.unwrap_err();
    assert!(err.to_string().contains("sctp"));

    // The rollback leaves the container startable once fixed; the record
    // is still there and not running.
    let record = harness.manager.store().get_container(&id).unwrap().unwrap();
    assert!(!record.status.is_running());
}
