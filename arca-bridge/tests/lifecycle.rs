//! Container lifecycle end to end: create, start, exit, stop, rename,
//! remove, against the in-memory VM runtime.

mod support;

use arca_bridge::ArcaError;
use arca_bridge::container::ContainerStatus;
use arca_bridge::ids::ContainerId;
use std::time::Duration;
use support::{Harness, MainBehavior};

async fn wait_for_status(
    harness: &Harness,
    id: &ContainerId,
    status: ContainerStatus,
) -> arca_bridge::db::ContainerRecord {
    for _ in 0..200 {
        let record = harness.manager.store().get_container(id).unwrap().unwrap();
        if record.status == status {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("container {id} never reached {status}");
}

#[tokio::test]
async fn echo_container_runs_and_logs() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let id = harness
        .create_container("echo-test", "alpine", &["/bin/sh", "-c", "echo hi"])
        .await;

    let record = harness.manager.store().get_container(&id).unwrap().unwrap();
    assert_eq!(record.status, ContainerStatus::Created);
    assert_eq!(record.name, "echo-test");

    harness.manager.start(&id).await.unwrap();
    assert_eq!(harness.manager.wait(&id).await.unwrap(), 0);

    let record = wait_for_status(&harness, &id, ContainerStatus::Exited).await;
    assert_eq!(record.exit_code, Some(0));
    assert!(record.started_at.is_some());
    assert!(record.finished_at.is_some());

    // Exactly one JSON log record whose log ends with "hi\n".
    let paths = harness.manager.logs().log_paths(&id).unwrap();
    let mut lines = Vec::new();
    for _ in 0..200 {
        let content = std::fs::read_to_string(&paths.stdout).unwrap_or_default();
        lines = content.lines().map(String::from).collect();
        if !lines.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(lines.len(), 1, "expected one log record, got {lines:?}");
    let record_json: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(record_json["stream"], "stdout");
    assert!(record_json["log"].as_str().unwrap().ends_with("hi\n"));

    // The guest saw the overlay mount with one lower device.
    assert!(harness.events.contains("overlay.mount"));
    assert!(harness.events.contains("lowers=1"));
}

#[tokio::test]
async fn start_is_rejected_while_running() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let id = harness
        .create_container("svc", "alpine", &["/bin/server"])
        .await;
    harness.runtime.set_behavior(&id, MainBehavior::RunUntilSignal);

    harness.manager.start(&id).await.unwrap();
    let err = harness.manager.start(&id).await.unwrap_err();
    assert!(matches!(err, ArcaError::AlreadyRunning(_)));

    harness.manager.stop(&id, None).await.unwrap();
}

#[tokio::test]
async fn stop_terminates_and_marks_user_stopped() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let id = harness
        .create_container("stopper", "alpine", &["/bin/server"])
        .await;
    harness.runtime.set_behavior(&id, MainBehavior::RunUntilSignal);
    harness.manager.start(&id).await.unwrap();

    let record = harness.manager.store().get_container(&id).unwrap().unwrap();
    assert_eq!(record.status, ContainerStatus::Running);
    assert!(record.pid.is_some());

    harness.manager.stop(&id, None).await.unwrap();

    let record = wait_for_status(&harness, &id, ContainerStatus::Exited).await;
    assert!(record.stopped_by_user);
    assert_eq!(record.exit_code, Some(0), "SIGTERM exit is clean");
    assert!(harness.events.contains(&format!("vm.signal {id} 15")));
}

#[tokio::test]
async fn kill_passes_the_signal_through() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let id = harness
        .create_container("killer", "alpine", &["/bin/server"])
        .await;
    harness.runtime.set_behavior(&id, MainBehavior::RunUntilSignal);
    harness.manager.start(&id).await.unwrap();

    harness.manager.kill(&id, libc::SIGKILL).await.unwrap();

    let record = wait_for_status(&harness, &id, ContainerStatus::Exited).await;
    assert_eq!(record.exit_code, Some(128 + libc::SIGKILL as i64));
}

#[tokio::test]
async fn rename_is_atomic_against_duplicates() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let a = harness.create_container("first", "alpine", &["/bin/true"]).await;
    let _b = harness.create_container("second", "alpine", &["/bin/true"]).await;

    let err = harness.manager.rename(&a, "second").unwrap_err();
    assert!(matches!(err, ArcaError::NameInUse(_)));

    harness.manager.rename(&a, "renamed").unwrap();
    assert_eq!(harness.manager.resolve("renamed").unwrap().id, a);
    assert!(harness.manager.resolve("first").unwrap_err().is_not_found());
}

#[tokio::test]
async fn remove_requires_force_while_running() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let id = harness
        .create_container("doomed", "alpine", &["/bin/server"])
        .await;
    harness.runtime.set_behavior(&id, MainBehavior::RunUntilSignal);
    harness.manager.start(&id).await.unwrap();

    let err = harness.manager.remove(&id, false, false).await.unwrap_err();
    assert!(matches!(err, ArcaError::StateConflict(_)));

    harness.manager.remove(&id, true, false).await.unwrap();
    assert!(
        harness
            .manager
            .store()
            .get_container(&id)
            .unwrap()
            .is_none()
    );
    // Log directory went with it.
    assert!(harness.manager.logs().log_paths(&id).is_none());
}

#[tokio::test]
async fn duplicate_name_fails_create_and_rolls_back() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    harness.create_container("unique", "alpine", &["/bin/true"]).await;
    let err = harness
        .create_container_with(
            "unique",
            "alpine",
            &["/bin/true"],
            Default::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ArcaError::NameInUse(_)));

    // Only one row remains.
    assert_eq!(harness.manager.list().unwrap().len(), 1);
}

#[tokio::test]
async fn create_with_missing_image_is_not_found() {
    let harness = Harness::new();
    let err = harness
        .create_container_with("nope", "ghost:latest", &["/bin/true"], Default::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(harness.manager.list().unwrap().is_empty());
}

#[tokio::test]
async fn exec_in_running_container() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let id = harness
        .create_container("exec-host", "alpine", &["/bin/server"])
        .await;
    harness.runtime.set_behavior(&id, MainBehavior::RunUntilSignal);
    harness.manager.start(&id).await.unwrap();

    let exec_id = harness
        .manager
        .exec_create(
            &id,
            arca_bridge::exec::ExecConfig {
                cmd: vec!["/bin/ls".into()],
                attach_stdout: true,
                ..Default::default()
            },
        )
        .unwrap();

    harness
        .manager
        .exec_start(&exec_id, true, None, None, None)
        .await
        .unwrap();
    // Detached exec in the mock exits once signalled; deliver one.
    harness.manager.execs().kill(&exec_id, libc::SIGTERM).await.ok();

    harness.manager.stop(&id, None).await.unwrap();
}

#[tokio::test]
async fn exec_against_stopped_container_is_a_conflict() {
    let harness = Harness::new();
    harness.seed_image("alpine");

    let id = harness
        .create_container("stopped", "alpine", &["/bin/true"])
        .await;

    let err = harness
        .manager
        .exec_create(
            &id,
            arca_bridge::exec::ExecConfig {
                cmd: vec!["/bin/ls".into()],
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, ArcaError::StateConflict(_)));
}
