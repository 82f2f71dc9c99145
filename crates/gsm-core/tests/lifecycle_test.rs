mod common;

use common::TestFleet;
use gsm_cloud::{Operation, tags};
use gsm_core::{ConflictError, GsmError, LaunchRequest, ServerStatus, ValidationError, Verb};

async fn launch(t: &TestFleet, name: &str) -> gsm_core::ServerRecord {
    let mut request = LaunchRequest::new("factorio");
    request.name = Some(name.to_string());
    t.fleet.launch(&request).await.unwrap().value
}

#[tokio::test]
async fn test_pause_resume_cycle() {
    let t = TestFleet::new();
    let record = launch(&t, "alpha").await;
    let instance_id = record.instance_id.clone().unwrap();

    let paused = t.fleet.pause("alpha").await.unwrap();
    assert_eq!(paused.status, ServerStatus::Paused);
    assert_eq!(paused.instance_id, record.instance_id);
    assert_eq!(paused.volume_id, record.volume_id);
    assert_eq!(paused.public_ip, None);
    assert!(t
        .remote
        .calls()
        .contains(&format!("stop {} {}", record.public_ip.clone().unwrap(), record.container_name)));

    let resumed = t.fleet.resume("alpha").await.unwrap();
    assert_eq!(resumed.status, ServerStatus::Running);
    assert_eq!(resumed.instance_id, record.instance_id);
    assert!(resumed.public_ip.is_some());
    assert_eq!(t.provider.attached_volume(&instance_id), record.volume_id);

    let info = t.fleet.info("alpha").await.unwrap();
    assert!(info.drift.is_empty());
    assert_eq!(info.value.status, ServerStatus::Running);
}

#[tokio::test]
async fn test_illegal_transitions_are_rejected() {
    let t = TestFleet::new();
    launch(&t, "alpha").await;

    assert!(matches!(
        t.fleet.resume("alpha").await,
        Err(GsmError::Conflict(ConflictError::InvalidTransition {
            verb: Verb::Resume,
            from: ServerStatus::Running,
            ..
        }))
    ));

    t.fleet.pause("alpha").await.unwrap();
    let stops = t.provider.calls(Operation::StopInstance);
    assert!(matches!(
        t.fleet.pause("alpha").await,
        Err(GsmError::Conflict(ConflictError::InvalidTransition { .. }))
    ));
    assert!(matches!(
        t.fleet.stop("alpha").await,
        Err(GsmError::Conflict(ConflictError::InvalidTransition { .. }))
    ));
    assert_eq!(t.provider.calls(Operation::StopInstance), stops);
}

#[tokio::test]
async fn test_stop_and_restart_workload() {
    let t = TestFleet::new();
    let record = launch(&t, "alpha").await;
    let instance_id = record.instance_id.clone().unwrap();

    let stopped = t.fleet.stop("alpha").await.unwrap();
    assert_eq!(stopped.status, ServerStatus::ContainerStopped);
    let live = t.provider.instance(&instance_id).unwrap();
    assert_eq!(live.tag(tags::CONTAINER_STOPPED), Some("true"));
    assert_eq!(t.provider.calls(Operation::StopInstance), 0);

    // the reconciler keeps the side state while the instance runs
    let info = t.fleet.info("alpha").await.unwrap();
    assert_eq!(info.value.status, ServerStatus::ContainerStopped);

    let resumed = t.fleet.resume("alpha").await.unwrap();
    assert_eq!(resumed.status, ServerStatus::Running);
    let live = t.provider.instance(&instance_id).unwrap();
    assert_eq!(live.tag(tags::CONTAINER_STOPPED), None);
    assert_eq!(t.provider.calls(Operation::StartInstance), 0);
}

#[tokio::test]
async fn test_container_stopped_server_can_pause() {
    let t = TestFleet::new();
    launch(&t, "alpha").await;
    t.fleet.stop("alpha").await.unwrap();

    let paused = t.fleet.pause("alpha").await.unwrap();
    assert_eq!(paused.status, ServerStatus::Paused);
}

#[tokio::test]
async fn test_failed_workload_start_leaves_container_stopped() {
    let t = TestFleet::new();
    launch(&t, "alpha").await;
    t.fleet.pause("alpha").await.unwrap();

    t.remote.fail_start(true);
    assert!(matches!(
        t.fleet.resume("alpha").await,
        Err(GsmError::Remote { .. })
    ));
    let info = t.fleet.info("alpha").await.unwrap();
    assert_eq!(info.value.status, ServerStatus::ContainerStopped);

    t.remote.fail_start(false);
    let resumed = t.fleet.resume("alpha").await.unwrap();
    assert_eq!(resumed.status, ServerStatus::Running);
}

#[tokio::test]
async fn test_pin_survives_pause_and_resume() {
    let t = TestFleet::new();
    launch(&t, "alpha").await;

    let (pinned, address) = t.fleet.pin("alpha", None).await.unwrap();
    assert_eq!(pinned.allocation_id.as_deref(), Some(address.allocation_id.as_str()));
    assert_eq!(pinned.public_ip.as_deref(), Some(address.public_ip.as_str()));

    let paused = t.fleet.pause("alpha").await.unwrap();
    assert_eq!(paused.allocation_id, pinned.allocation_id);
    assert_eq!(paused.public_ip, pinned.public_ip);

    let resumed = t.fleet.resume("alpha").await.unwrap();
    assert_eq!(resumed.allocation_id, pinned.allocation_id);
    assert_eq!(resumed.public_ip.as_deref(), Some(address.public_ip.as_str()));
    assert_eq!(t.provider.calls(Operation::AllocateAddress), 1);
    assert_eq!(
        t.provider.address(&address.allocation_id).unwrap().instance_id,
        pinned.instance_id
    );

    // unpin needs confirmation
    assert!(matches!(
        t.fleet.unpin("alpha", false).await,
        Err(GsmError::Validation(ValidationError::ConfirmationRequired(_)))
    ));
    assert!(t.provider.address(&address.allocation_id).is_some());

    let unpinned = t.fleet.unpin("alpha", true).await.unwrap();
    assert!(!unpinned.is_pinned());
    assert!(t.provider.address(&address.allocation_id).is_none());
    assert!(matches!(
        t.fleet.unpin("alpha", true).await,
        Err(GsmError::Conflict(ConflictError::NotPinned { .. }))
    ));

    let (_, second) = t.fleet.pin("alpha", None).await.unwrap();
    assert_eq!(t.provider.calls(Operation::AllocateAddress), 2);
    assert_ne!(second.allocation_id, address.allocation_id);
}

#[tokio::test]
async fn test_pin_conflicts() {
    let t = TestFleet::new();
    launch(&t, "alpha").await;
    launch(&t, "beta").await;

    let (_, address) = t.fleet.pin("alpha", None).await.unwrap();
    assert!(matches!(
        t.fleet.pin("alpha", None).await,
        Err(GsmError::Conflict(ConflictError::AlreadyPinned { .. }))
    ));
    assert!(matches!(
        t.fleet.pin("beta", Some(&address.allocation_id)).await,
        Err(GsmError::Conflict(ConflictError::AlreadyPinnedElsewhere { ref holder, .. })) if holder == "alpha"
    ));
    assert_eq!(t.provider.calls(Operation::AllocateAddress), 1);
}

#[tokio::test]
async fn test_pinned_at_launch() {
    let t = TestFleet::new();
    let mut request = LaunchRequest::new("factorio");
    request.pin = true;
    let record = t.fleet.launch(&request).await.unwrap().value;

    let allocation = record.allocation_id.clone().unwrap();
    let address = t.provider.address(&allocation).unwrap();
    assert_eq!(record.public_ip.as_deref(), Some(address.public_ip.as_str()));

    let addresses = t.fleet.list_addresses().await.unwrap().value;
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0].holder.as_deref(), Some(record.name.as_str()));
    assert!(addresses[0].associated);
}

#[tokio::test]
async fn test_destroy_releases_everything() {
    let t = TestFleet::new();
    let mut request = LaunchRequest::new("factorio");
    request.name = Some("alpha".to_string());
    request.pin = true;
    t.fleet.launch(&request).await.unwrap();

    let destroyed = t.fleet.destroy("alpha").await.unwrap();
    assert_eq!(destroyed.name, "alpha");

    let counts = t.provider.counts();
    assert_eq!(counts.instances, 0);
    assert_eq!(counts.volumes, 0);
    assert_eq!(counts.addresses, 0);
    assert_eq!(counts.security_groups, 0);
    // the key pair is shared by every server
    assert_eq!(counts.key_pairs, 1);

    assert!(t.fleet.list().await.unwrap().value.is_empty());
    assert!(matches!(
        t.fleet.destroy("alpha").await,
        Err(GsmError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_destroy_after_external_termination() {
    let t = TestFleet::new();
    let record = launch(&t, "alpha").await;
    t.provider
        .terminate_out_of_band(record.instance_id.as_deref().unwrap());

    t.fleet.destroy("alpha").await.unwrap();
    assert!(t.fleet.list().await.unwrap().value.is_empty());
    assert_eq!(t.provider.counts().volumes, 0);
}

#[tokio::test]
async fn test_shared_security_group_kept_until_last_server() {
    let t = TestFleet::new();
    let alpha = launch(&t, "alpha").await;
    let beta = launch(&t, "beta").await;
    assert_eq!(alpha.security_group_id, beta.security_group_id);

    t.fleet.destroy("alpha").await.unwrap();
    assert_eq!(t.provider.counts().security_groups, 1);

    t.fleet.destroy("beta").await.unwrap();
    assert_eq!(t.provider.counts().security_groups, 0);
}

#[tokio::test]
async fn test_failed_teardown_keeps_record() {
    let t = TestFleet::new();
    launch(&t, "alpha").await;
    t.provider.fail(Operation::TerminateInstance);

    assert!(matches!(
        t.fleet.destroy("alpha").await,
        Err(GsmError::Teardown {
            resource: "instance",
            ..
        })
    ));

    t.provider.clear_faults();
    assert_eq!(t.fleet.list().await.unwrap().value.len(), 1);
}

#[tokio::test]
async fn test_pause_of_vanished_instance_surfaces_error() {
    let t = TestFleet::new();
    let record = launch(&t, "alpha").await;
    t.provider
        .terminate_out_of_band(record.instance_id.as_deref().unwrap());

    assert!(t.fleet.pause("alpha").await.is_err());

    // only reconciliation removes records
    let listed = t.fleet.list().await.unwrap();
    assert!(listed.value.is_empty());
    assert_eq!(listed.drift.len(), 1);
}
