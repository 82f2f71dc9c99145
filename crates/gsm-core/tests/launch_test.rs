mod common;

use common::TestFleet;
use gsm_cloud::{Operation, PortRule, Protocol};
use gsm_core::{
    ConflictError, GsmError, LaunchRequest, ProvisionError, ProvisionStep, ServerStatus,
    ValidationError,
};
use std::collections::BTreeMap;

#[tokio::test]
async fn test_config_precedence() {
    let t = TestFleet::new();
    let config_file = t.dir.path().join("factorio.cfg");
    std::fs::write(&config_file, "# saved settings\nA=2\nB=3\n").unwrap();

    let mut request = LaunchRequest::new("factorio");
    request.config_file = Some(config_file);
    request.overrides.insert("B".to_string(), "4".to_string());

    let launched = t.fleet.launch(&request).await.unwrap().value;
    assert_eq!(
        launched.config,
        BTreeMap::from([
            ("A".to_string(), "2".to_string()),
            ("B".to_string(), "4".to_string()),
        ])
    );
}

#[tokio::test]
async fn test_launch_persists_running_record() {
    let t = TestFleet::new();
    let mut request = LaunchRequest::new("factorio");
    request.name = Some("alpha".to_string());

    let record = t.fleet.launch(&request).await.unwrap().value;
    assert_eq!(record.status, ServerStatus::Running);
    assert_eq!(record.name, "alpha");
    let instance_id = record.instance_id.clone().unwrap();
    assert_eq!(t.provider.attached_volume(&instance_id), record.volume_id);
    assert!(record.public_ip.is_some());
    assert!(!record.is_pinned());

    let calls = t.remote.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("deploy "));
    assert!(calls[0].ends_with(&record.container_name));

    let listed = t.fleet.list().await.unwrap();
    assert!(listed.drift.is_empty());
    assert_eq!(listed.value.len(), 1);
    assert_eq!(listed.value[0].id, record.id);
}

#[tokio::test]
async fn test_missing_required_config_touches_nothing() {
    let t = TestFleet::new();

    let err = t
        .fleet
        .launch(&LaunchRequest::new("valheim"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GsmError::Validation(ValidationError::MissingRequiredConfig { ref key, .. }) if key == "serverpassword"
    ));
    assert_eq!(t.provider.mutating_calls(), 0);
    assert_eq!(t.provider.calls(Operation::ListInstances), 0);
}

#[tokio::test]
async fn test_empty_required_value_is_missing() {
    let t = TestFleet::new();
    let mut request = LaunchRequest::new("valheim");
    request
        .overrides
        .insert("serverpassword".to_string(), String::new());

    assert!(matches!(
        t.fleet.launch(&request).await,
        Err(GsmError::Validation(ValidationError::MissingRequiredConfig { .. }))
    ));
    assert_eq!(t.provider.mutating_calls(), 0);
}

#[tokio::test]
async fn test_unknown_workload() {
    let t = TestFleet::new();
    assert!(matches!(
        t.fleet.launch(&LaunchRequest::new("terraria")).await,
        Err(GsmError::Validation(ValidationError::UnknownWorkload(_)))
    ));
}

#[tokio::test]
async fn test_duplicate_name_rejected_before_provisioning() {
    let t = TestFleet::new();
    let mut request = LaunchRequest::new("factorio");
    request.name = Some("alpha".to_string());

    t.fleet.launch(&request).await.unwrap();
    let launches = t.provider.calls(Operation::LaunchInstance);

    assert!(matches!(
        t.fleet.launch(&request).await,
        Err(GsmError::Conflict(ConflictError::DuplicateName(name))) if name == "alpha"
    ));
    assert_eq!(t.provider.calls(Operation::LaunchInstance), launches);
    assert_eq!(t.provider.counts().instances, 1);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let t = TestFleet::new();
    t.provider.fail_transiently(Operation::EnsureSecurityGroup, 2);
    t.provider.fail_transiently(Operation::AttachVolume, 1);

    let record = t
        .fleet
        .launch(&LaunchRequest::new("factorio"))
        .await
        .unwrap()
        .value;
    assert_eq!(record.status, ServerStatus::Running);
    assert_eq!(t.provider.calls(Operation::EnsureSecurityGroup), 3);
}

#[tokio::test]
async fn test_transient_creation_errors_are_retried() {
    let t = TestFleet::new();
    t.provider.fail_transiently(Operation::CreateVolume, 1);
    t.provider.fail_transiently(Operation::LaunchInstance, 1);
    t.provider.fail_transiently(Operation::AllocateAddress, 1);

    let mut request = LaunchRequest::new("factorio");
    request.pin = true;
    let record = t.fleet.launch(&request).await.unwrap().value;
    assert_eq!(record.status, ServerStatus::Running);
    assert!(record.is_pinned());
    assert_eq!(t.provider.calls(Operation::LaunchInstance), 2);
    assert_eq!(t.provider.calls(Operation::AllocateAddress), 2);
}

#[tokio::test]
async fn test_lost_creation_responses_do_not_duplicate() {
    let t = TestFleet::new();
    t.provider.lose_responses(Operation::CreateVolume, 1);
    t.provider.lose_responses(Operation::LaunchInstance, 1);
    t.provider.lose_responses(Operation::AllocateAddress, 1);

    let mut request = LaunchRequest::new("factorio");
    request.pin = true;
    let record = t.fleet.launch(&request).await.unwrap().value;

    let counts = t.provider.counts();
    assert_eq!(counts.volumes, 1);
    assert_eq!(counts.instances, 1);
    assert_eq!(counts.addresses, 1);
    let instance_id = record.instance_id.clone().unwrap();
    assert_eq!(t.provider.attached_volume(&instance_id), record.volume_id);
}

#[tokio::test]
async fn test_instance_gets_the_workload_ports() {
    let t = TestFleet::new();
    let record = t
        .fleet
        .launch(&LaunchRequest::new("factorio"))
        .await
        .unwrap()
        .value;

    let group_id = record.security_group_id.clone().unwrap();
    let instance_id = record.instance_id.clone().unwrap();
    assert_eq!(t.provider.instance_group(&instance_id), Some(group_id.clone()));
    assert_eq!(
        t.provider.group_ports(&group_id),
        Some(vec![
            PortRule::new(34197, Protocol::Udp),
            PortRule::new(27015, Protocol::Tcp),
        ])
    );
}

#[tokio::test]
async fn test_rollback_at_every_step_leaves_nothing() {
    let cases = [
        (Operation::EnsureKeyPair, ProvisionStep::KeyPair),
        (Operation::EnsureSecurityGroup, ProvisionStep::SecurityGroup),
        (Operation::CreateVolume, ProvisionStep::Volume),
        (Operation::DescribeVolume, ProvisionStep::Volume),
        (Operation::LaunchInstance, ProvisionStep::Instance),
        (Operation::DescribeInstance, ProvisionStep::WaitReady),
        (Operation::AttachVolume, ProvisionStep::AttachVolume),
        (Operation::AllocateAddress, ProvisionStep::Address),
        (Operation::AssociateAddress, ProvisionStep::Address),
        (Operation::SetTag, ProvisionStep::Address),
    ];

    for (operation, expected_step) in cases {
        let t = TestFleet::new();
        t.provider.fail(operation);

        let mut request = LaunchRequest::new("factorio");
        request.pin = true;
        let err = t.fleet.launch(&request).await.unwrap_err();

        let GsmError::Provision(ProvisionError {
            step,
            rollback_failures,
            ..
        }) = err
        else {
            panic!("{}: expected a provisioning error, got {}", operation, err);
        };
        assert_eq!(step, expected_step, "{}", operation);
        assert!(rollback_failures.is_empty(), "{}: {:?}", operation, rollback_failures);
        assert!(
            t.provider.counts().is_empty(),
            "{} left {:?}",
            operation,
            t.provider.counts()
        );

        t.provider.clear_faults();
        assert!(t.fleet.list().await.unwrap().value.is_empty());
    }
}

#[tokio::test]
async fn test_failed_deploy_rolls_back() {
    let t = TestFleet::new();
    t.remote.fail_deploy(true);

    let mut request = LaunchRequest::new("factorio");
    request.pin = true;
    let err = t.fleet.launch(&request).await.unwrap_err();

    assert!(matches!(
        err,
        GsmError::Provision(ProvisionError {
            step: ProvisionStep::Workload,
            ..
        })
    ));
    assert!(t.provider.counts().is_empty(), "{:?}", t.provider.counts());
    assert!(t.fleet.list().await.unwrap().value.is_empty());
}

#[tokio::test]
async fn test_existing_key_pair_and_group_survive_rollback() {
    let t = TestFleet::new();
    t.fleet.launch(&LaunchRequest::new("factorio")).await.unwrap();
    let before = t.provider.counts();

    t.provider.fail(Operation::AttachVolume);
    assert!(t.fleet.launch(&LaunchRequest::new("factorio")).await.is_err());

    assert_eq!(t.provider.counts(), before);
}
