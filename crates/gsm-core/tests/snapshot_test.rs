mod common;

use common::TestFleet;
use gsm_cloud::Operation;
use gsm_core::{DriftAction, GsmError, LaunchRequest, ServerStatus, ValidationError};

#[tokio::test]
async fn test_clone_is_independent_of_source() {
    let t = TestFleet::new();
    let mut request = LaunchRequest::new("factorio");
    request.name = Some("alpha".to_string());
    request.overrides.insert("SAVE_NAME".to_string(), "world".to_string());
    let source = t.fleet.launch(&request).await.unwrap().value;
    let source_volume = source.volume_id.clone().unwrap();
    t.provider.write_volume(&source_volume, "autosave-1");

    let snapshot = t.fleet.snapshot("alpha").await.unwrap();
    assert_eq!(snapshot.source_server_id.as_deref(), Some(source.id.as_str()));
    assert_eq!(snapshot.game, "factorio");
    assert_eq!(snapshot.config, source.config);

    // the source keeps running untouched
    let info = t.fleet.info("alpha").await.unwrap().value;
    assert_eq!(info.status, ServerStatus::Running);
    assert_eq!(info.volume_id, source.volume_id);

    let clone_request = LaunchRequest {
        name: Some("beta".to_string()),
        ..Default::default()
    };
    let clone = t
        .fleet
        .restore_snapshot(&snapshot.id, &clone_request)
        .await
        .unwrap()
        .value;
    let clone_volume = clone.volume_id.clone().unwrap();

    assert_eq!(clone.game, "factorio");
    assert_ne!(clone_volume, source_volume);
    assert_eq!(clone.config, source.config);
    assert_eq!(t.provider.volume_contents(&clone_volume), ["autosave-1"]);

    t.provider.write_volume(&clone_volume, "autosave-2");
    assert_eq!(t.provider.volume_contents(&source_volume), ["autosave-1"]);

    // destroying the source leaves the clone and the snapshot alone
    t.fleet.destroy("alpha").await.unwrap();
    assert!(t.provider.volume(&clone_volume).is_some());
    let snapshots = t.fleet.list_snapshots().await.unwrap();
    assert_eq!(snapshots.value.len(), 1);
    assert!(snapshots.drift.is_empty());
}

#[tokio::test]
async fn test_restore_rejects_config_file_and_wrong_kind() {
    let t = TestFleet::new();
    t.fleet
        .launch(&LaunchRequest::new("factorio"))
        .await
        .unwrap();
    let source = t.fleet.list().await.unwrap().value.remove(0);
    let snapshot = t.fleet.snapshot(&source.name).await.unwrap();
    let mutations = t.provider.mutating_calls();

    let mut with_file = LaunchRequest::new("factorio");
    with_file.config_file = Some(t.dir.path().join("factorio.cfg"));
    assert!(matches!(
        t.fleet.restore_snapshot(&snapshot.id, &with_file).await,
        Err(GsmError::Validation(ValidationError::SnapshotWithConfigFile))
    ));

    let mut other_kind = LaunchRequest::new("valheim");
    other_kind
        .overrides
        .insert("serverpassword".to_string(), "hunter22".to_string());
    assert!(matches!(
        t.fleet.restore_snapshot(&snapshot.id, &other_kind).await,
        Err(GsmError::Validation(ValidationError::SnapshotWorkloadMismatch { .. }))
    ));

    assert!(matches!(
        t.fleet
            .restore_snapshot("nope", &LaunchRequest::default())
            .await,
        Err(GsmError::NotFound { .. })
    ));
    assert_eq!(t.provider.mutating_calls(), mutations);
}

#[tokio::test]
async fn test_failed_snapshot_is_not_recorded() {
    let t = TestFleet::new();
    let record = t
        .fleet
        .launch(&LaunchRequest::new("factorio"))
        .await
        .unwrap()
        .value;
    t.provider.fail(Operation::DescribeSnapshot);

    assert!(t.fleet.snapshot(&record.name).await.is_err());
    assert_eq!(t.provider.counts().snapshots, 0);

    t.provider.clear_faults();
    assert!(t.fleet.list_snapshots().await.unwrap().value.is_empty());
}

#[tokio::test]
async fn test_delete_snapshot() {
    let t = TestFleet::new();
    let record = t
        .fleet
        .launch(&LaunchRequest::new("factorio"))
        .await
        .unwrap()
        .value;
    let snapshot = t.fleet.snapshot(&record.name).await.unwrap();
    assert_eq!(t.provider.counts().snapshots, 1);

    let deleted = t.fleet.delete_snapshot(&snapshot.id).await.unwrap();
    assert_eq!(deleted.snapshot_id, snapshot.snapshot_id);
    assert_eq!(t.provider.counts().snapshots, 0);
    assert!(matches!(
        t.fleet.delete_snapshot(&snapshot.id).await,
        Err(GsmError::NotFound { .. })
    ));

    // the source server is untouched
    let info = t.fleet.info(&record.name).await.unwrap();
    assert_eq!(info.value.volume_id, record.volume_id);
}

#[tokio::test]
async fn test_delete_of_externally_removed_snapshot_succeeds() {
    let t = TestFleet::new();
    let record = t
        .fleet
        .launch(&LaunchRequest::new("factorio"))
        .await
        .unwrap()
        .value;
    let snapshot = t.fleet.snapshot(&record.name).await.unwrap();
    t.provider.delete_snapshot_out_of_band(&snapshot.snapshot_id);

    t.fleet.delete_snapshot(&snapshot.id).await.unwrap();
    assert!(t.fleet.list_snapshots().await.unwrap().value.is_empty());
}

#[tokio::test]
async fn test_snapshot_reconciliation() {
    let t = TestFleet::new();
    let record = t
        .fleet
        .launch(&LaunchRequest::new("factorio"))
        .await
        .unwrap()
        .value;
    let first = t.fleet.snapshot(&record.name).await.unwrap();
    let second = t.fleet.snapshot(&record.name).await.unwrap();

    // losing the local document re-adopts both from their tags
    std::fs::remove_file(t.dir.path().join("snapshots.json")).unwrap();
    let adopted = t.fleet.list_snapshots().await.unwrap();
    assert_eq!(adopted.value.len(), 2);
    assert!(adopted.value.iter().any(|s| s.id == first.id));
    assert!(adopted.value.iter().all(|s| s.source_server_name == record.name));

    t.provider.delete_snapshot_out_of_band(&second.snapshot_id);
    let listed = t.fleet.list_snapshots().await.unwrap();
    assert_eq!(listed.value.len(), 1);
    assert!(matches!(
        listed.drift.as_slice(),
        [DriftAction::SnapshotDropped { snapshot_id, .. }] if *snapshot_id == second.snapshot_id
    ));
}
