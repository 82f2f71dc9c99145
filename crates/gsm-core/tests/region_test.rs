mod common;

use common::TestFleet;
use gsm_cloud::{InMemoryProvider, Operation, PowerState};
use gsm_core::{DriftAction, GsmError, LaunchRequest, ServerRecord, ValidationError};
use std::sync::Arc;

/// A factorio server launched from a second region sharing `t`'s store
async fn launch_in_west(t: &TestFleet) -> (Arc<InMemoryProvider>, ServerRecord) {
    let west = Arc::new(InMemoryProvider::new("memory-2"));
    let west_fleet = t.fleet_in(west.clone(), vec![t.provider.clone()]);
    let mut request = LaunchRequest::new("factorio");
    request.name = Some("westy".to_string());
    let record = west_fleet.launch(&request).await.unwrap().value;
    assert_eq!(record.region, "memory-2");
    (west, record)
}

#[tokio::test]
async fn test_terminated_server_in_other_region_is_dropped() {
    let t = TestFleet::new();
    let (west, record) = launch_in_west(&t).await;
    west.terminate_out_of_band(record.instance_id.as_deref().unwrap());

    let home = t.fleet_in(t.provider.clone(), vec![west.clone()]);
    let listed = home.list().await.unwrap();
    assert!(listed.value.is_empty());
    assert_eq!(
        listed.drift,
        vec![DriftAction::Dropped {
            server_id: record.id.clone(),
            name: record.name.clone(),
            instance_id: record.instance_id.clone(),
        }]
    );
    assert!(home.list().await.unwrap().drift.is_empty());
}

#[tokio::test]
async fn test_other_region_untouched_without_factory() {
    let t = TestFleet::new();
    let (west, record) = launch_in_west(&t).await;
    west.terminate_out_of_band(record.instance_id.as_deref().unwrap());
    let west_listings = west.calls(Operation::ListInstances);

    let listed = t.fleet.list().await.unwrap();
    assert_eq!(listed.value.len(), 1);
    assert!(listed.drift.is_empty());
    assert_eq!(west.calls(Operation::ListInstances), west_listings);

    assert!(matches!(
        t.fleet.pause("westy").await,
        Err(GsmError::Provider { .. })
    ));
    assert_eq!(t.provider.mutating_calls(), 0);
}

#[tokio::test]
async fn test_verbs_act_in_the_record_region() {
    let t = TestFleet::new();
    let (west, record) = launch_in_west(&t).await;
    let instance_id = record.instance_id.clone().unwrap();
    let home = t.fleet_in(t.provider.clone(), vec![west.clone()]);

    home.pause("westy").await.unwrap();
    assert_eq!(west.instance(&instance_id).map(|i| i.state), Some(PowerState::Stopped));
    assert_eq!(t.provider.calls(Operation::StopInstance), 0);

    home.resume("westy").await.unwrap();
    assert_eq!(west.instance(&instance_id).map(|i| i.state), Some(PowerState::Running));

    home.destroy("westy").await.unwrap();
    let counts = west.counts();
    assert_eq!(counts.instances, 0);
    assert_eq!(counts.volumes, 0);
    assert_eq!(counts.security_groups, 0);
    assert!(home.list().await.unwrap().value.is_empty());
}

#[tokio::test]
async fn test_snapshots_reconcile_in_their_region() {
    let t = TestFleet::new();
    let (west, record) = launch_in_west(&t).await;
    let home = t.fleet_in(t.provider.clone(), vec![west.clone()]);

    let snapshot = home.snapshot(&record.name).await.unwrap();
    assert_eq!(snapshot.region, "memory-2");
    assert_eq!(west.counts().snapshots, 1);

    // EBS-style snapshots only restore in their own region
    assert!(matches!(
        home.restore_snapshot(&snapshot.id, &LaunchRequest::default()).await,
        Err(GsmError::Validation(ValidationError::SnapshotRegionMismatch { .. }))
    ));
    assert_eq!(t.provider.mutating_calls(), 0);

    west.delete_snapshot_out_of_band(&snapshot.snapshot_id);
    let listed = home.list_snapshots().await.unwrap();
    assert!(listed.value.is_empty());
    assert!(matches!(
        listed.drift.as_slice(),
        [DriftAction::SnapshotDropped { .. }]
    ));
}
