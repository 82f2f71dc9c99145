//! Reconciliation of local records against live provider inventory
//!
//! Both passes are pure: they take the local documents and a listing, and
//! return the corrected documents plus the drift they found. The caller
//! fetches the listing (read-only provider calls) and persists the result in
//! one write.

use crate::catalog::Catalog;
use crate::lifecycle::ServerStatus;
use crate::model::{
    RecordOrigin, ServerInventory, ServerRecord, SnapshotInventory, SnapshotRecord, UNKNOWN_KIND,
    container_name, default_name, is_valid_name,
};
use chrono::{DateTime, Utc};
use gsm_cloud::{Address, LiveInstance, PortRule, PowerState, Snapshot, SnapshotState, tags};
use std::collections::{BTreeMap, BTreeSet};

/// Provider-side truth for one region
#[derive(Debug, Clone, Default)]
pub struct LiveInventory {
    /// System-tagged instances that are not terminated
    pub instances: Vec<LiveInstance>,

    /// System-tagged addresses, when the listing was available
    pub addresses: Option<Vec<Address>>,
}

/// A correction applied by reconciliation
#[derive(Debug, Clone, PartialEq)]
pub enum DriftAction {
    /// Instance is gone; the record was removed
    Dropped {
        server_id: String,
        name: String,
        instance_id: Option<String>,
    },
    /// Untracked tagged instance; a record was synthesized
    Adopted {
        server_id: String,
        name: String,
        instance_id: String,
        game: String,
    },
    StatusCorrected {
        server_id: String,
        name: String,
        from: ServerStatus,
        to: ServerStatus,
    },
    /// Pinned allocation no longer exists
    AddressCleared {
        server_id: String,
        name: String,
        allocation_id: String,
    },
    SnapshotDropped {
        id: String,
        snapshot_id: String,
    },
    SnapshotAdopted {
        id: String,
        snapshot_id: String,
    },
}

impl std::fmt::Display for DriftAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriftAction::Dropped {
                name, instance_id, ..
            } => match instance_id {
                Some(instance) => write!(f, "dropped '{}': instance {} no longer exists", name, instance),
                None => write!(f, "dropped '{}': no instance recorded", name),
            },
            DriftAction::Adopted {
                name,
                instance_id,
                game,
                ..
            } => write!(f, "adopted untracked {} instance {} as '{}'", game, instance_id, name),
            DriftAction::StatusCorrected { name, from, to, .. } => {
                write!(f, "'{}' is {}, was recorded as {}", name, to, from)
            }
            DriftAction::AddressCleared {
                name, allocation_id, ..
            } => write!(f, "'{}' lost pinned address {}", name, allocation_id),
            DriftAction::SnapshotDropped { id, snapshot_id } => {
                write!(f, "dropped snapshot {} ({} no longer exists)", id, snapshot_id)
            }
            DriftAction::SnapshotAdopted { id, snapshot_id } => {
                write!(f, "adopted untracked snapshot {} as {}", snapshot_id, id)
            }
        }
    }
}

/// Status implied by the observed power state
fn observed_status(live: &LiveInstance, recorded: Option<ServerStatus>) -> ServerStatus {
    match live.state {
        PowerState::Stopping | PowerState::Stopped => ServerStatus::Paused,
        _ => {
            let container_stopped = recorded == Some(ServerStatus::ContainerStopped)
                || live.tag(tags::CONTAINER_STOPPED) == Some("true");
            if container_stopped {
                ServerStatus::ContainerStopped
            } else {
                ServerStatus::Running
            }
        }
    }
}

/// Correct the server inventory of `region` against the live listing
///
/// Records are matched to instances by instance identifier. Records in other
/// regions are left untouched.
pub fn reconcile(
    local: &ServerInventory,
    live: &LiveInventory,
    catalog: &Catalog,
    region: &str,
    now: DateTime<Utc>,
) -> (ServerInventory, Vec<DriftAction>) {
    let mut actions = Vec::new();
    let mut corrected = ServerInventory::default();

    let by_instance: BTreeMap<&str, &LiveInstance> = live
        .instances
        .iter()
        .filter(|i| !i.state.is_gone())
        .map(|i| (i.instance_id.as_str(), i))
        .collect();
    let known_addresses: Option<BTreeSet<&str>> = live
        .addresses
        .as_ref()
        .map(|list| list.iter().map(|a| a.allocation_id.as_str()).collect());

    for record in local.servers.values() {
        if record.region != region {
            corrected.insert(record.clone());
            continue;
        }

        let Some(instance) = record
            .instance_id
            .as_deref()
            .and_then(|id| by_instance.get(id))
        else {
            actions.push(DriftAction::Dropped {
                server_id: record.id.clone(),
                name: record.name.clone(),
                instance_id: record.instance_id.clone(),
            });
            continue;
        };

        let mut updated = record.clone();
        let status = observed_status(instance, Some(record.status));
        if status != record.status {
            actions.push(DriftAction::StatusCorrected {
                server_id: record.id.clone(),
                name: record.name.clone(),
                from: record.status,
                to: status,
            });
            updated.status = status;
        }
        updated.public_ip = instance.public_ip.clone();

        if let (Some(allocation), Some(known)) = (record.allocation_id.as_deref(), &known_addresses) {
            if !known.contains(allocation) {
                actions.push(DriftAction::AddressCleared {
                    server_id: record.id.clone(),
                    name: record.name.clone(),
                    allocation_id: allocation.to_string(),
                });
                updated.allocation_id = None;
            }
        }

        updated.last_reconciled_at = Some(now);
        corrected.insert(updated);
    }

    let tracked: BTreeSet<String> = corrected
        .servers
        .values()
        .filter_map(|r| r.instance_id.clone())
        .collect();
    for instance in by_instance.values() {
        if tracked.contains(&instance.instance_id) {
            continue;
        }
        let record = adopt(instance, &corrected, known_addresses.as_ref(), catalog, region, now);
        actions.push(DriftAction::Adopted {
            server_id: record.id.clone(),
            name: record.name.clone(),
            instance_id: instance.instance_id.clone(),
            game: record.game.clone(),
        });
        corrected.insert(record);
    }

    for action in &actions {
        tracing::info!("Reconciled: {}", action);
    }
    (corrected, actions)
}

/// Rebuild a record from an instance's tags
fn adopt(
    instance: &LiveInstance,
    existing: &ServerInventory,
    known_addresses: Option<&BTreeSet<&str>>,
    catalog: &Catalog,
    region: &str,
    now: DateTime<Utc>,
) -> ServerRecord {
    let id = match instance.tag(tags::ID) {
        Some(id) if !existing.servers.contains_key(id) => id.to_string(),
        _ => instance.instance_id.clone(),
    };

    let definition = instance.tag(tags::GAME).and_then(|game| catalog.get(game));
    let game = definition
        .map(|d| d.name.clone())
        .unwrap_or_else(|| UNKNOWN_KIND.to_string());

    let name = match instance.tag(tags::NAME) {
        Some(name) if is_valid_name(name) && !existing.name_taken(name) => name.to_string(),
        _ => unique_name(existing, &default_name(&game, &id)),
    };

    let ports = match instance.tag(tags::PORTS) {
        Some(spec) => spec.split(',').filter_map(PortRule::parse).collect(),
        None => definition
            .map(|d| d.expected_ports().to_vec())
            .unwrap_or_default(),
    };

    let allocation_id = instance
        .tag(tags::ADDRESS_ALLOCATION)
        .filter(|a| known_addresses.is_none_or(|known| known.contains(a)))
        .filter(|a| existing.pin_holder(a).is_none())
        .map(str::to_string);

    let created_at = instance
        .tag(tags::LAUNCH_TIME)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(now);

    ServerRecord {
        name,
        status: observed_status(instance, None),
        instance_id: Some(instance.instance_id.clone()),
        security_group_id: instance.tag(tags::SECURITY_GROUP).map(str::to_string),
        volume_id: instance.tag(tags::VOLUME).map(str::to_string),
        allocation_id,
        public_ip: instance.public_ip.clone(),
        region: region.to_string(),
        ports,
        container_name: instance
            .tag(tags::CONTAINER_NAME)
            .map(str::to_string)
            .unwrap_or_else(|| container_name(&game, &id)),
        config: BTreeMap::new(),
        origin: RecordOrigin::Adopted,
        created_at,
        last_reconciled_at: Some(now),
        id,
        game,
    }
}

fn unique_name(existing: &ServerInventory, base: &str) -> String {
    if !existing.name_taken(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !existing.name_taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Correct the snapshot inventory of `region` against the live listing
///
/// Records whose provider snapshot vanished are dropped; tagged snapshots
/// with no record are adopted. Failed snapshots are never adopted.
pub fn reconcile_snapshots(
    local: &SnapshotInventory,
    live: &[Snapshot],
    region: &str,
    now: DateTime<Utc>,
) -> (SnapshotInventory, Vec<DriftAction>) {
    let mut actions = Vec::new();
    let mut corrected = SnapshotInventory::default();
    let live_ids: BTreeSet<&str> = live.iter().map(|s| s.snapshot_id.as_str()).collect();

    for record in local.snapshots.values() {
        if record.region != region || live_ids.contains(record.snapshot_id.as_str()) {
            corrected.insert(record.clone());
        } else {
            actions.push(DriftAction::SnapshotDropped {
                id: record.id.clone(),
                snapshot_id: record.snapshot_id.clone(),
            });
        }
    }

    let tracked: BTreeSet<String> = corrected
        .snapshots
        .values()
        .map(|s| s.snapshot_id.clone())
        .collect();
    for snapshot in live {
        if tracked.contains(&snapshot.snapshot_id) || snapshot.state == SnapshotState::Error {
            continue;
        }
        let tag = |key: &str| {
            snapshot
                .tags
                .get(key)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
        };

        let id = match tag(tags::SNAPSHOT_ID) {
            Some(id) if !corrected.snapshots.contains_key(id) => id.to_string(),
            _ => snapshot.snapshot_id.clone(),
        };
        actions.push(DriftAction::SnapshotAdopted {
            id: id.clone(),
            snapshot_id: snapshot.snapshot_id.clone(),
        });
        corrected.insert(SnapshotRecord {
            id,
            snapshot_id: snapshot.snapshot_id.clone(),
            source_server_id: tag(tags::ID).map(str::to_string),
            source_server_name: tag(tags::NAME).unwrap_or_default().to_string(),
            game: tag(tags::GAME).unwrap_or(UNKNOWN_KIND).to_string(),
            region: region.to_string(),
            size_gb: snapshot.size_gb,
            created_at: snapshot.started_at.unwrap_or(now),
            config: BTreeMap::new(),
        });
    }

    for action in &actions {
        tracing::info!("Reconciled: {}", action);
    }
    (corrected, actions)
}
