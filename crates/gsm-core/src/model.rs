//! Persisted records

use crate::error::{ConflictError, GsmError, Result};
use crate::lifecycle::ServerStatus;
use chrono::{DateTime, Utc};
use gsm_cloud::PortRule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Workload kind of an adopted instance whose tags name no known workload
pub const UNKNOWN_KIND: &str = "unknown";

const ID_LEN: usize = 12;
const NAME_ID_LEN: usize = 6;
const CONTAINER_ID_LEN: usize = 8;

/// How a record came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    #[default]
    Launched,
    /// Rebuilt by the reconciler from a live instance's tags
    Adopted,
}

/// One managed game server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub name: String,

    /// Workload kind, or [`UNKNOWN_KIND`]
    pub game: String,
    pub status: ServerStatus,
    pub instance_id: Option<String>,
    pub security_group_id: Option<String>,
    pub volume_id: Option<String>,

    /// Present only while an elastic address is pinned
    #[serde(default)]
    pub allocation_id: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    pub region: String,
    #[serde(default)]
    pub ports: Vec<PortRule>,
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub origin: RecordOrigin,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

impl ServerRecord {
    /// `ip:port` of the first game port, when the server has an address
    pub fn connection_string(&self) -> Option<String> {
        let ip = self.public_ip.as_deref()?;
        Some(match self.ports.first() {
            Some(port) => format!("{}:{}", ip, port.port),
            None => ip.to_string(),
        })
    }

    pub fn is_pinned(&self) -> bool {
        self.allocation_id.is_some()
    }
}

/// Point-in-time copy of a server's data volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,

    /// Provider-side snapshot identifier
    pub snapshot_id: String,

    /// Source server; may point at a record that no longer exists
    pub source_server_id: Option<String>,
    pub source_server_name: String,
    pub game: String,
    pub region: String,
    pub size_gb: u32,
    pub created_at: DateTime<Utc>,

    /// Effective config of the source at snapshot time
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Fresh 12-character server or snapshot identifier
pub fn new_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(ID_LEN);
    id
}

/// `<kind>-<first 6 id chars>`
pub fn default_name(kind: &str, id: &str) -> String {
    format!("{}-{}", kind, prefix(id, NAME_ID_LEN))
}

/// `gsm-<kind>-<first 8 id chars>`
pub fn container_name(kind: &str, id: &str) -> String {
    format!("gsm-{}-{}", kind, prefix(id, CONTAINER_ID_LEN))
}

fn prefix(id: &str, len: usize) -> &str {
    id.get(..len).unwrap_or(id)
}

/// Server names become tag values and container names
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !name.starts_with('-')
}

/// Server inventory document, keyed by server id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInventory {
    pub servers: BTreeMap<String, ServerRecord>,
}

impl ServerInventory {
    /// Find a server by id, exact name, or unique id prefix
    pub fn find(&self, query: &str) -> Result<&ServerRecord> {
        if let Some(record) = self.servers.get(query) {
            return Ok(record);
        }
        if let Some(record) = self.servers.values().find(|r| r.name == query) {
            return Ok(record);
        }

        let matches: Vec<&ServerRecord> = self
            .servers
            .values()
            .filter(|r| !query.is_empty() && r.id.starts_with(query))
            .collect();
        match matches.as_slice() {
            [record] => Ok(record),
            [] => Err(GsmError::not_found("server", query)),
            _ => Err(ConflictError::Ambiguous {
                query: query.to_string(),
                matches: matches.iter().map(|r| r.name.clone()).collect(),
            }
            .into()),
        }
    }

    pub fn name_taken(&self, name: &str) -> bool {
        self.servers.values().any(|r| r.name == name)
    }

    /// Record currently holding the allocation
    pub fn pin_holder(&self, allocation_id: &str) -> Option<&ServerRecord> {
        self.servers
            .values()
            .find(|r| r.allocation_id.as_deref() == Some(allocation_id))
    }

    pub fn by_instance(&self, instance_id: &str) -> Option<&ServerRecord> {
        self.servers
            .values()
            .find(|r| r.instance_id.as_deref() == Some(instance_id))
    }

    pub fn insert(&mut self, record: ServerRecord) {
        self.servers.insert(record.id.clone(), record);
    }

    pub fn remove(&mut self, id: &str) -> Option<ServerRecord> {
        self.servers.remove(id)
    }

    /// Check the invariants every persisted inventory must hold
    pub fn check(&self) -> std::result::Result<(), String> {
        let mut pins: BTreeMap<&str, &str> = BTreeMap::new();
        for record in self.servers.values() {
            if record.instance_id.is_some() != record.status.has_instance() {
                return Err(format!(
                    "server '{}' is {} but instance is {:?}",
                    record.name, record.status, record.instance_id
                ));
            }
            if let Some(allocation) = record.allocation_id.as_deref() {
                if let Some(other) = pins.insert(allocation, &record.name) {
                    return Err(format!(
                        "address {} is pinned to both '{}' and '{}'",
                        allocation, other, record.name
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Snapshot inventory document, keyed by snapshot record id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInventory {
    pub snapshots: BTreeMap<String, SnapshotRecord>,
}

impl SnapshotInventory {
    /// Find a snapshot by record id, provider snapshot id, or unique prefix
    pub fn find(&self, query: &str) -> Result<&SnapshotRecord> {
        if let Some(record) = self.snapshots.get(query) {
            return Ok(record);
        }
        if let Some(record) = self.snapshots.values().find(|s| s.snapshot_id == query) {
            return Ok(record);
        }
        let mut matches = self
            .snapshots
            .values()
            .filter(|s| !query.is_empty() && s.id.starts_with(query));
        match (matches.next(), matches.next()) {
            (Some(record), None) => Ok(record),
            _ => Err(GsmError::not_found("snapshot", query)),
        }
    }

    pub fn insert(&mut self, record: SnapshotRecord) {
        self.snapshots.insert(record.id.clone(), record);
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::record;
    use super::*;

    #[test]
    fn test_naming() {
        let id = new_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(default_name("factorio", "abcdef123456"), "factorio-abcdef");
        assert_eq!(container_name("factorio", "abcdef123456"), "gsm-factorio-abcdef12");
        assert!(is_valid_name("my-server_2"));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name(""));
    }

    #[test]
    fn test_find_by_id_name_and_prefix() {
        let mut inventory = ServerInventory::default();
        inventory.insert(record("abc111000000", "alpha", "i-1"));
        inventory.insert(record("abc222000000", "beta", "i-2"));

        assert_eq!(inventory.find("abc111000000").unwrap().name, "alpha");
        assert_eq!(inventory.find("beta").unwrap().id, "abc222000000");
        assert_eq!(inventory.find("abc2").unwrap().name, "beta");
        assert!(matches!(
            inventory.find("abc"),
            Err(GsmError::Conflict(ConflictError::Ambiguous { .. }))
        ));
        assert!(matches!(inventory.find("zzz"), Err(GsmError::NotFound { .. })));
    }

    #[test]
    fn test_check_invariants() {
        let mut inventory = ServerInventory::default();
        let mut a = record("a00000000000", "a", "i-1");
        a.allocation_id = Some("eipalloc-1".to_string());
        inventory.insert(a);
        assert!(inventory.check().is_ok());

        let mut b = record("b00000000000", "b", "i-2");
        b.allocation_id = Some("eipalloc-1".to_string());
        inventory.insert(b);
        assert!(inventory.check().unwrap_err().contains("pinned to both"));

        let mut inventory = ServerInventory::default();
        let mut c = record("c00000000000", "c", "i-3");
        c.instance_id = None;
        inventory.insert(c);
        assert!(inventory.check().is_err());
    }

    #[test]
    fn test_connection_string() {
        let mut r = record("a00000000000", "a", "i-1");
        r.ports = vec![PortRule::parse("34197/udp").unwrap()];
        assert_eq!(r.connection_string().as_deref(), Some("203.0.113.5:34197"));
        r.public_ip = None;
        assert_eq!(r.connection_string(), None);
    }
}
