//! Cloud provider trait definition

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Tags attached to provider-side resources
pub type Tags = BTreeMap<String, String>;

/// Cloud provider abstraction trait
///
/// One method per provider primitive. Implementations do not retry; callers
/// wrap idempotent calls in [`crate::retry::with_retry`]. Creation calls take
/// a client token: repeating a call with the same token returns the resource
/// the first call created instead of creating another. Deleting a resource
/// that no longer exists returns [`crate::ProviderError::NotFound`] so the
/// caller decides whether absence counts as success.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Returns the provider name (e.g., "aws", "memory")
    fn name(&self) -> &str;

    /// Region every call of this provider is scoped to
    fn region(&self) -> &str;

    /// Make sure an SSH key pair exists and its private key is on local disk
    async fn ensure_key_pair(&self, name: &str) -> Result<KeyPair>;

    async fn delete_key_pair(&self, name: &str) -> Result<()>;

    /// Find the group by name or create it with the given ingress rules
    async fn ensure_security_group(&self, spec: &SecurityGroupSpec) -> Result<SecurityGroup>;

    async fn delete_security_group(&self, group_id: &str) -> Result<()>;

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume>;

    async fn describe_volume(&self, volume_id: &str) -> Result<Volume>;

    async fn attach_volume(&self, volume_id: &str, instance_id: &str) -> Result<()>;

    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    /// Launch one instance, returning its identifier
    async fn launch_instance(&self, spec: &InstanceSpec) -> Result<String>;

    async fn describe_instance(&self, instance_id: &str) -> Result<LiveInstance>;

    /// All instances tagged as belonging to this system that are not
    /// terminated or shutting down. Read-only.
    async fn list_instances(&self) -> Result<Vec<LiveInstance>>;

    async fn start_instance(&self, instance_id: &str) -> Result<()>;

    async fn stop_instance(&self, instance_id: &str) -> Result<()>;

    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    async fn set_tag(&self, resource_id: &str, key: &str, value: &str) -> Result<()>;

    async fn delete_tag(&self, resource_id: &str, key: &str) -> Result<()>;

    async fn allocate_address(&self, spec: &AddressSpec) -> Result<Address>;

    async fn associate_address(&self, allocation_id: &str, instance_id: &str) -> Result<()>;

    /// No-op when the allocation is not associated
    async fn disassociate_address(&self, allocation_id: &str) -> Result<()>;

    async fn release_address(&self, allocation_id: &str) -> Result<()>;

    /// Addresses tagged as belonging to this system. Read-only.
    async fn list_addresses(&self) -> Result<Vec<Address>>;

    async fn create_snapshot(&self, volume_id: &str, description: &str, tags: &Tags)
    -> Result<String>;

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;

    /// Snapshots tagged as belonging to this system. Read-only.
    async fn list_snapshots(&self) -> Result<Vec<Snapshot>>;
}

/// Hands out providers scoped to other regions
///
/// Records carry the region they were launched in; reconciliation and
/// lifecycle verbs on those records go through the provider of that region.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn for_region(&self, region: &str) -> Result<Arc<dyn CloudProvider>>;
}

/// SSH key pair handle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    pub name: String,

    /// Local path of the private key, if this provider manages one
    pub private_key_path: Option<PathBuf>,

    /// Whether this call created the key pair
    pub created: bool,
}

/// Transport protocol of an ingress rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A single port exposed to the internet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRule {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortRule {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }

    /// `27015/tcp`
    pub fn spec(&self) -> String {
        format!("{}/{}", self.port, self.protocol)
    }

    /// Parse `27015/tcp`
    pub fn parse(spec: &str) -> Option<Self> {
        let (port, protocol) = spec.trim().split_once('/')?;
        let port = port.parse().ok()?;
        let protocol = match protocol {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => return None,
        };
        Some(Self { port, protocol })
    }
}

/// Ingress group request
#[derive(Debug, Clone)]
pub struct SecurityGroupSpec {
    pub name: String,
    pub description: String,
    pub ports: Vec<PortRule>,

    /// Source range allowed to reach port 22 for the remote-command channel
    pub ssh_cidr: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,

    /// Whether this call created the group (false when reused)
    pub created: bool,
}

/// Data volume request
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub size_gb: u32,

    /// Restore the volume from this snapshot instead of creating it empty
    pub snapshot_id: Option<String>,

    /// Provider picks a default zone when absent
    pub availability_zone: Option<String>,
    pub tags: Tags,

    /// Makes a repeated create return the first volume
    pub client_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub availability_zone: String,
    pub size_gb: u32,
    pub state: VolumeState,
}

/// Compute instance request
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub instance_type: String,
    pub min_ram_gb: u32,
    pub key_name: String,
    pub security_group_id: String,

    /// Must match the data volume's zone so it can be attached
    pub availability_zone: String,
    pub user_data: Option<String>,
    pub tags: Tags,

    /// Makes a repeated launch return the first instance
    pub client_token: Option<String>,
}

/// Observed power state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl PowerState {
    /// Terminated or on its way there
    pub fn is_gone(&self) -> bool {
        matches!(self, PowerState::ShuttingDown | PowerState::Terminated)
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::Pending => write!(f, "pending"),
            PowerState::Running => write!(f, "running"),
            PowerState::Stopping => write!(f, "stopping"),
            PowerState::Stopped => write!(f, "stopped"),
            PowerState::ShuttingDown => write!(f, "shutting-down"),
            PowerState::Terminated => write!(f, "terminated"),
        }
    }
}

/// An instance as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveInstance {
    pub instance_id: String,
    pub state: PowerState,
    pub public_ip: Option<String>,
    pub tags: Tags,
}

impl LiveInstance {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

/// Elastic address request
#[derive(Debug, Clone, Default)]
pub struct AddressSpec {
    pub tags: Tags,

    /// Makes a repeated allocation return the first address
    pub client_token: Option<String>,
}

/// Elastic address allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub allocation_id: String,
    pub public_ip: String,
    pub association_id: Option<String>,
    pub instance_id: Option<String>,
    pub tags: Tags,
}

impl Address {
    pub fn is_associated(&self) -> bool {
        self.association_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
}

/// Point-in-time volume copy as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub volume_id: String,
    pub size_gb: u32,
    pub state: SnapshotState,
    pub started_at: Option<DateTime<Utc>>,
    pub tags: Tags,
}

/// Retry configuration for provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, first call included
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Bounded polling for long-running provider operations
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10000),
            backoff_multiplier: 2.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(10000)); // capped at max
    }

    #[test]
    fn test_port_rule_spec() {
        let rule = PortRule::new(34197, Protocol::Udp);
        assert_eq!(rule.spec(), "34197/udp");
        assert_eq!(PortRule::parse("34197/udp"), Some(rule));
        assert_eq!(PortRule::parse("34197"), None);
        assert_eq!(PortRule::parse("x/tcp"), None);
        assert_eq!(PortRule::parse("22/sctp"), None);
    }
}
