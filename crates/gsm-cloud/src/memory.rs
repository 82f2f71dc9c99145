//! In-memory cloud provider
//!
//! Behaves like a small, strict cloud: long-running operations report a
//! transitional state on the first describe, deletes of missing resources
//! return `NotFound`, and in-use resources refuse deletion. Every operation
//! can be made to fail, permanently or a bounded number of times, which is
//! how rollback and retry paths are exercised without a real account.
//! Creations can also lose their response: the resource exists but the
//! caller sees a transient error, as after a dropped connection.

use crate::error::{ProviderError, Result};
use crate::provider::{
    Address, AddressSpec, CloudProvider, InstanceSpec, KeyPair, LiveInstance, PortRule,
    PowerState, ProviderFactory, SecurityGroup, SecurityGroupSpec, Snapshot, SnapshotState,
    Tags, Volume, VolumeSpec, VolumeState,
};
use crate::tags;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

const DEFAULT_ZONE_SUFFIX: &str = "a";

/// Provider operations, used to target faults and count calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    EnsureKeyPair,
    DeleteKeyPair,
    EnsureSecurityGroup,
    DeleteSecurityGroup,
    CreateVolume,
    DescribeVolume,
    AttachVolume,
    DeleteVolume,
    LaunchInstance,
    DescribeInstance,
    ListInstances,
    StartInstance,
    StopInstance,
    TerminateInstance,
    SetTag,
    DeleteTag,
    AllocateAddress,
    AssociateAddress,
    DisassociateAddress,
    ReleaseAddress,
    ListAddresses,
    CreateSnapshot,
    DescribeSnapshot,
    DeleteSnapshot,
    ListSnapshots,
}

impl Operation {
    /// Whether the operation changes provider-side state
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Operation::DescribeVolume
                | Operation::DescribeInstance
                | Operation::ListInstances
                | Operation::ListAddresses
                | Operation::DescribeSnapshot
                | Operation::ListSnapshots
        )
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Permanent,
    Transient { remaining: u32 },
}

/// Resource totals, for asserting that nothing leaked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub key_pairs: usize,
    pub security_groups: usize,
    pub volumes: usize,
    pub instances: usize,
    pub addresses: usize,
    pub snapshots: usize,
}

impl ResourceCounts {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone)]
struct MemGroup {
    name: String,
    ports: Vec<PortRule>,
}

#[derive(Debug, Clone)]
struct MemVolume {
    volume: Volume,
    attached_to: Option<String>,
    contents: Vec<String>,
    tags: Tags,
}

#[derive(Debug, Clone)]
struct MemInstance {
    live: LiveInstance,
    security_group_id: String,
}

#[derive(Debug, Clone)]
struct MemSnapshot {
    snapshot: Snapshot,
    contents: Vec<String>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    key_pairs: BTreeSet<String>,
    groups: BTreeMap<String, MemGroup>,
    volumes: BTreeMap<String, MemVolume>,
    instances: BTreeMap<String, MemInstance>,
    addresses: BTreeMap<String, Address>,
    snapshots: BTreeMap<String, MemSnapshot>,
    faults: HashMap<Operation, Fault>,
    lost_responses: HashMap<Operation, u32>,
    calls: HashMap<Operation, usize>,

    /// Client token to the resource its first call created
    tokens: HashMap<String, String>,
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:06x}", prefix, self.next_id)
    }

    fn public_ip(&mut self, block: &str) -> String {
        self.next_id += 1;
        format!("{}.{}", block, self.next_id % 250 + 1)
    }

    fn instance_mut(&mut self, instance_id: &str) -> Result<&mut MemInstance> {
        self.instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::not_found("instance", instance_id))
    }

    /// Resource an earlier call with `token` created
    fn by_token(&self, token: Option<&str>) -> Option<&str> {
        token
            .and_then(|t| self.tokens.get(t))
            .map(String::as_str)
    }

    fn remember(&mut self, token: Option<&str>, resource_id: &str) {
        if let Some(token) = token {
            self.tokens.insert(token.to_string(), resource_id.to_string());
        }
    }

    /// Hand back a creation's result, or drop it if a lost response is due
    fn respond<T>(&mut self, op: Operation, value: T) -> Result<T> {
        match self.lost_responses.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                tracing::debug!("Injected lost response: {}", op);
                Err(ProviderError::Transient(format!("connection reset during {}", op)))
            }
            _ => Ok(value),
        }
    }
}

/// Cloud provider holding all resources in process memory
pub struct InMemoryProvider {
    region: String,
    inner: Mutex<Inner>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new("memory-1")
    }
}

impl InMemoryProvider {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count the call and apply any configured fault
    fn enter(&self, op: Operation) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        *inner.calls.entry(op).or_default() += 1;

        match inner.faults.get(&op).copied() {
            Some(Fault::Permanent) => {
                tracing::debug!("Injected permanent fault: {}", op);
                Err(ProviderError::Injected(op.to_string()))
            }
            Some(Fault::Transient { remaining }) if remaining > 0 => {
                inner
                    .faults
                    .insert(op, Fault::Transient { remaining: remaining - 1 });
                Err(ProviderError::Transient(format!("injected throttle in {}", op)))
            }
            _ => Ok(inner),
        }
    }

    fn zone(&self) -> String {
        format!("{}{}", self.region, DEFAULT_ZONE_SUFFIX)
    }

    /// Make every call to `op` fail with a non-retryable error
    pub fn fail(&self, op: Operation) {
        self.lock().faults.insert(op, Fault::Permanent);
    }

    /// Make the next `times` calls to `op` fail with a transient error
    pub fn fail_transiently(&self, op: Operation, times: u32) {
        self.lock()
            .faults
            .insert(op, Fault::Transient { remaining: times });
    }

    /// Let the next `times` calls to `op` take effect but report a
    /// transient error
    pub fn lose_responses(&self, op: Operation, times: u32) {
        self.lock().lost_responses.insert(op, times);
    }

    pub fn clear_faults(&self) {
        let mut inner = self.lock();
        inner.faults.clear();
        inner.lost_responses.clear();
    }

    /// Number of calls made to `op`, failed ones included
    pub fn calls(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of calls made to any state-changing operation
    pub fn mutating_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|(op, _)| op.is_mutating())
            .map(|(_, n)| n)
            .sum()
    }

    /// Live resource totals; terminated instances are not counted
    pub fn counts(&self) -> ResourceCounts {
        let inner = self.lock();
        ResourceCounts {
            key_pairs: inner.key_pairs.len(),
            security_groups: inner.groups.len(),
            volumes: inner.volumes.len(),
            instances: inner
                .instances
                .values()
                .filter(|i| !i.live.state.is_gone())
                .count(),
            addresses: inner.addresses.len(),
            snapshots: inner.snapshots.len(),
        }
    }

    pub fn instance(&self, instance_id: &str) -> Option<LiveInstance> {
        self.lock()
            .instances
            .get(instance_id)
            .map(|i| i.live.clone())
    }

    pub fn volume(&self, volume_id: &str) -> Option<Volume> {
        self.lock()
            .volumes
            .get(volume_id)
            .map(|v| v.volume.clone())
    }

    pub fn address(&self, allocation_id: &str) -> Option<Address> {
        self.lock().addresses.get(allocation_id).cloned()
    }

    /// Game ports the group opens to the internet
    pub fn group_ports(&self, group_id: &str) -> Option<Vec<PortRule>> {
        self.lock().groups.get(group_id).map(|g| g.ports.clone())
    }

    /// Ingress group an instance was launched into
    pub fn instance_group(&self, instance_id: &str) -> Option<String> {
        self.lock()
            .instances
            .get(instance_id)
            .map(|i| i.security_group_id.clone())
    }

    /// Volume the instance currently has attached, if any
    pub fn attached_volume(&self, instance_id: &str) -> Option<String> {
        self.lock()
            .volumes
            .iter()
            .find(|(_, v)| v.attached_to.as_deref() == Some(instance_id))
            .map(|(id, _)| id.clone())
    }

    /// Simulate the workload writing data onto a volume
    pub fn write_volume(&self, volume_id: &str, line: &str) {
        if let Some(volume) = self.lock().volumes.get_mut(volume_id) {
            volume.contents.push(line.to_string());
        }
    }

    pub fn volume_contents(&self, volume_id: &str) -> Vec<String> {
        self.lock()
            .volumes
            .get(volume_id)
            .map(|v| v.contents.clone())
            .unwrap_or_default()
    }

    /// Terminate an instance behind the system's back
    pub fn terminate_out_of_band(&self, instance_id: &str) {
        let mut inner = self.lock();
        terminate(&mut inner, instance_id);
    }

    /// Stop an instance behind the system's back
    pub fn stop_out_of_band(&self, instance_id: &str) {
        if let Some(instance) = self.lock().instances.get_mut(instance_id) {
            instance.live.state = PowerState::Stopped;
            instance.live.public_ip = None;
        }
    }

    /// Create a running instance that no local record knows about
    pub fn spawn_instance(&self, tags: Tags) -> String {
        let mut inner = self.lock();
        let id = inner.next_id("i");
        let ip = inner.public_ip("203.0.113");
        inner.instances.insert(
            id.clone(),
            MemInstance {
                live: LiveInstance {
                    instance_id: id.clone(),
                    state: PowerState::Running,
                    public_ip: Some(ip),
                    tags,
                },
                security_group_id: String::new(),
            },
        );
        id
    }

    /// Delete a snapshot behind the system's back
    pub fn delete_snapshot_out_of_band(&self, snapshot_id: &str) {
        self.lock().snapshots.remove(snapshot_id);
    }
}

/// In-memory providers keyed by region
#[derive(Default)]
pub struct InMemoryRegions {
    providers: Mutex<BTreeMap<String, Arc<InMemoryProvider>>>,
}

impl InMemoryRegions {
    pub fn new(providers: impl IntoIterator<Item = Arc<InMemoryProvider>>) -> Self {
        Self {
            providers: Mutex::new(
                providers
                    .into_iter()
                    .map(|p| (p.region.clone(), p))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl ProviderFactory for InMemoryRegions {
    async fn for_region(&self, region: &str) -> Result<Arc<dyn CloudProvider>> {
        let providers = self
            .providers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        providers
            .get(region)
            .map(|p| p.clone() as Arc<dyn CloudProvider>)
            .ok_or_else(|| ProviderError::not_found("region", region))
    }
}

fn terminate(inner: &mut Inner, instance_id: &str) {
    if let Some(instance) = inner.instances.get_mut(instance_id) {
        instance.live.state = PowerState::Terminated;
        instance.live.public_ip = None;
    }
    for volume in inner.volumes.values_mut() {
        if volume.attached_to.as_deref() == Some(instance_id) {
            volume.attached_to = None;
            volume.volume.state = VolumeState::Available;
        }
    }
    for address in inner.addresses.values_mut() {
        if address.instance_id.as_deref() == Some(instance_id) {
            address.instance_id = None;
            address.association_id = None;
        }
    }
}

#[async_trait]
impl CloudProvider for InMemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn ensure_key_pair(&self, name: &str) -> Result<KeyPair> {
        let mut inner = self.enter(Operation::EnsureKeyPair)?;
        let created = inner.key_pairs.insert(name.to_string());
        Ok(KeyPair {
            name: name.to_string(),
            private_key_path: None,
            created,
        })
    }

    async fn delete_key_pair(&self, name: &str) -> Result<()> {
        let mut inner = self.enter(Operation::DeleteKeyPair)?;
        if inner.key_pairs.remove(name) {
            Ok(())
        } else {
            Err(ProviderError::not_found("key pair", name))
        }
    }

    async fn ensure_security_group(&self, spec: &SecurityGroupSpec) -> Result<SecurityGroup> {
        let mut inner = self.enter(Operation::EnsureSecurityGroup)?;
        if let Some((id, group)) = inner.groups.iter().find(|(_, g)| g.name == spec.name) {
            return Ok(SecurityGroup {
                id: id.clone(),
                name: group.name.clone(),
                created: false,
            });
        }

        let id = inner.next_id("sg");
        inner.groups.insert(
            id.clone(),
            MemGroup {
                name: spec.name.clone(),
                ports: spec.ports.clone(),
            },
        );
        Ok(SecurityGroup {
            id,
            name: spec.name.clone(),
            created: true,
        })
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        let mut inner = self.enter(Operation::DeleteSecurityGroup)?;
        if !inner.groups.contains_key(group_id) {
            return Err(ProviderError::not_found("security group", group_id));
        }
        let in_use = inner
            .instances
            .values()
            .any(|i| i.security_group_id == group_id && !i.live.state.is_gone());
        if in_use {
            return Err(ProviderError::api(
                "DependencyViolation",
                format!("security group {} is in use", group_id),
            ));
        }
        inner.groups.remove(group_id);
        Ok(())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<Volume> {
        let mut inner = self.enter(Operation::CreateVolume)?;
        if let Some(id) = inner.by_token(spec.client_token.as_deref()) {
            if let Some(existing) = inner.volumes.get(id) {
                let volume = existing.volume.clone();
                return inner.respond(Operation::CreateVolume, volume);
            }
        }

        let (size_gb, contents) = match &spec.snapshot_id {
            Some(snapshot_id) => {
                let snapshot = inner
                    .snapshots
                    .get(snapshot_id)
                    .ok_or_else(|| ProviderError::not_found("snapshot", snapshot_id))?;
                if snapshot.snapshot.state != SnapshotState::Completed {
                    return Err(ProviderError::api(
                        "IncorrectState",
                        format!("snapshot {} is not completed", snapshot_id),
                    ));
                }
                (
                    spec.size_gb.max(snapshot.snapshot.size_gb),
                    snapshot.contents.clone(),
                )
            }
            None => (spec.size_gb, Vec::new()),
        };

        let id = inner.next_id("vol");
        let volume = Volume {
            id: id.clone(),
            availability_zone: spec.availability_zone.clone().unwrap_or_else(|| self.zone()),
            size_gb,
            state: VolumeState::Creating,
        };
        inner.remember(spec.client_token.as_deref(), &id);
        inner.volumes.insert(
            id,
            MemVolume {
                volume: volume.clone(),
                attached_to: None,
                contents,
                tags: spec.tags.clone(),
            },
        );
        inner.respond(Operation::CreateVolume, volume)
    }

    async fn describe_volume(&self, volume_id: &str) -> Result<Volume> {
        let mut inner = self.enter(Operation::DescribeVolume)?;
        let volume = inner
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| ProviderError::not_found("volume", volume_id))?;
        let observed = volume.volume.clone();
        if volume.volume.state == VolumeState::Creating {
            volume.volume.state = VolumeState::Available;
        }
        Ok(observed)
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &str) -> Result<()> {
        let mut inner = self.enter(Operation::AttachVolume)?;
        let state = inner.instance_mut(instance_id)?.live.state;
        if !matches!(state, PowerState::Running | PowerState::Stopped) {
            return Err(ProviderError::api(
                "IncorrectState",
                format!("instance {} is {}", instance_id, state),
            ));
        }
        let volume = inner
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| ProviderError::not_found("volume", volume_id))?;
        if volume.volume.state != VolumeState::Available {
            return Err(ProviderError::api(
                "IncorrectState",
                format!("volume {} is not available", volume_id),
            ));
        }
        volume.attached_to = Some(instance_id.to_string());
        volume.volume.state = VolumeState::InUse;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let mut inner = self.enter(Operation::DeleteVolume)?;
        let volume = inner
            .volumes
            .get(volume_id)
            .ok_or_else(|| ProviderError::not_found("volume", volume_id))?;
        if volume.attached_to.is_some() {
            return Err(ProviderError::api(
                "VolumeInUse",
                format!("volume {} is attached", volume_id),
            ));
        }
        inner.volumes.remove(volume_id);
        Ok(())
    }

    async fn launch_instance(&self, spec: &InstanceSpec) -> Result<String> {
        let mut inner = self.enter(Operation::LaunchInstance)?;
        if let Some(id) = inner.by_token(spec.client_token.as_deref()) {
            let id = id.to_string();
            return inner.respond(Operation::LaunchInstance, id);
        }
        if !inner.key_pairs.contains(&spec.key_name) {
            return Err(ProviderError::api(
                "InvalidKeyPair.NotFound",
                format!("key pair {} does not exist", spec.key_name),
            ));
        }
        if !inner.groups.contains_key(&spec.security_group_id) {
            return Err(ProviderError::api(
                "InvalidGroup.NotFound",
                format!("security group {} does not exist", spec.security_group_id),
            ));
        }

        let id = inner.next_id("i");
        inner.instances.insert(
            id.clone(),
            MemInstance {
                live: LiveInstance {
                    instance_id: id.clone(),
                    state: PowerState::Pending,
                    public_ip: None,
                    tags: spec.tags.clone(),
                },
                security_group_id: spec.security_group_id.clone(),
            },
        );
        inner.remember(spec.client_token.as_deref(), &id);
        inner.respond(Operation::LaunchInstance, id)
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<LiveInstance> {
        let mut inner = self.enter(Operation::DescribeInstance)?;
        let eip = inner
            .addresses
            .values()
            .find(|a| a.instance_id.as_deref() == Some(instance_id))
            .map(|a| a.public_ip.clone());
        let fresh_ip = inner.public_ip("203.0.113");

        let instance = inner.instance_mut(instance_id)?;
        let observed = instance.live.clone();
        match instance.live.state {
            PowerState::Pending => {
                instance.live.state = PowerState::Running;
                instance.live.public_ip = eip.or(Some(fresh_ip));
            }
            PowerState::Stopping => {
                instance.live.state = PowerState::Stopped;
                instance.live.public_ip = eip;
            }
            _ => {}
        }
        Ok(observed)
    }

    async fn list_instances(&self) -> Result<Vec<LiveInstance>> {
        let inner = self.enter(Operation::ListInstances)?;
        Ok(inner
            .instances
            .values()
            .filter(|i| tags::is_managed(&i.live.tags) && !i.live.state.is_gone())
            .map(|i| i.live.clone())
            .collect())
    }

    async fn start_instance(&self, instance_id: &str) -> Result<()> {
        let mut inner = self.enter(Operation::StartInstance)?;
        let instance = inner.instance_mut(instance_id)?;
        match instance.live.state {
            PowerState::Stopped => {
                instance.live.state = PowerState::Pending;
                Ok(())
            }
            PowerState::Pending | PowerState::Running => Ok(()),
            state => Err(ProviderError::api(
                "IncorrectInstanceState",
                format!("instance {} is {}", instance_id, state),
            )),
        }
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        let mut inner = self.enter(Operation::StopInstance)?;
        let instance = inner.instance_mut(instance_id)?;
        match instance.live.state {
            PowerState::Running | PowerState::Pending => {
                instance.live.state = PowerState::Stopping;
                Ok(())
            }
            PowerState::Stopping | PowerState::Stopped => Ok(()),
            state => Err(ProviderError::api(
                "IncorrectInstanceState",
                format!("instance {} is {}", instance_id, state),
            )),
        }
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        let mut inner = self.enter(Operation::TerminateInstance)?;
        if !inner.instances.contains_key(instance_id) {
            return Err(ProviderError::not_found("instance", instance_id));
        }
        terminate(&mut inner, instance_id);
        Ok(())
    }

    async fn set_tag(&self, resource_id: &str, key: &str, value: &str) -> Result<()> {
        let mut inner = self.enter(Operation::SetTag)?;
        let tags = resource_tags(&mut inner, resource_id)?;
        tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_tag(&self, resource_id: &str, key: &str) -> Result<()> {
        let mut inner = self.enter(Operation::DeleteTag)?;
        let tags = resource_tags(&mut inner, resource_id)?;
        tags.remove(key);
        Ok(())
    }

    async fn allocate_address(&self, spec: &AddressSpec) -> Result<Address> {
        let mut inner = self.enter(Operation::AllocateAddress)?;
        if let Some(id) = inner.by_token(spec.client_token.as_deref()) {
            if let Some(existing) = inner.addresses.get(id) {
                let address = existing.clone();
                return inner.respond(Operation::AllocateAddress, address);
            }
        }

        let allocation_id = inner.next_id("eipalloc");
        let public_ip = inner.public_ip("198.51.100");
        let address = Address {
            allocation_id: allocation_id.clone(),
            public_ip,
            association_id: None,
            instance_id: None,
            tags: spec.tags.clone(),
        };
        inner.remember(spec.client_token.as_deref(), &allocation_id);
        inner.addresses.insert(allocation_id, address.clone());
        inner.respond(Operation::AllocateAddress, address)
    }

    async fn associate_address(&self, allocation_id: &str, instance_id: &str) -> Result<()> {
        let mut inner = self.enter(Operation::AssociateAddress)?;
        let state = inner.instance_mut(instance_id)?.live.state;
        if state.is_gone() {
            return Err(ProviderError::api(
                "IncorrectInstanceState",
                format!("instance {} is {}", instance_id, state),
            ));
        }
        let association_id = inner.next_id("eipassoc");
        let address = inner
            .addresses
            .get_mut(allocation_id)
            .ok_or_else(|| ProviderError::not_found("address", allocation_id))?;
        match address.instance_id.as_deref() {
            Some(current) if current == instance_id => return Ok(()),
            Some(current) => {
                return Err(ProviderError::api(
                    "Resource.AlreadyAssociated",
                    format!("{} is associated with {}", allocation_id, current),
                ));
            }
            None => {}
        }
        address.association_id = Some(association_id);
        address.instance_id = Some(instance_id.to_string());
        let public_ip = address.public_ip.clone();

        let instance = inner.instance_mut(instance_id)?;
        if instance.live.state == PowerState::Running {
            instance.live.public_ip = Some(public_ip);
        }
        Ok(())
    }

    async fn disassociate_address(&self, allocation_id: &str) -> Result<()> {
        let mut inner = self.enter(Operation::DisassociateAddress)?;
        let address = inner
            .addresses
            .get_mut(allocation_id)
            .ok_or_else(|| ProviderError::not_found("address", allocation_id))?;
        let previous = address.instance_id.take();
        address.association_id = None;
        if let Some(instance_id) = previous {
            if let Some(instance) = inner.instances.get_mut(&instance_id) {
                instance.live.public_ip = None;
            }
        }
        Ok(())
    }

    async fn release_address(&self, allocation_id: &str) -> Result<()> {
        let mut inner = self.enter(Operation::ReleaseAddress)?;
        let address = inner
            .addresses
            .get(allocation_id)
            .ok_or_else(|| ProviderError::not_found("address", allocation_id))?;
        if address.is_associated() {
            return Err(ProviderError::api(
                "InvalidIPAddress.InUse",
                format!("{} is still associated", allocation_id),
            ));
        }
        inner.addresses.remove(allocation_id);
        Ok(())
    }

    async fn list_addresses(&self) -> Result<Vec<Address>> {
        let inner = self.enter(Operation::ListAddresses)?;
        Ok(inner
            .addresses
            .values()
            .filter(|a| tags::is_managed(&a.tags))
            .cloned()
            .collect())
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        _description: &str,
        tags: &Tags,
    ) -> Result<String> {
        let mut inner = self.enter(Operation::CreateSnapshot)?;
        let volume = inner
            .volumes
            .get(volume_id)
            .ok_or_else(|| ProviderError::not_found("volume", volume_id))?;
        let size_gb = volume.volume.size_gb;
        let contents = volume.contents.clone();

        let id = inner.next_id("snap");
        inner.snapshots.insert(
            id.clone(),
            MemSnapshot {
                snapshot: Snapshot {
                    snapshot_id: id.clone(),
                    volume_id: volume_id.to_string(),
                    size_gb,
                    state: SnapshotState::Pending,
                    started_at: Some(Utc::now()),
                    tags: tags.clone(),
                },
                contents,
            },
        );
        Ok(id)
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let mut inner = self.enter(Operation::DescribeSnapshot)?;
        let snapshot = inner
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| ProviderError::not_found("snapshot", snapshot_id))?;
        let observed = snapshot.snapshot.clone();
        snapshot.snapshot.state = SnapshotState::Completed;
        Ok(observed)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let mut inner = self.enter(Operation::DeleteSnapshot)?;
        inner
            .snapshots
            .remove(snapshot_id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found("snapshot", snapshot_id))
    }

    async fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let inner = self.enter(Operation::ListSnapshots)?;
        Ok(inner
            .snapshots
            .values()
            .filter(|s| tags::is_managed(&s.snapshot.tags))
            .map(|s| s.snapshot.clone())
            .collect())
    }
}

fn resource_tags<'a>(inner: &'a mut Inner, resource_id: &str) -> Result<&'a mut Tags> {
    if let Some(instance) = inner.instances.get_mut(resource_id) {
        return Ok(&mut instance.live.tags);
    }
    if let Some(volume) = inner.volumes.get_mut(resource_id) {
        return Ok(&mut volume.tags);
    }
    if let Some(address) = inner.addresses.get_mut(resource_id) {
        return Ok(&mut address.tags);
    }
    if let Some(snapshot) = inner.snapshots.get_mut(resource_id) {
        return Ok(&mut snapshot.snapshot.tags);
    }
    Err(ProviderError::not_found("resource", resource_id))
}
