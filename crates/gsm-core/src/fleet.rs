//! Fleet operations
//!
//! [`Fleet`] is the seam consumed by front ends: one method per lifecycle
//! verb plus the read-only queries. Every method holds the store lock for its
//! whole duration. Records change only after the matching cloud operation
//! succeeded, so an interrupted command leaves the previous status in place
//! for the next reconciliation pass to correct.
//!
//! Launches go to the fleet's own region. Every other call reaches the
//! region the record names, through the [`ProviderFactory`] given to
//! [`Fleet::with_regions`].

use crate::address::{AddressManager, AddressView};
use crate::catalog::{Catalog, WorkloadDefinition};
use crate::config::{self, EffectiveConfig};
use crate::error::{ConflictError, GsmError, Result, ValidationError};
use crate::lifecycle::{ServerStatus, Verb};
use crate::model::{
    RecordOrigin, ServerInventory, ServerRecord, SnapshotRecord, container_name, default_name,
    is_valid_name, new_id,
};
use crate::orchestrator::{Orchestrator, ProvisionRequest};
use crate::reconcile::{DriftAction, LiveInventory, reconcile, reconcile_snapshots};
use crate::remote::{RemoteChannel, RemoteError};
use crate::snapshot::SnapshotManager;
use crate::store::{Store, StoreLock};
use chrono::Utc;
use gsm_cloud::{
    Address, CloudProvider, PollConfig, ProviderError, ProviderFactory, RetryConfig, tags,
    with_retry,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Knobs shared by every operation
#[derive(Debug, Clone)]
pub struct FleetOptions {
    /// Key pair shared by all servers
    pub key_name: String,
    pub key_dir: PathBuf,
    pub ssh_user: String,

    /// Source range allowed to reach port 22
    pub ssh_cidr: String,
    pub retry: RetryConfig,
    pub poll: PollConfig,
    pub lock_timeout: Duration,
}

impl FleetOptions {
    /// Private key the remote channel authenticates with
    pub fn key_path(&self) -> PathBuf {
        self.key_dir.join(format!("{}.pem", self.key_name))
    }

    pub fn from_settings(settings: &gsm_config::Settings) -> Self {
        Self {
            key_name: settings.key_name.clone(),
            key_dir: settings.key_dir(),
            ssh_user: settings.ssh_user.clone(),
            ssh_cidr: settings.ssh_cidr.clone(),
            retry: settings.retry_config(),
            poll: settings.poll_config(),
            lock_timeout: settings.lock_timeout(),
        }
    }
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            key_name: "gsm-key".to_string(),
            key_dir: PathBuf::from("keys"),
            ssh_user: "ec2-user".to_string(),
            ssh_cidr: "0.0.0.0/0".to_string(),
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            lock_timeout: Duration::from_secs(30),
        }
    }
}

/// Parameters of a launch
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Workload kind. May be left empty when restoring a snapshot.
    pub game: String,
    pub name: Option<String>,
    pub instance_type: Option<String>,
    pub config_file: Option<PathBuf>,

    /// Inline `KEY=VALUE` overrides, highest precedence
    pub overrides: BTreeMap<String, String>,

    /// Snapshot record to restore the data volume from
    pub from_snapshot: Option<String>,
    pub pin: bool,
}

impl LaunchRequest {
    pub fn new(game: impl Into<String>) -> Self {
        Self {
            game: game.into(),
            ..Default::default()
        }
    }
}

/// Result of an operation that reconciled before answering
#[derive(Debug, Clone)]
pub struct Reconciled<T> {
    pub value: T,

    /// Corrections applied to the store on the way
    pub drift: Vec<DriftAction>,
}

pub struct Fleet {
    store: Store,
    catalog: Catalog,
    orchestrator: Orchestrator,
    regions: Option<Arc<dyn ProviderFactory>>,
}

impl Fleet {
    pub fn new(
        store: Store,
        catalog: Catalog,
        provider: Arc<dyn CloudProvider>,
        remote: Arc<dyn RemoteChannel>,
        options: FleetOptions,
    ) -> Self {
        Self {
            store,
            catalog,
            orchestrator: Orchestrator::new(provider, remote, options),
            regions: None,
        }
    }

    /// Reach records of other regions through `regions`
    ///
    /// Without it, records of other regions are neither reconciled nor
    /// operated on.
    pub fn with_regions(mut self, regions: Arc<dyn ProviderFactory>) -> Self {
        self.regions = Some(regions);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn region(&self) -> &str {
        self.orchestrator.provider().region()
    }

    /// Provider scoped to `region`
    async fn provider_in(&self, region: &str) -> Result<Arc<dyn CloudProvider>> {
        if region == self.region() {
            return Ok(self.orchestrator.provider_handle());
        }
        let regions = self.regions.as_ref().ok_or_else(|| {
            GsmError::provider(
                "reach",
                "region",
                region,
                ProviderError::InvalidConfig(format!(
                    "no provider for region {}; rerun with --region {}",
                    region, region
                )),
            )
        })?;
        regions
            .for_region(region)
            .await
            .map_err(|e| GsmError::provider("reach", "region", region, e))
    }

    /// Orchestrator working in `region`
    async fn orchestrator_in(&self, region: &str) -> Result<Orchestrator> {
        if region == self.region() {
            return Ok(self.orchestrator.clone());
        }
        Ok(self.orchestrator.with_provider(self.provider_in(region).await?))
    }

    async fn lock(&self) -> Result<StoreLock> {
        Ok(self
            .store
            .lock(self.orchestrator.options().lock_timeout)
            .await?)
    }

    /// Launch a new server, or a clone when `from_snapshot` is set
    #[tracing::instrument(skip(self, request), fields(game = %request.game))]
    pub async fn launch(&self, request: &LaunchRequest) -> Result<Reconciled<ServerRecord>> {
        let lock = self.lock().await?;

        // everything local first: a bad store or bad input never reaches the provider
        let servers = lock.load_servers().await?;
        let snapshot = match request.from_snapshot.as_deref() {
            Some(query) => Some(lock.load_snapshots().await?.find(query)?.clone()),
            None => None,
        };
        let game = match &snapshot {
            Some(snapshot) if request.game.is_empty() => snapshot.game.as_str(),
            _ => request.game.as_str(),
        };
        let definition = self.catalog.require(game)?;
        if let Some(snapshot) = &snapshot {
            if snapshot.region != self.region() {
                return Err(ValidationError::SnapshotRegionMismatch {
                    snapshot: snapshot.id.clone(),
                    region: snapshot.region.clone(),
                    current: self.region().to_string(),
                }
                .into());
            }
            if snapshot.game != definition.name {
                return Err(ValidationError::SnapshotWorkloadMismatch {
                    snapshot: snapshot.id.clone(),
                    found: snapshot.game.clone(),
                    requested: definition.name.clone(),
                }
                .into());
            }
        }
        let effective = effective_config(definition, request, snapshot.as_ref())?;

        let id = new_id();
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| default_name(&definition.name, &id));
        if !is_valid_name(&name) {
            return Err(ValidationError::InvalidName(name).into());
        }

        let (mut servers, drift) = self.sync_servers(&lock, servers).await?;
        if servers.name_taken(&name) {
            return Err(ConflictError::DuplicateName(name).into());
        }

        let container = container_name(&definition.name, &id);
        let launch = definition.launch_command_spec(&container, &effective);
        let ports: Vec<String> = definition.expected_ports().iter().map(|p| p.spec()).collect();
        let launched_at = Utc::now();
        let request_tags = tags::tags([
            (tags::ID, id.as_str()),
            (tags::GAME, definition.name.as_str()),
            (tags::NAME, name.as_str()),
            (tags::DISPLAY_NAME, name.as_str()),
        ]);
        let instance_tags = tags::tags([
            (tags::PORTS, ports.join(",").as_str()),
            (tags::CONTAINER_NAME, container.as_str()),
            (tags::LAUNCH_TIME, launched_at.to_rfc3339().as_str()),
        ]);

        let resources = self
            .orchestrator
            .provision(&ProvisionRequest {
                definition,
                server_id: &id,
                name: &name,
                instance_type: request.instance_type.as_deref(),
                from_snapshot: snapshot.as_ref().map(|s| s.snapshot_id.as_str()),
                pin_address: request.pin,
                launch: &launch,
                tags: request_tags,
                instance_tags,
            })
            .await?;

        let record = ServerRecord {
            id,
            name,
            game: definition.name.clone(),
            status: ServerStatus::Provisioning
                .apply(Verb::Launch)
                .unwrap_or(ServerStatus::Running),
            instance_id: Some(resources.instance_id),
            security_group_id: Some(resources.security_group_id),
            volume_id: Some(resources.volume_id),
            allocation_id: resources.allocation_id,
            public_ip: resources.public_ip,
            region: self.region().to_string(),
            ports: definition.expected_ports().to_vec(),
            container_name: container,
            config: effective,
            origin: RecordOrigin::Launched,
            created_at: launched_at,
            last_reconciled_at: Some(launched_at),
        };
        servers.insert(record.clone());
        lock.save_servers(&servers).await?;
        tracing::info!(server = %record.name, id = %record.id, "Server launched");

        Ok(Reconciled {
            value: record,
            drift,
        })
    }

    /// Launch a clone whose data volume starts as a copy of `snapshot`
    pub async fn restore_snapshot(
        &self,
        snapshot: &str,
        request: &LaunchRequest,
    ) -> Result<Reconciled<ServerRecord>> {
        let request = LaunchRequest {
            from_snapshot: Some(snapshot.to_string()),
            ..request.clone()
        };
        self.launch(&request).await
    }

    /// Stop the instance; identifiers and the data volume are kept
    #[tracing::instrument(skip(self))]
    pub async fn pause(&self, query: &str) -> Result<ServerRecord> {
        let lock = self.lock().await?;
        let mut servers = lock.load_servers().await?;
        let mut record = servers.find(query)?.clone();
        let next = transition(&record, Verb::Pause)?;
        let instance_id = instance_of(&record)?;
        let orchestrator = self.orchestrator_in(&record.region).await?;

        if record.status == ServerStatus::Running {
            match self.target(&record) {
                Some(target) => {
                    if let Err(e) = orchestrator
                        .remote()
                        .stop_workload(&target, &record.container_name)
                        .await
                    {
                        tracing::warn!("Could not stop workload before pausing: {}", e);
                    }
                }
                None => tracing::warn!("No address for '{}', pausing without stopping workload", record.name),
            }
        }
        orchestrator.stop_instance(&instance_id).await?;

        record.status = next;
        if !record.is_pinned() {
            record.public_ip = None;
        }
        servers.insert(record.clone());
        lock.save_servers(&servers).await?;
        tracing::info!(server = %record.name, "Server paused");
        Ok(record)
    }

    /// Restart a paused instance, or the workload of a container-stopped one
    ///
    /// A pinned server gets its retained allocation back.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, query: &str) -> Result<ServerRecord> {
        let lock = self.lock().await?;
        let mut servers = lock.load_servers().await?;
        let mut record = servers.find(query)?.clone();
        let next = transition(&record, Verb::Resume)?;
        let instance_id = instance_of(&record)?;
        let orchestrator = self.orchestrator_in(&record.region).await?;

        if record.status == ServerStatus::Paused {
            let live = orchestrator.start_instance(&instance_id).await?;
            record.status = next;
            record.public_ip = live.public_ip;
            servers.insert(record.clone());
            lock.save_servers(&servers).await?;

            if record.is_pinned() {
                if let Some(ip) = AddressManager::new(&orchestrator)
                    .reassociate(&record)
                    .await?
                {
                    record.public_ip = Some(ip);
                    servers.insert(record.clone());
                    lock.save_servers(&servers).await?;
                }
            }
        }

        if let Err(source) = self.start_workload(&record).await {
            record.status = ServerStatus::ContainerStopped;
            servers.insert(record.clone());
            lock.save_servers(&servers).await?;
            return Err(GsmError::Remote {
                server: record.name,
                source,
            });
        }
        if let Err(e) = orchestrator
            .provider()
            .delete_tag(&instance_id, tags::CONTAINER_STOPPED)
            .await
        {
            tracing::warn!("Could not untag {}: {}", instance_id, e);
        }

        record.status = next;
        servers.insert(record.clone());
        lock.save_servers(&servers).await?;
        tracing::info!(server = %record.name, "Server resumed");
        Ok(record)
    }

    /// Stop the workload process; the instance keeps running
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, query: &str) -> Result<ServerRecord> {
        let lock = self.lock().await?;
        let mut servers = lock.load_servers().await?;
        let mut record = servers.find(query)?.clone();
        let next = transition(&record, Verb::Stop)?;
        let instance_id = instance_of(&record)?;
        let orchestrator = self.orchestrator_in(&record.region).await?;

        let target = self.target(&record).ok_or_else(|| GsmError::Remote {
            server: record.name.clone(),
            source: RemoteError::NoAddress,
        })?;
        orchestrator
            .remote()
            .stop_workload(&target, &record.container_name)
            .await
            .map_err(|source| GsmError::Remote {
                server: record.name.clone(),
                source,
            })?;
        if let Err(e) = orchestrator
            .provider()
            .set_tag(&instance_id, tags::CONTAINER_STOPPED, "true")
            .await
        {
            tracing::warn!("Could not tag {}: {}", instance_id, e);
        }

        record.status = next;
        servers.insert(record.clone());
        lock.save_servers(&servers).await?;
        tracing::info!(server = %record.name, "Workload stopped");
        Ok(record)
    }

    /// Tear down every resource of the server and forget it
    ///
    /// Succeeds when the resources are already gone.
    #[tracing::instrument(skip(self))]
    pub async fn destroy(&self, query: &str) -> Result<ServerRecord> {
        let lock = self.lock().await?;
        let mut servers = lock.load_servers().await?;
        let record = servers.find(query)?.clone();
        transition(&record, Verb::Destroy)?;

        let group_shared = record.security_group_id.is_some()
            && servers
                .servers
                .values()
                .any(|r| r.id != record.id && r.security_group_id == record.security_group_id);
        self.orchestrator_in(&record.region)
            .await?
            .teardown(&record, !group_shared)
            .await?;

        servers.remove(&record.id);
        lock.save_servers(&servers).await?;
        tracing::info!(server = %record.name, "Server destroyed");
        Ok(record)
    }

    /// Snapshot the server's data volume
    #[tracing::instrument(skip(self))]
    pub async fn snapshot(&self, query: &str) -> Result<SnapshotRecord> {
        let lock = self.lock().await?;
        let servers = lock.load_servers().await?;
        let mut snapshots = lock.load_snapshots().await?;
        let source = servers.find(query)?;

        let orchestrator = self.orchestrator_in(&source.region).await?;
        let record = SnapshotManager::new(&orchestrator).create(source).await?;
        snapshots.insert(record.clone());
        lock.save_snapshots(&snapshots).await?;
        tracing::info!(snapshot = %record.snapshot_id, server = %source.name, "Snapshot created");
        Ok(record)
    }

    pub async fn delete_snapshot(&self, query: &str) -> Result<SnapshotRecord> {
        let lock = self.lock().await?;
        let mut snapshots = lock.load_snapshots().await?;
        let record = snapshots.find(query)?.clone();

        let orchestrator = self.orchestrator_in(&record.region).await?;
        SnapshotManager::new(&orchestrator).delete(&record).await?;
        snapshots.snapshots.remove(&record.id);
        lock.save_snapshots(&snapshots).await?;
        Ok(record)
    }

    /// All snapshots, reconciled in every region a record names
    pub async fn list_snapshots(&self) -> Result<Reconciled<Vec<SnapshotRecord>>> {
        let lock = self.lock().await?;
        let mut snapshots = lock.load_snapshots().await?;
        let regions = self.regions_of(snapshots.snapshots.values().map(|s| s.region.as_str()));
        let now = Utc::now();

        let mut drift = Vec::new();
        for region in regions {
            let Some(provider) = self.listing_provider(&region).await? else {
                continue;
            };
            let listed = with_retry(&self.orchestrator.options().retry, "list snapshots", || {
                provider.list_snapshots()
            })
            .await;
            let live = match listed {
                Ok(live) => live,
                Err(e) if region == self.region() => {
                    return Err(GsmError::provider("list", "snapshots", region, e));
                }
                Err(e) => {
                    tracing::warn!("Snapshots in {} left unreconciled: {}", region, e);
                    continue;
                }
            };
            let (corrected, actions) = reconcile_snapshots(&snapshots, &live, &region, now);
            snapshots = corrected;
            drift.extend(actions);
        }
        lock.save_snapshots(&snapshots).await?;

        Ok(Reconciled {
            value: snapshots.snapshots.into_values().collect(),
            drift,
        })
    }

    /// Pin an elastic address to the server
    #[tracing::instrument(skip(self))]
    pub async fn pin(&self, query: &str, allocation: Option<&str>) -> Result<(ServerRecord, Address)> {
        let lock = self.lock().await?;
        let mut servers = lock.load_servers().await?;
        let mut record = servers.find(query)?.clone();
        instance_of(&record)?;

        let orchestrator = self.orchestrator_in(&record.region).await?;
        let address = AddressManager::new(&orchestrator)
            .pin(&record, &servers, allocation)
            .await?;

        record.allocation_id = Some(address.allocation_id.clone());
        record.public_ip = Some(address.public_ip.clone());
        servers.insert(record.clone());
        lock.save_servers(&servers).await?;
        tracing::info!(server = %record.name, allocation = %address.allocation_id, "Address pinned");
        Ok((record, address))
    }

    /// Release the server's pinned address. Requires `confirm`.
    #[tracing::instrument(skip(self))]
    pub async fn unpin(&self, query: &str, confirm: bool) -> Result<ServerRecord> {
        let lock = self.lock().await?;
        let mut servers = lock.load_servers().await?;
        let mut record = servers.find(query)?.clone();
        let orchestrator = self.orchestrator_in(&record.region).await?;

        AddressManager::new(&orchestrator)
            .unpin(&record, confirm)
            .await?;

        record.allocation_id = None;
        record.public_ip = match record.instance_id.as_deref() {
            Some(instance_id) if record.status.is_instance_running() => {
                let provider = orchestrator.provider();
                match with_retry(&orchestrator.options().retry, "describe instance", || {
                    provider.describe_instance(instance_id)
                })
                .await
                {
                    Ok(live) => live.public_ip,
                    Err(e) => {
                        tracing::warn!("Could not refresh address of {}: {}", instance_id, e);
                        None
                    }
                }
            }
            _ => None,
        };
        servers.insert(record.clone());
        lock.save_servers(&servers).await?;
        Ok(record)
    }

    /// All servers, reconciled against the provider first
    pub async fn list(&self) -> Result<Reconciled<Vec<ServerRecord>>> {
        let lock = self.lock().await?;
        let local = lock.load_servers().await?;
        let (servers, drift) = self.sync_servers(&lock, local).await?;
        Ok(Reconciled {
            value: servers.servers.into_values().collect(),
            drift,
        })
    }

    /// One server, reconciled against the provider first
    pub async fn info(&self, query: &str) -> Result<Reconciled<ServerRecord>> {
        let lock = self.lock().await?;
        let local = lock.load_servers().await?;
        let (servers, drift) = self.sync_servers(&lock, local).await?;
        Ok(Reconciled {
            value: servers.find(query)?.clone(),
            drift,
        })
    }

    /// System-tagged addresses and the server holding each
    pub async fn list_addresses(&self) -> Result<Reconciled<Vec<AddressView>>> {
        let lock = self.lock().await?;
        let local = lock.load_servers().await?;
        let (servers, drift) = self.sync_servers(&lock, local).await?;
        let value = AddressManager::new(&self.orchestrator)
            .list(&servers)
            .await?;
        Ok(Reconciled { value, drift })
    }

    /// Reconcile `local` against the provider and persist the result
    ///
    /// Lists the fleet's own region and every region a record names. Only
    /// listing calls reach the provider. A failed listing of the own region
    /// fails the call; records of another region whose listing fails are
    /// left as they are. The corrected inventory is written in one store
    /// write.
    async fn sync_servers(
        &self,
        lock: &StoreLock,
        local: ServerInventory,
    ) -> Result<(ServerInventory, Vec<DriftAction>)> {
        let regions = self.regions_of(local.servers.values().map(|r| r.region.as_str()));
        let now = Utc::now();

        let mut corrected = local;
        let mut drift = Vec::new();
        for region in regions {
            let Some(provider) = self.listing_provider(&region).await? else {
                continue;
            };
            let live = match self.live_inventory(provider.as_ref()).await {
                Ok(live) => live,
                Err(e) if region == self.region() => {
                    return Err(GsmError::provider("list", "instances", region, e));
                }
                Err(e) => {
                    tracing::warn!("Servers in {} left unreconciled: {}", region, e);
                    continue;
                }
            };
            let (next, actions) = reconcile(&corrected, &live, &self.catalog, &region, now);
            corrected = next;
            drift.extend(actions);
        }

        lock.save_servers(&corrected).await?;
        Ok((corrected, drift))
    }

    async fn live_inventory(&self, provider: &dyn CloudProvider) -> gsm_cloud::Result<LiveInventory> {
        let retry = &self.orchestrator.options().retry;

        let instances = with_retry(retry, "list instances", || provider.list_instances()).await?;
        let addresses = match with_retry(retry, "list addresses", || provider.list_addresses()).await
        {
            Ok(addresses) => Some(addresses),
            Err(e) => {
                tracing::warn!(
                    region = provider.region(),
                    "Address listing unavailable, keeping pinned addresses: {}",
                    e
                );
                None
            }
        };
        Ok(LiveInventory {
            instances,
            addresses,
        })
    }

    /// The fleet's own region plus every region in `named`, own region first
    fn regions_of<'a>(&self, named: impl Iterator<Item = &'a str>) -> Vec<String> {
        let others: BTreeSet<&str> = named.filter(|r| *r != self.region()).collect();
        std::iter::once(self.region())
            .chain(others)
            .map(str::to_string)
            .collect()
    }

    /// Provider to list `region` with, or `None` when other regions are out
    /// of reach
    async fn listing_provider(&self, region: &str) -> Result<Option<Arc<dyn CloudProvider>>> {
        if region != self.region() && self.regions.is_none() {
            tracing::debug!("No provider for {}, leaving its records untouched", region);
            return Ok(None);
        }
        match self.provider_in(region).await {
            Ok(provider) => Ok(Some(provider)),
            Err(e) if region == self.region() => Err(e),
            Err(e) => {
                tracing::warn!("{}", e);
                Ok(None)
            }
        }
    }

    async fn start_workload(&self, record: &ServerRecord) -> std::result::Result<(), RemoteError> {
        let target = self.target(record).ok_or(RemoteError::NoAddress)?;
        self.orchestrator
            .remote()
            .start_workload(&target, &record.container_name)
            .await
    }

    fn target(&self, record: &ServerRecord) -> Option<crate::remote::RemoteTarget> {
        self.orchestrator.target(record.public_ip.as_deref(), None)
    }
}

fn effective_config(
    definition: &WorkloadDefinition,
    request: &LaunchRequest,
    snapshot: Option<&SnapshotRecord>,
) -> Result<EffectiveConfig> {
    let file = match (snapshot, request.config_file.as_deref()) {
        (Some(_), Some(_)) => return Err(ValidationError::SnapshotWithConfigFile.into()),
        (Some(snapshot), None) => Some(snapshot.config.clone()),
        (None, Some(path)) => Some(config::load_config_file(path)?),
        (None, None) => None,
    };
    let inline = (!request.overrides.is_empty()).then_some(&request.overrides);

    let mut effective = config::resolve(definition, file.as_ref(), inline)?;
    // a clone keeps the secrets its source was launched with
    if snapshot.is_none() {
        config::fill_secrets(definition, &mut effective, inline);
    }
    Ok(effective)
}

fn transition(record: &ServerRecord, verb: Verb) -> Result<ServerStatus> {
    record.status.apply(verb).ok_or_else(|| {
        ConflictError::InvalidTransition {
            server: record.name.clone(),
            from: record.status,
            verb,
        }
        .into()
    })
}

fn instance_of(record: &ServerRecord) -> Result<String> {
    record
        .instance_id
        .clone()
        .ok_or_else(|| GsmError::not_found("instance", &record.name))
}
