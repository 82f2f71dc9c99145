//! Resource orchestration
//!
//! Provisioning runs a fixed sequence of steps. Every step that creates
//! something pushes its compensating action; when a later step fails the
//! stack is popped and each compensation runs, newest first, before the
//! error is returned.
//!
//! ```text
//!  key pair → security group → volume → instance → wait ready
//!           → attach volume → address (optional) → deploy workload
//! ```

use crate::catalog::WorkloadDefinition;
use crate::error::{GsmError, ProvisionError, ProvisionStep, Result};
use crate::fleet::FleetOptions;
use crate::model::ServerRecord;
use crate::remote::{DATA_MOUNT, LaunchCommand, RemoteChannel, RemoteError, RemoteTarget};
use gsm_cloud::{
    AddressSpec, CloudProvider, InstanceSpec, LiveInstance, PowerState, ProviderError,
    SecurityGroupSpec, Tags, VolumeSpec, VolumeState, tags, wait_until, with_retry,
};
use std::path::PathBuf;
use std::sync::Arc;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type StepFailure = (ProvisionStep, BoxError);

fn at<E: Into<BoxError>>(step: ProvisionStep) -> impl FnOnce(E) -> StepFailure {
    move |e| (step, e.into())
}

/// Name of the ingress group shared by every server of a workload kind
pub fn security_group_name(kind: &str) -> String {
    format!("gsm-{}-sg", kind)
}

/// Idempotency token for one creation step of one server
///
/// Stable across retries of the step, distinct across servers.
pub fn client_token(server_id: &str, step: &str) -> String {
    format!("gsm-{}-{}", server_id, step)
}

/// Cloud-init script: mount the data volume, then start Docker
///
/// Docker only comes up once the volume is mounted, so a channel that waits
/// for the Docker daemon also waits for the data directory.
pub fn bootstrap_script() -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail
dnf install -y docker
mkdir -p {mount}
root_disk=$(lsblk -no PKNAME "$(findmnt -no SOURCE /)")
dev=""
for _ in $(seq 1 120); do
  dev=$(lsblk -dpno NAME,TYPE | awk '$2 == "disk" {{ print $1 }}' | grep -v "$root_disk" | head -n1 || true)
  [ -n "$dev" ] && break
  sleep 5
done
[ -n "$dev" ]
blkid "$dev" || mkfs -t xfs "$dev"
mount "$dev" {mount}
echo "$dev {mount} xfs defaults,nofail 0 2" >> /etc/fstab
systemctl enable --now docker
"#,
        mount = DATA_MOUNT
    )
}

/// Everything needed to provision one server
#[derive(Debug, Clone)]
pub struct ProvisionRequest<'a> {
    pub definition: &'a WorkloadDefinition,
    pub server_id: &'a str,
    pub name: &'a str,

    /// Overrides the definition's default instance type
    pub instance_type: Option<&'a str>,

    /// Provider snapshot to restore the data volume from
    pub from_snapshot: Option<&'a str>,
    pub pin_address: bool,
    pub launch: &'a LaunchCommand,

    /// `gsm:*` tags shared by every resource of the server
    pub tags: Tags,

    /// Extra tags for the instance only
    pub instance_tags: Tags,
}

/// Provider handles produced by a successful provisioning
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSet {
    pub key_name: String,
    pub key_path: Option<PathBuf>,
    pub security_group_id: String,
    pub volume_id: String,
    pub instance_id: String,
    pub allocation_id: Option<String>,
    pub public_ip: Option<String>,
}

#[derive(Debug)]
enum Compensation {
    DeleteKeyPair(String),
    DeleteSecurityGroup(String),
    DeleteVolume(String),
    TerminateInstance(String),
    ReleaseAddress(String),
    DisassociateAddress(String),
}

impl std::fmt::Display for Compensation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compensation::DeleteKeyPair(name) => write!(f, "key pair {}", name),
            Compensation::DeleteSecurityGroup(id) => write!(f, "security group {}", id),
            Compensation::DeleteVolume(id) => write!(f, "volume {}", id),
            Compensation::TerminateInstance(id) => write!(f, "instance {}", id),
            Compensation::ReleaseAddress(id) => write!(f, "address {}", id),
            Compensation::DisassociateAddress(id) => write!(f, "association of {}", id),
        }
    }
}

/// Treat "already gone" as success for destructive calls
fn absent_ok(result: gsm_cloud::Result<()>, what: &str) -> gsm_cloud::Result<()> {
    match result {
        Err(e) if e.is_not_found() => {
            tracing::warn!("{} already absent", what);
            Ok(())
        }
        other => other,
    }
}

/// Creates and destroys the resource set backing one server
#[derive(Clone)]
pub struct Orchestrator {
    provider: Arc<dyn CloudProvider>,
    remote: Arc<dyn RemoteChannel>,
    options: FleetOptions,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        remote: Arc<dyn RemoteChannel>,
        options: FleetOptions,
    ) -> Self {
        Self {
            provider,
            remote,
            options,
        }
    }

    pub fn provider(&self) -> &dyn CloudProvider {
        self.provider.as_ref()
    }

    pub fn provider_handle(&self) -> Arc<dyn CloudProvider> {
        self.provider.clone()
    }

    /// Same channel and options, different provider
    pub fn with_provider(&self, provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            provider,
            remote: self.remote.clone(),
            options: self.options.clone(),
        }
    }

    pub fn remote(&self) -> &dyn RemoteChannel {
        self.remote.as_ref()
    }

    pub fn options(&self) -> &FleetOptions {
        &self.options
    }

    /// Remote-channel target for a server's current address
    pub fn target(&self, public_ip: Option<&str>, key_path: Option<PathBuf>) -> Option<RemoteTarget> {
        Some(RemoteTarget {
            host: public_ip?.to_string(),
            user: self.options.ssh_user.clone(),
            key_path: key_path.or_else(|| Some(self.options.key_path())),
        })
    }

    /// Provision a complete resource set, rolling back on failure
    #[tracing::instrument(skip(self, request), fields(server = %request.name, game = %request.definition.name))]
    pub async fn provision(&self, request: &ProvisionRequest<'_>) -> Result<ResourceSet> {
        let mut saga = Vec::new();
        match self.run_steps(request, &mut saga).await {
            Ok(resources) => {
                tracing::info!(instance = %resources.instance_id, "Resource set ready");
                Ok(resources)
            }
            Err((step, source)) => {
                tracing::warn!("Provisioning failed at {}: {}", step, source);
                Err(self.rollback(step, source, saga).await)
            }
        }
    }

    async fn run_steps(
        &self,
        request: &ProvisionRequest<'_>,
        saga: &mut Vec<Compensation>,
    ) -> std::result::Result<ResourceSet, StepFailure> {
        let provider = self.provider.as_ref();
        let retry = &self.options.retry;
        let definition = request.definition;

        // 1. key pair
        let key_name = self.options.key_name.as_str();
        let key_pair = with_retry(retry, "ensure key pair", || {
            provider.ensure_key_pair(key_name)
        })
        .await
        .map_err(at(ProvisionStep::KeyPair))?;
        if key_pair.created {
            saga.push(Compensation::DeleteKeyPair(key_pair.name.clone()));
        }

        // 2. ingress group
        let group_spec = SecurityGroupSpec {
            name: security_group_name(&definition.name),
            description: format!("gsm {} game servers", definition.name),
            ports: definition.expected_ports().to_vec(),
            ssh_cidr: self.options.ssh_cidr.clone(),
            tags: tags::tags([(tags::GAME, definition.name.as_str())]),
        };
        let group = with_retry(retry, "ensure security group", || {
            provider.ensure_security_group(&group_spec)
        })
        .await
        .map_err(at(ProvisionStep::SecurityGroup))?;
        if group.created {
            saga.push(Compensation::DeleteSecurityGroup(group.id.clone()));
        }

        // 3. data volume
        let volume_spec = VolumeSpec {
            size_gb: definition.disk_size_gb,
            snapshot_id: request.from_snapshot.map(str::to_string),
            availability_zone: None,
            tags: request.tags.clone(),
            client_token: Some(client_token(request.server_id, "volume")),
        };
        let volume = with_retry(retry, "create volume", || {
            provider.create_volume(&volume_spec)
        })
        .await
        .map_err(at(ProvisionStep::Volume))?;
        saga.push(Compensation::DeleteVolume(volume.id.clone()));
        self.wait_volume_available(&volume.id)
            .await
            .map_err(at(ProvisionStep::Volume))?;

        // 4. instance, in the volume's zone so the volume can attach
        let mut instance_tags = request.tags.clone();
        instance_tags.extend(request.instance_tags.clone());
        instance_tags.insert(tags::SECURITY_GROUP.to_string(), group.id.clone());
        instance_tags.insert(tags::VOLUME.to_string(), volume.id.clone());
        let instance_spec = InstanceSpec {
            instance_type: request
                .instance_type
                .unwrap_or(&definition.default_instance_type)
                .to_string(),
            min_ram_gb: definition.min_ram_gb,
            key_name: key_pair.name.clone(),
            security_group_id: group.id.clone(),
            availability_zone: volume.availability_zone.clone(),
            user_data: Some(bootstrap_script()),
            tags: instance_tags,
            client_token: Some(client_token(request.server_id, "instance")),
        };
        let instance_id = with_retry(retry, "launch instance", || {
            provider.launch_instance(&instance_spec)
        })
        .await
        .map_err(at(ProvisionStep::Instance))?;
        saga.push(Compensation::TerminateInstance(instance_id.clone()));
        tracing::info!(instance = %instance_id, "Instance launched");

        // 5. readiness
        let live = self
            .wait_running(&instance_id)
            .await
            .map_err(at(ProvisionStep::WaitReady))?;

        // 6. attach
        with_retry(retry, "attach volume", || {
            provider.attach_volume(&volume.id, &instance_id)
        })
        .await
        .map_err(at(ProvisionStep::AttachVolume))?;

        // 7. elastic address
        let mut allocation_id = None;
        let mut public_ip = live.public_ip;
        if request.pin_address {
            let address_spec = AddressSpec {
                tags: request.tags.clone(),
                client_token: Some(client_token(request.server_id, "address")),
            };
            let address = with_retry(retry, "allocate address", || {
                provider.allocate_address(&address_spec)
            })
            .await
            .map_err(at(ProvisionStep::Address))?;
            saga.push(Compensation::ReleaseAddress(address.allocation_id.clone()));

            with_retry(retry, "associate address", || {
                provider.associate_address(&address.allocation_id, &instance_id)
            })
            .await
            .map_err(at(ProvisionStep::Address))?;
            saga.push(Compensation::DisassociateAddress(address.allocation_id.clone()));

            with_retry(retry, "tag instance", || {
                provider.set_tag(&instance_id, tags::ADDRESS_ALLOCATION, &address.allocation_id)
            })
            .await
            .map_err(at(ProvisionStep::Address))?;

            public_ip = Some(address.public_ip);
            allocation_id = Some(address.allocation_id);
        }

        // 8. workload
        let target = self
            .target(public_ip.as_deref(), key_pair.private_key_path.clone())
            .ok_or_else(|| at(ProvisionStep::Workload)(RemoteError::NoAddress))?;
        self.remote
            .deploy_workload(&target, request.launch)
            .await
            .map_err(at(ProvisionStep::Workload))?;

        Ok(ResourceSet {
            key_name: key_pair.name,
            key_path: key_pair.private_key_path,
            security_group_id: group.id,
            volume_id: volume.id,
            instance_id,
            allocation_id,
            public_ip,
        })
    }

    async fn rollback(
        &self,
        step: ProvisionStep,
        source: BoxError,
        mut saga: Vec<Compensation>,
    ) -> GsmError {
        let mut rolled_back = Vec::new();
        let mut rollback_failures = Vec::new();

        while let Some(compensation) = saga.pop() {
            match self.compensate(&compensation).await {
                Ok(()) => {
                    tracing::info!("Rolled back {}", compensation);
                    rolled_back.push(compensation.to_string());
                }
                Err(e) => {
                    tracing::warn!("Rollback of {} failed: {}", compensation, e);
                    rollback_failures.push(format!("{} ({})", compensation, e));
                }
            }
        }

        ProvisionError {
            step,
            source,
            rolled_back,
            rollback_failures,
        }
        .into()
    }

    async fn compensate(&self, compensation: &Compensation) -> gsm_cloud::Result<()> {
        let provider = self.provider.as_ref();
        let retry = &self.options.retry;
        let what = compensation.to_string();

        let result = match compensation {
            Compensation::DeleteKeyPair(name) => {
                with_retry(retry, "delete key pair", || provider.delete_key_pair(name)).await
            }
            Compensation::DeleteSecurityGroup(id) => {
                with_retry(retry, "delete security group", || {
                    provider.delete_security_group(id)
                })
                .await
            }
            Compensation::DeleteVolume(id) => {
                // the delete itself reports a volume that is still attached
                if let Err(e) = self.wait_volume_detached(id).await {
                    tracing::warn!("Could not confirm {} is detached: {}", id, e);
                }
                with_retry(retry, "delete volume", || provider.delete_volume(id)).await
            }
            Compensation::TerminateInstance(id) => {
                absent_ok(
                    with_retry(retry, "terminate instance", || provider.terminate_instance(id))
                        .await,
                    &what,
                )?;
                if let Err(e) = self.wait_terminated(id).await {
                    tracing::warn!("Could not confirm termination of {}: {}", id, e);
                }
                Ok(())
            }
            Compensation::ReleaseAddress(id) => {
                with_retry(retry, "release address", || provider.release_address(id)).await
            }
            Compensation::DisassociateAddress(id) => {
                with_retry(retry, "disassociate address", || {
                    provider.disassociate_address(id)
                })
                .await
            }
        };
        absent_ok(result, &what)
    }

    /// Tear down every resource a record owns, in reverse creation order
    ///
    /// Resources that are already gone count as torn down. The key pair is
    /// shared by all servers and kept; the security group is only deleted
    /// when `delete_security_group` says no other server uses it.
    #[tracing::instrument(skip(self, record), fields(server = %record.name))]
    pub async fn teardown(&self, record: &ServerRecord, delete_security_group: bool) -> Result<()> {
        let provider = self.provider.as_ref();
        let retry = &self.options.retry;

        if let Some(allocation) = record.allocation_id.as_deref() {
            absent_ok(
                with_retry(retry, "disassociate address", || {
                    provider.disassociate_address(allocation)
                })
                .await,
                allocation,
            )
            .map_err(|source| teardown_error("address", allocation, source))?;
            absent_ok(
                with_retry(retry, "release address", || provider.release_address(allocation))
                    .await,
                allocation,
            )
            .map_err(|source| teardown_error("address", allocation, source))?;
            tracing::info!(allocation, "Released elastic address");
        }

        if let Some(instance) = record.instance_id.as_deref() {
            absent_ok(
                with_retry(retry, "terminate instance", || {
                    provider.terminate_instance(instance)
                })
                .await,
                instance,
            )
            .map_err(|source| teardown_error("instance", instance, source))?;
            self.wait_terminated(instance)
                .await
                .map_err(|source| teardown_error("instance", instance, source))?;
            tracing::info!(instance, "Terminated instance");
        }

        if let Some(volume) = record.volume_id.as_deref() {
            self.wait_volume_detached(volume)
                .await
                .map_err(|source| teardown_error("volume", volume, source))?;
            absent_ok(
                with_retry(retry, "delete volume", || provider.delete_volume(volume)).await,
                volume,
            )
            .map_err(|source| teardown_error("volume", volume, source))?;
            tracing::info!(volume, "Deleted volume");
        }

        if let Some(group) = record.security_group_id.as_deref().filter(|_| delete_security_group) {
            match absent_ok(
                with_retry(retry, "delete security group", || {
                    provider.delete_security_group(group)
                })
                .await,
                group,
            ) {
                Ok(()) => tracing::info!(group, "Deleted security group"),
                // still referenced by an instance this store does not track
                Err(ProviderError::Api { code, .. }) if code == "DependencyViolation" => {
                    tracing::warn!(group, "Security group still in use, keeping it");
                }
                Err(source) => return Err(teardown_error("security group", group, source)),
            }
        }

        Ok(())
    }

    /// Stop the instance and wait until it is stopped
    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        let provider = self.provider.as_ref();
        with_retry(&self.options.retry, "stop instance", || {
            provider.stop_instance(instance_id)
        })
        .await
        .map_err(|e| GsmError::provider("stop", "instance", instance_id, e))?;

        wait_until(
            &self.options.poll,
            &format!("instance {} to stop", instance_id),
            move || async move {
                let live = provider.describe_instance(instance_id).await?;
                Ok(live.state == PowerState::Stopped)
            },
        )
        .await
        .map_err(|e| GsmError::provider("stop", "instance", instance_id, e))
    }

    /// Start the instance and wait until it is running with an address
    pub async fn start_instance(&self, instance_id: &str) -> Result<LiveInstance> {
        let provider = self.provider.as_ref();
        with_retry(&self.options.retry, "start instance", || {
            provider.start_instance(instance_id)
        })
        .await
        .map_err(|e| GsmError::provider("start", "instance", instance_id, e))?;

        self.wait_running(instance_id)
            .await
            .map_err(|e| GsmError::provider("start", "instance", instance_id, e))
    }

    async fn wait_running(&self, instance_id: &str) -> gsm_cloud::Result<LiveInstance> {
        let provider = self.provider.as_ref();
        wait_until(
            &self.options.poll,
            &format!("instance {} to run", instance_id),
            move || async move {
                let live = provider.describe_instance(instance_id).await?;
                if live.state.is_gone() {
                    return Err(ProviderError::api(
                        "IncorrectInstanceState",
                        format!("instance {} is {}", instance_id, live.state),
                    ));
                }
                Ok(live.state == PowerState::Running && live.public_ip.is_some())
            },
        )
        .await?;

        with_retry(&self.options.retry, "describe instance", || {
            provider.describe_instance(instance_id)
        })
        .await
    }

    async fn wait_terminated(&self, instance_id: &str) -> gsm_cloud::Result<()> {
        let provider = self.provider.as_ref();
        wait_until(
            &self.options.poll,
            &format!("instance {} to terminate", instance_id),
            move || async move {
                match provider.describe_instance(instance_id).await {
                    Ok(live) => Ok(live.state == PowerState::Terminated),
                    Err(e) if e.is_not_found() => Ok(true),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }

    async fn wait_volume_available(&self, volume_id: &str) -> gsm_cloud::Result<()> {
        let provider = self.provider.as_ref();
        wait_until(
            &self.options.poll,
            &format!("volume {} to become available", volume_id),
            move || async move {
                let volume = provider.describe_volume(volume_id).await?;
                match volume.state {
                    VolumeState::Available => Ok(true),
                    VolumeState::Error => Err(ProviderError::api(
                        "VolumeError",
                        format!("volume {} entered error state", volume_id),
                    )),
                    _ => Ok(false),
                }
            },
        )
        .await
    }

    async fn wait_volume_detached(&self, volume_id: &str) -> gsm_cloud::Result<()> {
        let provider = self.provider.as_ref();
        wait_until(
            &self.options.poll,
            &format!("volume {} to detach", volume_id),
            move || async move {
                match provider.describe_volume(volume_id).await {
                    Ok(volume) => Ok(volume.state != VolumeState::InUse),
                    Err(e) if e.is_not_found() => Ok(true),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }
}

fn teardown_error(resource: &'static str, id: &str, source: ProviderError) -> GsmError {
    GsmError::Teardown {
        resource,
        id: id.to_string(),
        source,
    }
}
