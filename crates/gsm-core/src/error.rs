use crate::lifecycle::{ServerStatus, Verb};
use crate::remote::RemoteError;
use gsm_cloud::ProviderError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by every lifecycle operation
#[derive(Error, Debug)]
pub enum GsmError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("Teardown of {resource} {id} failed: {source}")]
    Teardown {
        resource: &'static str,
        id: String,
        #[source]
        source: ProviderError,
    },

    /// Provider call failed after retries (transient errors included)
    #[error("{operation} failed for {resource} {id}: {source}")]
    Provider {
        operation: &'static str,
        resource: &'static str,
        id: String,
        #[source]
        source: ProviderError,
    },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Local state is unusable. Raised before any cloud mutation.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Remote command on server '{server}' failed: {source}")]
    Remote {
        server: String,
        #[source]
        source: RemoteError,
    },
}

impl GsmError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn provider(
        operation: &'static str,
        resource: &'static str,
        id: impl Into<String>,
        source: ProviderError,
    ) -> Self {
        Self::Provider {
            operation,
            resource,
            id: id.into(),
            source,
        }
    }

    /// Provider kept failing transiently until retries ran out
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider { source, .. } if source.is_transient())
    }
}

/// Bad or missing configuration. Never touches the provider.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error(
        "Missing required config key '{key}' for {workload}.\n\
        Provide it inline:     --config {key}=VALUE\n\
        Or in a config file:   --config-file {workload}.cfg (one KEY=VALUE per line)"
    )]
    MissingRequiredConfig { key: String, workload: String },

    #[error("{path}:{line}: expected KEY=VALUE, found '{content}'")]
    InvalidConfigLine {
        path: PathBuf,
        line: usize,
        content: String,
    },

    #[error("Invalid override '{0}': expected KEY=VALUE")]
    InvalidOverride(String),

    #[error("Cannot read config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown workload '{0}'")]
    UnknownWorkload(String),

    #[error("Invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error("Invalid server name '{0}': use letters, digits and '-'")]
    InvalidName(String),

    #[error("{0}")]
    ConfirmationRequired(String),

    #[error(
        "Cannot combine --config-file with a snapshot restore; \
        the snapshot's saved config is used instead (inline --config still applies)"
    )]
    SnapshotWithConfigFile,

    #[error("Snapshot {snapshot} is in {region}; restore it with --region {region} (current region is {current})")]
    SnapshotRegionMismatch {
        snapshot: String,
        region: String,
        current: String,
    },

    #[error("Snapshot {snapshot} holds a {found} server, not {requested}")]
    SnapshotWorkloadMismatch {
        snapshot: String,
        found: String,
        requested: String,
    },
}

/// Operation conflicts with current state
#[derive(Error, Debug)]
pub enum ConflictError {
    #[error("A server named '{0}' already exists")]
    DuplicateName(String),

    #[error("Server '{server}' already has pinned address {allocation}")]
    AlreadyPinned { server: String, allocation: String },

    #[error("Address {allocation} is already pinned to server '{holder}'")]
    AlreadyPinnedElsewhere { allocation: String, holder: String },

    #[error("Server '{server}' does not have a pinned address")]
    NotPinned { server: String },

    #[error("Cannot {verb} server '{server}' while it is {from}")]
    InvalidTransition {
        server: String,
        from: ServerStatus,
        verb: Verb,
    },

    #[error("'{query}' matches several servers: {}", matches.join(", "))]
    Ambiguous { query: String, matches: Vec<String> },
}

/// Step of the provisioning sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    KeyPair,
    SecurityGroup,
    Volume,
    Instance,
    WaitReady,
    AttachVolume,
    Address,
    Workload,
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionStep::KeyPair => write!(f, "key pair"),
            ProvisionStep::SecurityGroup => write!(f, "security group"),
            ProvisionStep::Volume => write!(f, "data volume"),
            ProvisionStep::Instance => write!(f, "instance launch"),
            ProvisionStep::WaitReady => write!(f, "instance readiness"),
            ProvisionStep::AttachVolume => write!(f, "volume attachment"),
            ProvisionStep::Address => write!(f, "elastic address"),
            ProvisionStep::Workload => write!(f, "workload deployment"),
        }
    }
}

/// A provisioning step failed; earlier steps were compensated
#[derive(Error, Debug)]
#[error(
    "Provisioning failed at step '{step}': {source} (rolled back {} resource(s){})",
    rolled_back.len(),
    format_rollback_failures(rollback_failures)
)]
pub struct ProvisionError {
    pub step: ProvisionStep,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,

    /// Compensations that ran, most recent first
    pub rolled_back: Vec<String>,

    /// Compensations that failed; these resources may be orphaned
    pub rollback_failures: Vec<String>,
}

fn format_rollback_failures(failures: &[String]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        format!("; rollback failed for: {}", failures.join(", "))
    }
}

/// Local store errors. Fatal for the command.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("State file {path} is corrupted: {source}")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("State file {path} version {found} is newer than supported version {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("State is locked by {holder} since {since}")]
    Locked { holder: String, since: String },

    #[error("Refusing to persist inconsistent state: {0}")]
    Invariant(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GsmError>;
