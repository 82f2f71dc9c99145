//! gsm core
//!
//! Provisioning, lifecycle and reconciliation of game servers on cloud
//! instances. Front ends drive everything through [`Fleet`]:
//!
//! ```text
//! Fleet ─┬─ config resolver ── catalog
//!        ├─ orchestrator ───── CloudProvider / RemoteChannel
//!        ├─ lifecycle guard
//!        ├─ reconciler (pure)
//!        ├─ snapshot manager
//!        ├─ address manager
//!        └─ store (locked documents)
//! ```

pub mod address;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fleet;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod reconcile;
pub mod remote;
pub mod snapshot;
pub mod store;

pub use address::{AddressManager, AddressView};
pub use catalog::{Catalog, Runtime, WorkloadDefinition};
pub use config::EffectiveConfig;
pub use error::{
    ConflictError, GsmError, ProvisionError, ProvisionStep, Result, StoreError, ValidationError,
};
pub use fleet::{Fleet, FleetOptions, LaunchRequest, Reconciled};
pub use lifecycle::{ServerStatus, Verb};
pub use model::{RecordOrigin, ServerInventory, ServerRecord, SnapshotInventory, SnapshotRecord};
pub use orchestrator::{Orchestrator, ProvisionRequest, ResourceSet};
pub use reconcile::{DriftAction, LiveInventory, reconcile, reconcile_snapshots};
pub use remote::{LaunchCommand, RemoteChannel, RemoteError, RemoteTarget};
pub use snapshot::SnapshotManager;
pub use store::{Store, StoreLock};
