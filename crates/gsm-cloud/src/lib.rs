//! gsm Cloud Infrastructure
//!
//! This crate provides the cloud provider abstraction used by gsm to
//! provision game-server workloads: one compute instance, one data volume,
//! one ingress group and an optional elastic address per server.
//!
//! # Supported Providers
//!
//! - **AWS**: EC2, EBS, Elastic IPs (`gsm-cloud-aws`)
//! - **In-memory**: deterministic fake with fault injection ([`memory`])
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   gsm CLI                        │
//! │        (launch / pause / resume / destroy)       │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                  gsm-core                        │
//! │  orchestrator · lifecycle · reconciler · store   │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                 gsm-cloud                        │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │          Provider Abstraction             │   │
//! │  │  trait CloudProvider { ... }              │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐            │
//! │  │ Retry / Poll │  │  In-memory   │            │
//! │  └──────────────┘  └──────────────┘            │
//! └───────┬─────────────────────────────────────────┘
//!         │
//! ┌───────▼───────┐
//! │      aws      │
//! │   provider    │
//! └───────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod provider;
pub mod retry;
pub mod tags;

// Re-exports
pub use error::{ProviderError, Result};
pub use memory::{InMemoryProvider, InMemoryRegions, Operation, ResourceCounts};
pub use provider::{
    Address, AddressSpec, CloudProvider, InstanceSpec, KeyPair, LiveInstance, PollConfig,
    PortRule, PowerState, Protocol, ProviderFactory, RetryConfig, SecurityGroup,
    SecurityGroupSpec, Snapshot, SnapshotState, Tags, Volume, VolumeSpec, VolumeState,
};
pub use retry::{wait_until, with_retry};
