//! gsm AWS Provider
//!
//! EC2 implementation of [`gsm_cloud::CloudProvider`].
//!
//! # Features
//!
//! - Instances on Amazon Linux 2023 in the region's default VPC
//! - gp3 data volumes and volume snapshots
//! - Per-game security groups with SSH restricted to a configurable range
//! - Elastic IP allocation and association
//! - Resources discovered through the `gsm:id` tag
//!
//! # Requirements
//!
//! Credentials are resolved by the standard AWS chain (environment,
//! `~/.aws/credentials`, SSO, instance profile). The account needs a default
//! VPC in the target region.
//!
//! # Example
//!
//! ```ignore
//! use gsm_cloud::CloudProvider;
//! use gsm_cloud_aws::AwsProvider;
//!
//! let provider = AwsProvider::new("eu-west-2", "keys").await;
//! let instances = provider.list_instances().await?;
//! ```

mod error;
mod provider;

pub use provider::{AwsProvider, AwsRegions};
