//! Remote-command channel seam
//!
//! The core never talks to an instance directly. After the resource set is
//! ready it hands a [`LaunchCommand`] to a [`RemoteChannel`]; the CLI
//! provides an SSH implementation, tests provide a recording fake.

use async_trait::async_trait;
use gsm_cloud::PortRule;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Host directory where the data volume is mounted on every instance
pub const DATA_MOUNT: &str = "/srv/gsm";

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Command failed with exit code {code}: {output}")]
    CommandFailed { code: i32, output: String },

    #[error("Instance has no public address")]
    NoAddress,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where and how to reach an instance
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,
    pub key_path: Option<PathBuf>,
}

/// Host path bound into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
}

/// File written into the container before it first starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub path: String,
    pub contents: String,
}

/// Everything needed to start a workload container
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchCommand {
    pub container_name: String,
    pub image: String,
    pub ports: Vec<PortRule>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub extra_args: Vec<String>,
    pub config_file: Option<ConfigFile>,
}

impl LaunchCommand {
    /// Arguments following `docker run -d` / `docker create`, unquoted
    pub fn container_args(&self) -> Vec<String> {
        let mut args = vec!["--name".to_string(), self.container_name.clone()];
        for port in &self.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}/{}", port.port, port.port, port.protocol));
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for mount in &self.volumes {
            args.push("-v".to_string());
            args.push(format!("{}:{}", mount.host_path, mount.container_path));
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(self.image.clone());
        args
    }
}

/// Runs container commands on a provisioned instance
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Pull the image and start the container described by `command`
    async fn deploy_workload(
        &self,
        target: &RemoteTarget,
        command: &LaunchCommand,
    ) -> Result<(), RemoteError>;

    async fn stop_workload(&self, target: &RemoteTarget, container: &str)
    -> Result<(), RemoteError>;

    async fn start_workload(
        &self,
        target: &RemoteTarget,
        container: &str,
    ) -> Result<(), RemoteError>;
}
