//! Workload catalog
//!
//! A [`WorkloadDefinition`] describes one launchable game server kind. The
//! catalog is loaded once, validated as a whole, and never changes for the
//! lifetime of the process.

use crate::error::ValidationError;
use crate::remote::{ConfigFile, DATA_MOUNT, LaunchCommand, VolumeMount};
use gsm_cloud::{PortRule, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

const DEFAULT_DISK_SIZE_GB: u32 = 100;
const DEFAULT_AGENT_CONFIG_PATH: &str = "/data/config-lgsm";
const AGENT_DATA_PATH: &str = "/data";
const AGENT_CONFIG_FILE: &str = "common.cfg";

fn default_disk_size_gb() -> u32 {
    DEFAULT_DISK_SIZE_GB
}

fn default_agent_config_path() -> String {
    DEFAULT_AGENT_CONFIG_PATH.to_string()
}

/// How the workload runs inside the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Runtime {
    /// Plain container configured through environment variables
    Docker {
        image: String,
        #[serde(default)]
        volumes: Vec<String>,
        #[serde(default)]
        extra_args: Vec<String>,
    },

    /// LinuxGSM-style container configured through a `KEY="VALUE"` file
    Agent {
        image: String,
        server_code: String,
        #[serde(default = "default_agent_config_path")]
        config_path: String,
    },
}

impl Runtime {
    pub fn image(&self) -> &str {
        match self {
            Runtime::Docker { image, .. } | Runtime::Agent { image, .. } => image,
        }
    }

    fn container_paths(&self) -> Vec<&str> {
        match self {
            Runtime::Docker { volumes, .. } => volumes.iter().map(String::as_str).collect(),
            Runtime::Agent { .. } => vec![AGENT_DATA_PATH],
        }
    }
}

/// A launchable workload kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub ports: Vec<PortRule>,
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
    pub default_instance_type: String,
    pub min_ram_gb: u32,
    #[serde(default = "default_disk_size_gb")]
    pub disk_size_gb: u32,

    /// Keys that must be present and non-empty before launch
    #[serde(default)]
    pub required_config: Vec<String>,

    /// Keys filled with a random secret unless given inline
    #[serde(default)]
    pub password_keys: Vec<String>,
    pub runtime: Runtime,
}

impl WorkloadDefinition {
    pub fn expected_ports(&self) -> &[PortRule] {
        &self.ports
    }

    pub fn required_config(&self) -> &[String] {
        &self.required_config
    }

    /// Container invocation for this workload with an effective config
    ///
    /// Docker workloads receive the config as environment variables. Agent
    /// workloads get it as a `KEY="VALUE"` file under the server's config
    /// directory and no environment.
    pub fn launch_command_spec(
        &self,
        container_name: &str,
        config: &BTreeMap<String, String>,
    ) -> LaunchCommand {
        let volumes = self
            .runtime
            .container_paths()
            .into_iter()
            .enumerate()
            .map(|(i, path)| VolumeMount {
                host_path: format!("{}/data-{}", DATA_MOUNT, i),
                container_path: path.to_string(),
            })
            .collect();

        let (env, extra_args, config_file) = match &self.runtime {
            Runtime::Docker { extra_args, .. } => (config.clone(), extra_args.clone(), None),
            Runtime::Agent {
                server_code,
                config_path,
                ..
            } => {
                let contents: String = config
                    .iter()
                    .map(|(k, v)| format!("{}=\"{}\"\n", k, v))
                    .collect();
                let file = ConfigFile {
                    path: format!("{}/{}/{}", config_path, server_code, AGENT_CONFIG_FILE),
                    contents,
                };
                (BTreeMap::new(), Vec::new(), Some(file))
            }
        };

        LaunchCommand {
            container_name: container_name.to_string(),
            image: self.runtime.image().to_string(),
            ports: self.ports.clone(),
            env,
            volumes,
            extra_args,
            config_file,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("workload name is empty".to_string());
        }
        if self.ports.is_empty() {
            return Err(format!("{}: at least one port is required", self.name));
        }
        if let Some(port) = self.ports.iter().find(|p| p.port == 0) {
            return Err(format!("{}: invalid port {}", self.name, port.spec()));
        }
        if self.disk_size_gb == 0 {
            return Err(format!("{}: disk_size_gb must be positive", self.name));
        }
        if self.default_instance_type.trim().is_empty() {
            return Err(format!("{}: default_instance_type is empty", self.name));
        }
        if self.runtime.image().trim().is_empty() {
            return Err(format!("{}: image is empty", self.name));
        }
        if self.required_config.iter().any(|k| k.trim().is_empty()) {
            return Err(format!("{}: blank required_config key", self.name));
        }
        if let Some(key) = self
            .password_keys
            .iter()
            .find(|k| self.required_config.contains(k))
        {
            return Err(format!(
                "{}: '{}' cannot be both required and generated",
                self.name, key
            ));
        }
        Ok(())
    }
}

/// Immutable, validated set of workload definitions
#[derive(Debug, Clone)]
pub struct Catalog {
    definitions: BTreeMap<String, WorkloadDefinition>,
}

impl Catalog {
    /// Validate every definition and build the catalog
    pub fn new(definitions: Vec<WorkloadDefinition>) -> Result<Self, ValidationError> {
        let mut map = BTreeMap::new();
        for definition in definitions {
            definition.validate().map_err(ValidationError::InvalidCatalog)?;
            if map.contains_key(&definition.name) {
                return Err(ValidationError::InvalidCatalog(format!(
                    "duplicate workload '{}'",
                    definition.name
                )));
            }
            map.insert(definition.name.clone(), definition);
        }
        Ok(Self { definitions: map })
    }

    /// Parse a JSON array of definitions
    pub fn from_json(content: &str) -> Result<Self, ValidationError> {
        let definitions: Vec<WorkloadDefinition> = serde_json::from_str(content)
            .map_err(|e| ValidationError::InvalidCatalog(e.to_string()))?;
        Self::new(definitions)
    }

    pub fn load(path: &Path) -> Result<Self, ValidationError> {
        let content =
            std::fs::read_to_string(path).map_err(|source| ValidationError::ConfigFile {
                path: path.to_path_buf(),
                source,
            })?;
        let catalog = Self::from_json(&content)?;
        tracing::debug!(
            path = %path.display(),
            workloads = catalog.definitions.len(),
            "Catalog loaded"
        );
        Ok(catalog)
    }

    /// Definitions shipped with gsm
    pub fn builtin() -> Self {
        let definitions = [factorio(), valheim()]
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Self { definitions }
    }

    pub fn get(&self, name: &str) -> Option<&WorkloadDefinition> {
        self.definitions.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&WorkloadDefinition, ValidationError> {
        self.get(name)
            .ok_or_else(|| ValidationError::UnknownWorkload(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkloadDefinition> {
        self.definitions.values()
    }

    pub fn names(&self) -> BTreeSet<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }
}

fn factorio() -> WorkloadDefinition {
    WorkloadDefinition {
        name: "factorio".to_string(),
        display_name: "Factorio".to_string(),
        ports: vec![
            PortRule::new(34197, Protocol::Udp),
            PortRule::new(27015, Protocol::Tcp),
        ],
        defaults: BTreeMap::from([
            ("GENERATE_NEW_SAVE".to_string(), "false".to_string()),
            ("SAVE_NAME".to_string(), "GSMC Game".to_string()),
            ("LOAD_LATEST_SAVE".to_string(), "true".to_string()),
        ]),
        default_instance_type: "t3.medium".to_string(),
        min_ram_gb: 2,
        disk_size_gb: DEFAULT_DISK_SIZE_GB,
        required_config: vec![],
        password_keys: vec![],
        runtime: Runtime::Docker {
            image: "factoriotools/factorio".to_string(),
            volumes: vec!["/factorio".to_string()],
            extra_args: vec![],
        },
    }
}

fn valheim() -> WorkloadDefinition {
    WorkloadDefinition {
        name: "valheim".to_string(),
        display_name: "Valheim".to_string(),
        ports: vec![
            PortRule::new(2456, Protocol::Udp),
            PortRule::new(2457, Protocol::Udp),
        ],
        defaults: BTreeMap::from([("servername".to_string(), "GSM Valheim".to_string())]),
        default_instance_type: "t3.large".to_string(),
        min_ram_gb: 4,
        disk_size_gb: DEFAULT_DISK_SIZE_GB,
        // the server refuses to start without a password
        required_config: vec!["serverpassword".to_string()],
        password_keys: vec![],
        runtime: Runtime::Agent {
            image: "gameservermanagers/gameserver:vh".to_string(),
            server_code: "vhserver".to_string(),
            config_path: DEFAULT_AGENT_CONFIG_PATH.to_string(),
        },
    }
}
