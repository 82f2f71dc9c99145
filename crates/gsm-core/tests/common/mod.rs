use async_trait::async_trait;
use gsm_cloud::{InMemoryProvider, InMemoryRegions, PollConfig, RetryConfig};
use gsm_core::{
    Catalog, Fleet, FleetOptions, LaunchCommand, RemoteChannel, RemoteError, RemoteTarget, Store,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const CATALOG: &str = r#"[
  {
    "name": "factorio",
    "ports": [{ "port": 34197, "protocol": "udp" }, { "port": 27015, "protocol": "tcp" }],
    "defaults": { "A": "1" },
    "default_instance_type": "t3.medium",
    "min_ram_gb": 2,
    "runtime": { "kind": "docker", "image": "factoriotools/factorio", "volumes": ["/factorio"] }
  },
  {
    "name": "valheim",
    "ports": [{ "port": 2456, "protocol": "udp" }],
    "default_instance_type": "t3.large",
    "min_ram_gb": 4,
    "required_config": ["serverpassword"],
    "runtime": { "kind": "agent", "image": "gameservermanagers/gameserver:vh", "server_code": "vhserver" }
  }
]"#;

/// Remote channel that records what it was asked to do
#[derive(Default)]
pub struct FakeRemote {
    calls: Mutex<Vec<String>>,
    fail_deploy: AtomicBool,
    fail_start: AtomicBool,
}

impl FakeRemote {
    #[allow(dead_code)]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn fail_deploy(&self, fail: bool) {
        self.fail_deploy.store(fail, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn command_failed() -> RemoteError {
    RemoteError::CommandFailed {
        code: 125,
        output: "docker: error".to_string(),
    }
}

#[async_trait]
impl RemoteChannel for FakeRemote {
    async fn deploy_workload(
        &self,
        target: &RemoteTarget,
        command: &LaunchCommand,
    ) -> Result<(), RemoteError> {
        self.record(format!("deploy {} {}", target.host, command.container_name));
        if self.fail_deploy.load(Ordering::SeqCst) {
            return Err(command_failed());
        }
        Ok(())
    }

    async fn stop_workload(&self, target: &RemoteTarget, container: &str) -> Result<(), RemoteError> {
        self.record(format!("stop {} {}", target.host, container));
        Ok(())
    }

    async fn start_workload(&self, target: &RemoteTarget, container: &str) -> Result<(), RemoteError> {
        self.record(format!("start {} {}", target.host, container));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(command_failed());
        }
        Ok(())
    }
}

pub struct TestFleet {
    pub dir: TempDir,
    pub provider: Arc<InMemoryProvider>,
    pub remote: Arc<FakeRemote>,
    pub fleet: Fleet,
}

impl TestFleet {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(InMemoryProvider::default());
        let remote = Arc::new(FakeRemote::default());
        let fleet = Fleet::new(
            Store::new(dir.path()),
            Catalog::from_json(CATALOG).unwrap(),
            provider.clone(),
            remote.clone(),
            options(&dir),
        );
        Self {
            dir,
            provider,
            remote,
            fleet,
        }
    }

    /// Second fleet sharing this one's store and provider
    #[allow(dead_code)]
    pub fn sibling(&self) -> Fleet {
        Fleet::new(
            Store::new(self.dir.path()),
            Catalog::from_json(CATALOG).unwrap(),
            self.provider.clone(),
            self.remote.clone(),
            options(&self.dir),
        )
    }

    /// Fleet sharing this one's store, homed in `home`'s region and able to
    /// reach every provider in `others`
    #[allow(dead_code)]
    pub fn fleet_in(&self, home: Arc<InMemoryProvider>, others: Vec<Arc<InMemoryProvider>>) -> Fleet {
        Fleet::new(
            Store::new(self.dir.path()),
            Catalog::from_json(CATALOG).unwrap(),
            home,
            self.remote.clone(),
            options(&self.dir),
        )
        .with_regions(Arc::new(InMemoryRegions::new(others)))
    }
}

pub fn options(dir: &TempDir) -> FleetOptions {
    FleetOptions {
        key_dir: dir.path().join("keys"),
        retry: RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
        poll: PollConfig {
            interval: Duration::from_millis(1),
            timeout: Duration::from_secs(2),
        },
        lock_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}
