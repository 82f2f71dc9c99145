use assert_cmd::Command;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Isolated state directory for one `gsm` invocation set
pub struct TestState {
    pub root: TempDir,
}

impl TestState {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    #[allow(dead_code)]
    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.root.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    /// `gsm` with no way of reaching a real account
    #[allow(deprecated)] // TODO: migrate to cargo_bin_cmd!
    pub fn gsm(&self) -> Command {
        let mut cmd = Command::cargo_bin("gsm").unwrap();
        cmd.env("GSM_STATE_DIR", self.root.path())
            .env("GSM_REGION", "eu-west-2")
            .env_remove("GSM_CATALOG_PATH")
            .env_remove("RUST_LOG")
            .env("AWS_EC2_METADATA_DISABLED", "true")
            .env("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE")
            .env("AWS_SECRET_ACCESS_KEY", "not-a-real-secret")
            .env("AWS_ENDPOINT_URL", "http://127.0.0.1:9");
        cmd
    }
}
