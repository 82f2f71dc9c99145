//! Remote-command channel over the system `ssh` client

use crate::utils::shell_escape;
use async_trait::async_trait;
use gsm_cloud::PollConfig;
use gsm_core::{LaunchCommand, RemoteChannel, RemoteError, RemoteTarget};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;

const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "BatchMode=yes",
    "-o",
    "ConnectTimeout=10",
    "-o",
    "LogLevel=ERROR",
];

/// Runs `sudo docker ...` on an instance through `ssh`
pub struct SshChannel {
    poll: PollConfig,
}

impl SshChannel {
    pub fn new(poll: PollConfig) -> Self {
        Self { poll }
    }

    fn command(target: &RemoteTarget, script: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(SSH_OPTIONS);
        if let Some(key) = &target.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", target.user, target.host))
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    async fn run(&self, target: &RemoteTarget, script: &str) -> Result<String, RemoteError> {
        self.run_with_input(target, script, None).await
    }

    async fn run_with_input(
        &self,
        target: &RemoteTarget,
        script: &str,
        input: Option<&str>,
    ) -> Result<String, RemoteError> {
        tracing::debug!(host = %target.host, "ssh: {}", script);

        let mut cmd = Self::command(target, script);
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd.spawn()?;

        if let Some(input) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await?;
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(RemoteError::CommandFailed {
                code: output.status.code().unwrap_or(-1),
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Wait until the instance accepts SSH and its Docker daemon answers
    async fn wait_for_docker(&self, target: &RemoteTarget) -> Result<(), RemoteError> {
        let deadline = Instant::now() + self.poll.timeout;
        loop {
            match self.run(target, "sudo docker info --format '{{.ServerVersion}}'").await {
                Ok(version) => {
                    tracing::debug!(host = %target.host, "Docker {} is ready", version.trim());
                    return Ok(());
                }
                Err(RemoteError::Io(e)) => return Err(RemoteError::Io(e)),
                Err(e) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(host = %target.host, "Docker never came up: {}", e);
                        return Err(RemoteError::Timeout(format!(
                            "Docker daemon on {}",
                            target.host
                        )));
                    }
                    tracing::debug!(host = %target.host, "Waiting for Docker: {}", e);
                }
            }
            tokio::time::sleep(self.poll.interval).await;
        }
    }
}

/// `sudo docker create ...` for a launch command
fn create_script(command: &LaunchCommand) -> String {
    let args: Vec<String> = command
        .container_args()
        .iter()
        .map(|a| shell_escape(a))
        .collect();
    format!("sudo docker create {}", args.join(" "))
}

/// Copy stdin into the container at `path`
fn copy_script(container: &str, path: &str) -> String {
    format!(
        "tmp=$(mktemp) && cat > \"$tmp\" && sudo docker cp \"$tmp\" {} && rm -f \"$tmp\"",
        shell_escape(&format!("{}:{}", container, path))
    )
}

#[async_trait]
impl RemoteChannel for SshChannel {
    #[tracing::instrument(skip(self, target, command), fields(host = %target.host, container = %command.container_name))]
    async fn deploy_workload(
        &self,
        target: &RemoteTarget,
        command: &LaunchCommand,
    ) -> Result<(), RemoteError> {
        self.wait_for_docker(target).await?;

        tracing::info!("Pulling {}", command.image);
        self.run(target, &format!("sudo docker pull {}", shell_escape(&command.image)))
            .await?;
        self.run(target, &create_script(command)).await?;

        if let Some(file) = &command.config_file {
            self.run_with_input(
                target,
                &copy_script(&command.container_name, &file.path),
                Some(&file.contents),
            )
            .await?;
        }

        self.start_workload(target, &command.container_name).await
    }

    async fn stop_workload(
        &self,
        target: &RemoteTarget,
        container: &str,
    ) -> Result<(), RemoteError> {
        self.run(target, &format!("sudo docker stop {}", shell_escape(container)))
            .await?;
        Ok(())
    }

    async fn start_workload(
        &self,
        target: &RemoteTarget,
        container: &str,
    ) -> Result<(), RemoteError> {
        // a freshly resumed instance may still be booting
        self.wait_for_docker(target).await?;
        self.run(target, &format!("sudo docker start {}", shell_escape(container)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsm_cloud::{PortRule, Protocol};
    use std::collections::BTreeMap;

    #[test]
    fn test_create_script_quotes_every_argument() {
        let command = LaunchCommand {
            container_name: "gsm-factorio-abc123".to_string(),
            image: "factoriotools/factorio".to_string(),
            ports: vec![PortRule::new(34197, Protocol::Udp)],
            env: BTreeMap::from([("SAVE_NAME".to_string(), "it's mine".to_string())]),
            volumes: vec![],
            extra_args: vec![],
            config_file: None,
        };

        assert_eq!(
            create_script(&command),
            "sudo docker create '--name' 'gsm-factorio-abc123' '-p' '34197:34197/udp' \
             '-e' 'SAVE_NAME=it'\\''s mine' 'factoriotools/factorio'"
        );
    }

    #[test]
    fn test_copy_script() {
        let script = copy_script("gsm-valheim-abc123", "/data/config-lgsm/vhserver/common.cfg");
        assert!(script.contains("sudo docker cp \"$tmp\" 'gsm-valheim-abc123:/data/config-lgsm/vhserver/common.cfg'"));
        assert!(script.starts_with("tmp=$(mktemp)"));
    }

    #[test]
    fn test_command_uses_key_and_user() {
        let target = RemoteTarget {
            host: "203.0.113.7".to_string(),
            user: "ec2-user".to_string(),
            key_path: Some("/tmp/gsm-key.pem".into()),
        };
        let cmd = SshChannel::command(&target, "true");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args.windows(2).any(|w| w == ["-i", "/tmp/gsm-key.pem"]));
        assert!(args.contains(&"ec2-user@203.0.113.7".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("true"));
    }
}
