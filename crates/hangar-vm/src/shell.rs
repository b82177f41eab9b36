//! Command channel into the guest: SSH reachability checks and the
//! one-shot setup script.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{VmError, VmResult};

#[async_trait]
pub trait GuestShell: Send + Sync {
    /// Succeeds once the guest accepts a non-interactive login.
    async fn check_reachable(&self, ip: &str) -> VmResult<()>;

    /// Run `script` in the guest, returning its combined output.
    async fn run_script(&self, ip: &str, script: &str) -> VmResult<String>;
}

/// Shells out to the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshShell {
    user: String,
    key_path: Option<PathBuf>,
    check_connect_timeout: Duration,
    script_connect_timeout: Duration,
}

impl SshShell {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            key_path: None,
            check_connect_timeout: Duration::from_secs(1),
            script_connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_key(mut self, key_path: Option<PathBuf>) -> Self {
        self.key_path = key_path;
        self
    }

    /// Full `ssh` argument list for running `remote` on `ip`.
    pub fn args(&self, ip: &str, connect_timeout: Duration, remote: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
        ];
        if let Some(key) = &self.key_path {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().into_owned());
        }
        args.push(format!("{}@{ip}", self.user));
        args.push(remote.to_string());
        args
    }

    async fn ssh(&self, args: Vec<String>) -> std::io::Result<std::process::Output> {
        Command::new("ssh").args(args).kill_on_drop(true).output().await
    }
}

#[async_trait]
impl GuestShell for SshShell {
    async fn check_reachable(&self, ip: &str) -> VmResult<()> {
        let output = self.ssh(self.args(ip, self.check_connect_timeout, "true")).await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(%ip, status = %output.status, stderr = %stderr.trim(), "ssh reachability check failed");
            Err(VmError::Io(std::io::Error::other(format!(
                "ssh reachability check failed: {}",
                output.status
            ))))
        }
    }

    async fn run_script(&self, ip: &str, script: &str) -> VmResult<String> {
        let output = self.ssh(self.args(ip, self.script_connect_timeout, script)).await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() {
            Ok(combined)
        } else {
            Err(VmError::SetupScript(format!(
                "{}, output: {}",
                output.status,
                combined.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_without_key() {
        let shell = SshShell::new("runner");
        let args = shell.args("192.168.64.5", Duration::from_secs(1), "true");
        assert_eq!(
            args,
            [
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=1",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "runner@192.168.64.5",
                "true",
            ]
        );
    }

    #[test]
    fn args_with_key_and_script() {
        let shell = SshShell::new("ci").with_key(Some(PathBuf::from("/keys/id_ed25519")));
        let args = shell.args("10.0.0.2", Duration::from_secs(10), "echo hi");
        let joined = args.join(" ");
        assert!(joined.contains("ConnectTimeout=10"));
        assert!(joined.contains("-i /keys/id_ed25519 ci@10.0.0.2 echo hi"));
    }
}
