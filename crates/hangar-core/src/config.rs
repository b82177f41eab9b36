//! `hangar.toml` configuration for the coordinator and agent modes.
//!
//! Every field has a default, so an empty file (or no file) is valid.
//! Command-line flags in `hangard` override values loaded here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest `max_runners` an agent may advertise.
pub const MAX_RUNNERS_LIMIT: u32 = 2;

/// Top-level config file: one optional table per mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HangarConfig {
    pub coordinator: CoordinatorConfig,
    pub agent: AgentConfig,
}

impl HangarConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HangarConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// gRPC listen address (agent sync + instance service).
    pub grpc_addr: String,
    /// Read-only HTTP API listen address.
    pub http_addr: String,
    /// Sync interval suggested to agents at registration.
    pub sync_interval_secs: u64,
    pub add_instance_timeout_secs: u64,
    pub delete_instance_timeout_secs: u64,
    /// How often request handlers poll the store for convergence.
    pub state_poll_interval_ms: u64,
    pub sweep_interval_secs: u64,
    /// How long a runner may sit in ERROR before the sweeper deletes it.
    pub error_grace_period_secs: u64,
    /// How often fleet gauges are recomputed for `/metrics`.
    pub metrics_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            grpc_addr: "0.0.0.0:50051".to_string(),
            http_addr: "0.0.0.0:9090".to_string(),
            sync_interval_secs: 5,
            add_instance_timeout_secs: 300,
            delete_instance_timeout_secs: 120,
            state_poll_interval_ms: 500,
            sweep_interval_secs: 60,
            error_grace_period_secs: 300,
            metrics_interval_secs: 15,
        }
    }
}

impl CoordinatorConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn add_instance_timeout(&self) -> Duration {
        Duration::from_secs(self.add_instance_timeout_secs)
    }

    pub fn delete_instance_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_instance_timeout_secs)
    }

    pub fn state_poll_interval(&self) -> Duration {
        Duration::from_millis(self.state_poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn error_grace_period(&self) -> Duration {
        Duration::from_secs(self.error_grace_period_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Coordinator gRPC address (`host:port`).
    pub server_addr: String,
    /// Advertised hostname; the system hostname when unset.
    pub hostname: Option<String>,
    pub max_runners: u32,
    /// Directory holding the VM template the hypervisor clones from.
    pub template_path: PathBuf,
    /// Directory holding one `<runner_id>.bundle` per VM.
    pub runners_path: PathBuf,
    pub ssh_key_path: Option<PathBuf>,
    pub ssh_user: String,
    /// Listen address for guest IP announcements.
    pub ip_notify_addr: String,
    /// External helper that performs hypervisor operations.
    pub hypervisor_command: String,
    pub boot_timeout_secs: u64,
    pub ip_wait_timeout_secs: u64,
    pub ssh_timeout_secs: u64,
    pub ssh_poll_interval_secs: u64,
    pub graceful_stop_timeout_secs: u64,
    /// Port of the exec/status shim inside the guest.
    pub guest_shim_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:50051".to_string(),
            hostname: None,
            max_runners: MAX_RUNNERS_LIMIT,
            template_path: PathBuf::from("/opt/hangar/templates/default"),
            runners_path: PathBuf::from("/opt/hangar/runners"),
            ssh_key_path: None,
            ssh_user: "runner".to_string(),
            ip_notify_addr: "0.0.0.0:8081".to_string(),
            hypervisor_command: "hangar-vmctl".to_string(),
            boot_timeout_secs: 60,
            ip_wait_timeout_secs: 120,
            ssh_timeout_secs: 300,
            ssh_poll_interval_secs: 2,
            graceful_stop_timeout_secs: 30,
            guest_shim_port: 8080,
        }
    }
}

impl AgentConfig {
    /// Reject settings the agent cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_runners == 0 {
            anyhow::bail!("max_runners must be at least 1");
        }
        if self.max_runners > MAX_RUNNERS_LIMIT {
            anyhow::bail!(
                "max_runners must be {MAX_RUNNERS_LIMIT} or less (got {})",
                self.max_runners
            );
        }
        if self.server_addr.is_empty() {
            anyhow::bail!("server_addr must not be empty");
        }
        Ok(())
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn ip_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.ip_wait_timeout_secs)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }

    pub fn ssh_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ssh_poll_interval_secs)
    }

    pub fn graceful_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_stop_timeout_secs)
    }
}
