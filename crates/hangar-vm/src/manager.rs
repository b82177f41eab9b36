//! VM lifecycle manager.
//!
//! Drives one runner's VM through
//!
//! ```text
//! create ──→ start ──→ wait_for_ssh ──→ run_setup_script
//!   │          │
//!   │          ├─ boot, poll hypervisor state until Running
//!   │          └─ wait for the guest to announce its IP (IpArbiter)
//!   └─ clone template into <runners_path>/<runner_id>.bundle
//!
//! stop:   graceful request, bounded wait, then force stop
//! delete: cancel any IP wait, stop (best effort), remove bundle;
//!         already gone is success
//! ```
//!
//! Every wait is bounded by [`LifecycleTimeouts`] and surfaces as a typed
//! timeout error. The manager never changes runner state; the command
//! handler that drives it does.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hangar_core::config::AgentConfig;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::bundle::{Bundle, BundleState, RuntimeMetadata};
use crate::error::{VmError, VmResult};
use crate::hypervisor::{Hypervisor, VmPowerState};
use crate::ipnotify::IpArbiter;
use crate::shell::GuestShell;
use crate::shim::{ExecOutput, GuestShimClient, GuestStatus};

/// Result of [`VmManager::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub runner_id: String,
    pub bundle_path: PathBuf,
    /// Empty until the guest announces itself.
    pub ip_address: String,
}

/// Bounds on every wait the manager performs.
#[derive(Debug, Clone)]
pub struct LifecycleTimeouts {
    pub boot: Duration,
    pub boot_poll: Duration,
    pub ip_wait: Duration,
    pub ssh: Duration,
    pub ssh_poll: Duration,
    pub graceful_stop: Duration,
    pub stop_poll: Duration,
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for LifecycleTimeouts {
    fn from(config: &AgentConfig) -> Self {
        Self {
            boot: config.boot_timeout(),
            boot_poll: Duration::from_secs(1),
            ip_wait: config.ip_wait_timeout(),
            ssh: config.ssh_timeout(),
            ssh_poll: config.ssh_poll_interval(),
            graceful_stop: config.graceful_stop_timeout(),
            stop_poll: Duration::from_secs(1),
        }
    }
}

/// Operations the agent performs on a runner's VM.
#[async_trait]
pub trait VmManager: Send + Sync {
    async fn create(&self, runner_id: &str) -> VmResult<VmInfo>;

    /// Boot and block until the guest IP is known. Returns the IP.
    async fn start(&self, runner_id: &str) -> VmResult<String>;

    async fn stop(&self, runner_id: &str) -> VmResult<()>;

    async fn delete(&self, runner_id: &str) -> VmResult<()>;

    async fn wait_for_ssh(&self, runner_id: &str) -> VmResult<()>;

    async fn run_setup_script(&self, runner_id: &str, script: &str) -> VmResult<()>;

    async fn exec(&self, runner_id: &str, command: &str, args: &[String]) -> VmResult<ExecOutput>;

    async fn guest_status(&self, runner_id: &str) -> VmResult<GuestStatus>;
}

pub struct VmLifecycleManager {
    hypervisor: Arc<dyn Hypervisor>,
    arbiter: IpArbiter,
    shell: Arc<dyn GuestShell>,
    shim: GuestShimClient,
    template_path: PathBuf,
    runners_path: PathBuf,
    timeouts: LifecycleTimeouts,
    span: Span,
}

impl VmLifecycleManager {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        arbiter: IpArbiter,
        shell: Arc<dyn GuestShell>,
        shim: GuestShimClient,
        template_path: impl Into<PathBuf>,
        runners_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            hypervisor,
            arbiter,
            shell,
            shim,
            template_path: template_path.into(),
            runners_path: runners_path.into(),
            timeouts: LifecycleTimeouts::default(),
            span: Span::none(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: LifecycleTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Parent span for every operation this manager performs.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn runners_path(&self) -> &Path {
        &self.runners_path
    }

    pub fn bundle(&self, runner_id: &str) -> Bundle {
        Bundle::for_runner(&self.runners_path, runner_id)
    }

    fn existing_bundle(&self, runner_id: &str) -> VmResult<Bundle> {
        let bundle = self.bundle(runner_id);
        if !bundle.exists() {
            return Err(VmError::NotFound(runner_id.to_string()));
        }
        Ok(bundle)
    }

    fn op_span(&self, op: &'static str, runner_id: &str) -> Span {
        info_span!(parent: &self.span, "vm", op, %runner_id)
    }

    fn mark(&self, bundle: &Bundle, state: BundleState) {
        if let Err(e) = bundle.update_metadata(|m| m.state = state) {
            warn!(path = ?bundle.path(), %state, error = %e, "failed to update runtime metadata");
        }
    }

    // ── Provisioning ───────────────────────────────────────────────

    async fn create_vm(&self, runner_id: &str) -> VmResult<VmInfo> {
        std::fs::create_dir_all(&self.runners_path)?;
        let bundle = self.bundle(runner_id);

        self.hypervisor
            .create_from_template(&self.template_path, bundle.path())
            .await?;
        std::fs::create_dir_all(bundle.path())?;
        bundle.save_metadata(&RuntimeMetadata::new(runner_id))?;

        info!(path = ?bundle.path(), "VM bundle created");
        Ok(VmInfo {
            runner_id: runner_id.to_string(),
            bundle_path: bundle.path().to_path_buf(),
            ip_address: String::new(),
        })
    }

    async fn start_vm(&self, runner_id: &str) -> VmResult<String> {
        let bundle = self.existing_bundle(runner_id)?;
        self.mark(&bundle, BundleState::Booting);

        // One deadline covers the boot call and every state poll.
        let deadline = Instant::now() + self.timeouts.boot;
        match tokio::time::timeout_at(deadline, self.hypervisor.boot(bundle.path())).await {
            Ok(booted) => booted?,
            Err(_) => return Err(self.boot_timed_out(&bundle)),
        }

        info!("waiting for VM to reach running state");
        loop {
            let state = match tokio::time::timeout_at(deadline, self.hypervisor.state(bundle.path())).await {
                Ok(state) => state?,
                Err(_) => return Err(self.boot_timed_out(&bundle)),
            };
            debug!(%state, "VM state check");
            match state {
                VmPowerState::Running => break,
                VmPowerState::Error | VmPowerState::Stopped => {
                    self.mark(&bundle, BundleState::Error);
                    return Err(VmError::BootFailed(state.to_string()));
                }
                VmPowerState::Starting | VmPowerState::Stopping => {}
            }
            if Instant::now() >= deadline {
                return Err(self.boot_timed_out(&bundle));
            }
            tokio::time::sleep(self.timeouts.boot_poll).await;
        }

        info!("VM running, waiting for IP notification");
        let ip = self
            .arbiter
            .wait_for_ip(runner_id, self.timeouts.ip_wait)
            .await?;

        bundle.update_metadata(|m| {
            m.ip_address = ip.clone();
            m.state = BundleState::Running;
        })?;
        info!(ip_address = %ip, "guest IP received");
        Ok(ip)
    }

    fn boot_timed_out(&self, bundle: &Bundle) -> VmError {
        warn!(timeout = ?self.timeouts.boot, "VM boot timed out");
        self.mark(bundle, BundleState::Error);
        VmError::BootTimeout(self.timeouts.boot)
    }

    async fn wait_ssh(&self, runner_id: &str) -> VmResult<()> {
        let ip = self.existing_bundle(runner_id)?.ip_address(runner_id)?;
        info!(ip_address = %ip, timeout = ?self.timeouts.ssh, "waiting for SSH");

        let deadline = Instant::now() + self.timeouts.ssh;
        let mut attempts = 0u32;
        loop {
            tokio::time::sleep(self.timeouts.ssh_poll).await;
            attempts += 1;
            match tokio::time::timeout_at(deadline, self.shell.check_reachable(&ip)).await {
                Ok(Ok(())) => {
                    info!(ip_address = %ip, attempts, "SSH ready");
                    return Ok(());
                }
                Ok(Err(e)) => debug!(attempt = attempts, error = %e, "SSH not ready, retrying"),
                Err(_) => {}
            }
            if Instant::now() >= deadline {
                warn!(ip_address = %ip, attempts, "SSH wait timed out");
                return Err(VmError::SshTimeout { attempts });
            }
        }
    }

    async fn setup(&self, runner_id: &str, script: &str) -> VmResult<()> {
        if script.trim().is_empty() {
            debug!("no setup script");
            return Ok(());
        }
        let ip = self.existing_bundle(runner_id)?.ip_address(runner_id)?;
        info!(ip_address = %ip, script_len = script.len(), "running setup script");
        let output = self.shell.run_script(&ip, script).await?;
        info!(output_len = output.len(), "setup script completed");
        Ok(())
    }

    // ── Teardown ───────────────────────────────────────────────────

    async fn stop_vm(&self, runner_id: &str) -> VmResult<()> {
        let bundle = self.existing_bundle(runner_id)?;

        if self.hypervisor.state(bundle.path()).await? == VmPowerState::Stopped {
            self.mark(&bundle, BundleState::Stopped);
            return Ok(());
        }

        let accepted = match self.hypervisor.request_graceful_stop(bundle.path()).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "graceful stop request failed");
                false
            }
        };

        if accepted {
            let deadline = Instant::now() + self.timeouts.graceful_stop;
            while Instant::now() < deadline {
                if self.hypervisor.state(bundle.path()).await? == VmPowerState::Stopped {
                    info!("VM stopped gracefully");
                    self.mark(&bundle, BundleState::Stopped);
                    return Ok(());
                }
                tokio::time::sleep(self.timeouts.stop_poll).await;
            }
            warn!(timeout = ?self.timeouts.graceful_stop, "graceful stop timed out, forcing");
        }

        self.hypervisor.force_stop(bundle.path()).await?;
        self.mark(&bundle, BundleState::Stopped);
        info!("VM force stopped");
        Ok(())
    }

    async fn delete_vm(&self, runner_id: &str) -> VmResult<()> {
        // A start still waiting for its IP must not claim the next guest's.
        self.arbiter.cancel(runner_id);
        if let Err(e) = self.stop_vm(runner_id).await {
            if !e.is_not_found() {
                warn!(error = %e, "failed to stop VM before deletion");
            }
        }
        self.bundle(runner_id).remove()?;
        info!("VM bundle deleted");
        Ok(())
    }
}

#[async_trait]
impl VmManager for VmLifecycleManager {
    async fn create(&self, runner_id: &str) -> VmResult<VmInfo> {
        self.create_vm(runner_id)
            .instrument(self.op_span("create", runner_id))
            .await
    }

    async fn start(&self, runner_id: &str) -> VmResult<String> {
        self.start_vm(runner_id)
            .instrument(self.op_span("start", runner_id))
            .await
    }

    async fn stop(&self, runner_id: &str) -> VmResult<()> {
        self.stop_vm(runner_id)
            .instrument(self.op_span("stop", runner_id))
            .await
    }

    async fn delete(&self, runner_id: &str) -> VmResult<()> {
        self.delete_vm(runner_id)
            .instrument(self.op_span("delete", runner_id))
            .await
    }

    async fn wait_for_ssh(&self, runner_id: &str) -> VmResult<()> {
        self.wait_ssh(runner_id)
            .instrument(self.op_span("wait_for_ssh", runner_id))
            .await
    }

    async fn run_setup_script(&self, runner_id: &str, script: &str) -> VmResult<()> {
        self.setup(runner_id, script)
            .instrument(self.op_span("setup", runner_id))
            .await
    }

    async fn exec(&self, runner_id: &str, command: &str, args: &[String]) -> VmResult<ExecOutput> {
        let ip = self.existing_bundle(runner_id)?.ip_address(runner_id)?;
        self.shim.exec(&ip, command, args).await
    }

    async fn guest_status(&self, runner_id: &str) -> VmResult<GuestStatus> {
        let ip = self.existing_bundle(runner_id)?.ip_address(runner_id)?;
        self.shim.status(&ip).await
    }
}
