//! Hypervisor capability set consumed by the lifecycle manager.
//!
//! A VM is addressed by its bundle directory. [`CommandHypervisor`] drives
//! an external helper binary; tests use [`crate::fake::FakeHypervisor`].

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{VmError, VmResult};

/// Power state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPowerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for VmPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmPowerState::Stopped => "stopped",
            VmPowerState::Starting => "starting",
            VmPowerState::Running => "running",
            VmPowerState::Stopping => "stopping",
            VmPowerState::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for VmPowerState {
    type Err = VmError;

    fn from_str(s: &str) -> VmResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stopped" => Ok(VmPowerState::Stopped),
            "starting" => Ok(VmPowerState::Starting),
            "running" => Ok(VmPowerState::Running),
            "stopping" => Ok(VmPowerState::Stopping),
            "error" => Ok(VmPowerState::Error),
            other => Err(VmError::Hypervisor(format!("unknown VM state: {other:?}"))),
        }
    }
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Populate `bundle` with a fresh VM cloned from `template`.
    async fn create_from_template(&self, template: &Path, bundle: &Path) -> VmResult<()>;

    /// Begin booting the VM. Returns once the boot has been initiated.
    async fn boot(&self, bundle: &Path) -> VmResult<()>;

    /// Ask the guest to shut down. `false` if the request was refused.
    async fn request_graceful_stop(&self, bundle: &Path) -> VmResult<bool>;

    async fn force_stop(&self, bundle: &Path) -> VmResult<()>;

    async fn state(&self, bundle: &Path) -> VmResult<VmPowerState>;
}

/// Runs `<program> <verb> [args...]` for every operation.
///
/// | Verb | Args | Success |
/// |---|---|---|
/// | `clone` | template, bundle | exit 0 |
/// | `boot` | bundle | exit 0 |
/// | `stop` | bundle | exit 0 (exit 1: request refused) |
/// | `kill` | bundle | exit 0 |
/// | `state` | bundle | exit 0, state name on stdout |
#[derive(Debug, Clone)]
pub struct CommandHypervisor {
    program: String,
}

impl CommandHypervisor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, verb: &str, args: &[&Path]) -> VmResult<std::process::Output> {
        debug!(program = %self.program, %verb, ?args, "hypervisor call");
        let output = Command::new(&self.program)
            .arg(verb)
            .args(args)
            .output()
            .await
            .map_err(|e| VmError::Hypervisor(format!("failed to run {}: {e}", self.program)))?;
        Ok(output)
    }

    async fn run_ok(&self, verb: &str, args: &[&Path]) -> VmResult<String> {
        let output = self.run(verb, args).await?;
        if !output.status.success() {
            return Err(VmError::Hypervisor(format!(
                "{verb} failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Hypervisor for CommandHypervisor {
    async fn create_from_template(&self, template: &Path, bundle: &Path) -> VmResult<()> {
        self.run_ok("clone", &[template, bundle]).await.map(|_| ())
    }

    async fn boot(&self, bundle: &Path) -> VmResult<()> {
        self.run_ok("boot", &[bundle]).await.map(|_| ())
    }

    async fn request_graceful_stop(&self, bundle: &Path) -> VmResult<bool> {
        let output = self.run("stop", &[bundle]).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(VmError::Hypervisor(format!(
                "stop failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    async fn force_stop(&self, bundle: &Path) -> VmResult<()> {
        self.run_ok("kill", &[bundle]).await.map(|_| ())
    }

    async fn state(&self, bundle: &Path) -> VmResult<VmPowerState> {
        self.run_ok("state", &[bundle]).await?.parse()
    }
}
