//! `hangard vm ...`: maintenance commands over the local VM bundles.
//!
//! These act on `runners_path` directly and never talk to the
//! coordinator. A runner deleted here disappears from the coordinator's
//! view only after the running agent's next snapshot.

use std::fmt::Write as _;
use std::path::Path;

use hangar_core::config::AgentConfig;
use hangar_vm::bundle::{self, BundleEntry};
use hangar_vm::{IpArbiter, VmManager};

use crate::agent_mode::build_vm_manager;

/// Plain-text table of bundles, one per line.
pub fn render_bundles(entries: &[BundleEntry]) -> String {
    let mut out = format!(
        "{:<38} {:<9} {:<16} {:<26} {}\n",
        "RUNNER ID", "STATE", "IP ADDRESS", "CREATED", "PATH"
    );
    for entry in entries {
        let m = &entry.metadata;
        let ip = if m.ip_address.is_empty() { "-" } else { m.ip_address.as_str() };
        let _ = writeln!(
            out,
            "{:<38} {:<9} {:<16} {:<26} {}",
            m.runner_id,
            m.state.to_string(),
            ip,
            m.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            entry.path.display()
        );
    }
    out
}

pub fn list(runners_path: &Path) -> anyhow::Result<()> {
    let entries = bundle::list_bundles(runners_path)?;
    if entries.is_empty() {
        println!("no VMs under {}", runners_path.display());
        return Ok(());
    }
    print!("{}", render_bundles(&entries));
    Ok(())
}

pub async fn stop(config: &AgentConfig, runner_id: &str) -> anyhow::Result<()> {
    build_vm_manager(config, IpArbiter::new()).stop(runner_id).await?;
    println!("stopped {runner_id}");
    Ok(())
}

pub async fn delete(config: &AgentConfig, runner_id: &str) -> anyhow::Result<()> {
    build_vm_manager(config, IpArbiter::new()).delete(runner_id).await?;
    println!("deleted {runner_id}");
    Ok(())
}

/// Run a command in the guest, echo its output, return its exit code.
pub async fn exec(
    config: &AgentConfig,
    runner_id: &str,
    command: &str,
    args: &[String],
) -> anyhow::Result<i32> {
    let output = build_vm_manager(config, IpArbiter::new())
        .exec(runner_id, command, args)
        .await?;
    if let Some(error) = output.error.filter(|e| !e.is_empty()) {
        anyhow::bail!("guest could not run {command}: {error}");
    }
    print!("{}", output.output);
    Ok(output.exit_code)
}
