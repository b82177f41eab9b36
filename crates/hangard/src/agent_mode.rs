//! Agent mode: runs on each VM host.
//!
//! In this mode, the daemon:
//! 1. Serves `POST /notify-ip` for booting guests
//! 2. Builds the VM lifecycle manager over the hypervisor helper and SSH
//! 3. Registers with the coordinator and keeps the sync stream alive
//! 4. On shutdown, stops syncing; VMs are left as they are

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use hangar_cluster::{SyncClient, SyncClientConfig};
use hangar_core::config::AgentConfig;
use hangar_vm::{
    CommandHypervisor, GuestShimClient, IpArbiter, LifecycleTimeouts, RunnerManager, SshShell,
    VmLifecycleManager,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, info_span};

/// Lifecycle manager backed by the configured hypervisor helper and SSH.
pub fn build_vm_manager(config: &AgentConfig, arbiter: IpArbiter) -> VmLifecycleManager {
    let hypervisor = Arc::new(CommandHypervisor::new(config.hypervisor_command.clone()));
    let shell = Arc::new(SshShell::new(config.ssh_user.clone()).with_key(config.ssh_key_path.clone()));
    VmLifecycleManager::new(
        hypervisor,
        arbiter,
        shell,
        GuestShimClient::new(config.guest_shim_port),
        config.template_path.clone(),
        config.runners_path.clone(),
    )
    .with_timeouts(LifecycleTimeouts::from(config))
    .with_span(info_span!("vm_manager", component = "vm_manager"))
}

/// Run the agent until Ctrl-C.
pub async fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    config.validate()?;
    info!(
        server = %config.server_addr,
        max_runners = config.max_runners,
        runners_path = ?config.runners_path,
        "hangar daemon starting in agent mode"
    );
    std::fs::create_dir_all(&config.runners_path)?;

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Guest IP announcements ───────────────────────────────────
    let arbiter = IpArbiter::new();
    let notify_addr: SocketAddr = config.ip_notify_addr.parse()?;
    let notify_listener = TcpListener::bind(notify_addr)
        .await
        .with_context(|| format!("failed to bind IP notification listener on {notify_addr}"))?;
    let notify_arbiter = arbiter.clone();
    let notify_shutdown = shutdown_rx.clone();
    let notify_handle = tokio::spawn(async move {
        let span = info_span!("ip_notify", component = "ip_arbiter");
        if let Err(e) =
            hangar_vm::ipnotify::serve(notify_arbiter, notify_listener, notify_shutdown, span).await
        {
            tracing::error!(error = %e, "IP notification server error");
        }
    });

    // ── Sync with the coordinator ────────────────────────────────
    let vm = Arc::new(build_vm_manager(&config, arbiter));
    let client = SyncClient::new(
        SyncClientConfig::from_agent_config(&config),
        RunnerManager::new(),
        vm,
    )
    .with_span(info_span!("sync_client", component = "sync_client"));

    let sync_shutdown = shutdown_rx.clone();
    let sync_handle = tokio::spawn(async move {
        if let Err(e) = client.run(sync_shutdown).await {
            tracing::error!(error = %e, "sync client error");
        }
    });

    // ── Wait for shutdown ────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = sync_handle.await;
    let _ = notify_handle.await;

    info!("agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn taken_notify_port_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = AgentConfig {
            runners_path: dir.path().join("runners"),
            ip_notify_addr: taken.local_addr().unwrap().to_string(),
            ..Default::default()
        };

        let err = run_agent(config).await.unwrap_err();
        assert!(err.to_string().contains("failed to bind IP notification listener"), "{err}");
    }
}
