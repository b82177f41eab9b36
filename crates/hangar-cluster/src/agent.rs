//! Agent side of the sync protocol.
//!
//! The [`SyncClient`] registers with the coordinator, opens the sync
//! stream and keeps two loops running over it:
//!
//! ```text
//!   send loop:  every tick or local change ──▶ snapshot
//!   recv loop:  command ──▶ spawned handler ──▶ VmManager + RunnerManager
//! ```
//!
//! Whichever loop ends first takes the session down. The client then
//! re-registers after `reconnect_delay`; local runners survive and are
//! re-reported under the new agent id.
//!
//! Each runner's provisioning task is tracked by runner id. A delete for a
//! runner that is still provisioning aborts that task before the VM is
//! removed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use hangar_core::config::AgentConfig;
use hangar_core::{AgentCapacity, RunnerId, RunnerState};
use hangar_vm::{RunnerError, RunnerManager, VmManager};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;
use tonic::transport::Channel;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::commands::Command;
use crate::proto;
use crate::proto::agent_service_client::AgentServiceClient;

/// Connection settings for a [`SyncClient`].
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    /// Coordinator gRPC address (`host:port`).
    pub server_addr: String,
    pub hostname: String,
    pub capacity: AgentCapacity,
    /// Pause between a failed session and the next registration.
    pub reconnect_delay: Duration,
}

impl SyncClientConfig {
    /// Build from the agent config, filling hostname and hardware
    /// figures from the local machine.
    pub fn from_agent_config(config: &AgentConfig) -> Self {
        let hostname = config.hostname.clone().unwrap_or_else(local_hostname);
        Self {
            server_addr: config.server_addr.clone(),
            hostname,
            capacity: host_capacity(config.max_runners),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// CPU and memory of this machine, with the given runner limit.
pub fn host_capacity(max_runners: u32) -> AgentCapacity {
    use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

    let sys = System::new_with_specifics(
        RefreshKind::new()
            .with_cpu(CpuRefreshKind::new())
            .with_memory(MemoryRefreshKind::new().with_ram()),
    );
    AgentCapacity {
        max_runners,
        cpu_cores: sys.cpus().len() as u32,
        memory_bytes: sys.total_memory(),
    }
}

/// Identity handed out by `RegisterAgent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub agent_id: String,
    pub sync_interval: Duration,
}

/// Provisioning tasks still running, keyed by runner id.
#[derive(Clone, Default)]
struct Provisions {
    tasks: Arc<Mutex<HashMap<RunnerId, JoinHandle<()>>>>,
}

impl Provisions {
    fn spawn<F>(&self, runner_id: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Held across the spawn so the task cannot deregister before it is
        // registered.
        let mut tasks = self.tasks.lock().expect("provisions lock");
        let registry = self.clone();
        let id = runner_id.to_string();
        let handle = tokio::spawn(async move {
            task.await;
            registry.tasks.lock().expect("provisions lock").remove(&id);
        });
        tasks.insert(runner_id.to_string(), handle);
    }

    fn take(&self, runner_id: &str) -> Option<JoinHandle<()>> {
        self.tasks.lock().expect("provisions lock").remove(runner_id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tasks.lock().expect("provisions lock").len()
    }
}

#[derive(Clone)]
pub struct SyncClient {
    config: SyncClientConfig,
    runners: RunnerManager,
    vm: Arc<dyn VmManager>,
    provisions: Provisions,
    span: Span,
}

impl SyncClient {
    pub fn new(config: SyncClientConfig, runners: RunnerManager, vm: Arc<dyn VmManager>) -> Self {
        Self {
            config,
            runners,
            vm,
            provisions: Provisions::default(),
            span: Span::none(),
        }
    }

    /// Parent span for the session and every command handler.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn runners(&self) -> &RunnerManager {
        &self.runners
    }

    async fn connect(&self) -> anyhow::Result<AgentServiceClient<Channel>> {
        let addr = format!("http://{}", self.config.server_addr);
        let client = AgentServiceClient::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {}", self.config.server_addr))?;
        Ok(client)
    }

    pub async fn register(
        &self,
        client: &mut AgentServiceClient<Channel>,
    ) -> anyhow::Result<Registration> {
        let resp = client
            .register_agent(proto::RegisterAgentRequest {
                hostname: self.config.hostname.clone(),
                capacity: Some(self.config.capacity.into()),
            })
            .await
            .context("failed to register agent")?
            .into_inner();

        let registration = Registration {
            agent_id: resp.agent_id,
            sync_interval: Duration::from_secs(u64::from(resp.sync_interval_seconds.max(1))),
        };
        info!(
            agent_id = %registration.agent_id,
            sync_interval = ?registration.sync_interval,
            "agent registered"
        );
        Ok(registration)
    }

    /// Register and sync until `shutdown` flips to `true`, reconnecting
    /// after every failed session.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            let ended = tokio::select! {
                res = self.session().instrument(self.span.clone()) => res,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            if let Err(e) = ended {
                self.span.in_scope(|| {
                    warn!(error = %e, delay = ?self.config.reconnect_delay, "sync session ended, reconnecting");
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
        self.span.in_scope(|| info!("sync client shutting down"));
        Ok(())
    }

    /// One register + stream lifetime; runs until either loop fails.
    async fn session(&self) -> anyhow::Result<()> {
        let mut client = self.connect().await?;
        let registration = self.register(&mut client).await?;
        let agent_id = registration.agent_id.as_str();

        let (tx, rx) = mpsc::channel::<proto::SyncRequest>(16);
        // The first message names the agent.
        tx.send(self.snapshot(agent_id)).await?;
        let inbound = client
            .sync(ReceiverStream::new(rx))
            .await
            .context("failed to open sync stream")?
            .into_inner();
        info!(%agent_id, "sync stream established");

        self.drive(inbound, &tx, registration.sync_interval, agent_id)
            .await
    }

    /// Run the receive and send loops until either one ends.
    async fn drive<S>(
        &self,
        inbound: S,
        tx: &mpsc::Sender<proto::SyncRequest>,
        interval: Duration,
        agent_id: &str,
    ) -> anyhow::Result<()>
    where
        S: Stream<Item = Result<proto::SyncResponse, Status>>,
    {
        tokio::select! {
            res = self.recv_loop(inbound, agent_id) => res,
            res = self.send_loop(tx, interval, agent_id) => res,
        }
    }

    async fn recv_loop<S>(&self, inbound: S, agent_id: &str) -> anyhow::Result<()>
    where
        S: Stream<Item = Result<proto::SyncResponse, Status>>,
    {
        tokio::pin!(inbound);
        loop {
            match inbound.next().await {
                Some(Ok(resp)) => self.dispatch(resp, agent_id),
                None => anyhow::bail!("coordinator closed the sync stream"),
                Some(Err(status)) => {
                    return Err(anyhow::Error::from(status).context("sync receive failed"));
                }
            }
        }
    }

    async fn send_loop(
        &self,
        tx: &mpsc::Sender<proto::SyncRequest>,
        interval: Duration,
        agent_id: &str,
    ) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_guests(),
                _ = self.runners.changed() => {}
            }
            tx.send(self.snapshot(agent_id))
                .await
                .context("sync send failed")?;
        }
    }

    /// Full state report for the coordinator.
    pub fn snapshot(&self, agent_id: &str) -> proto::SyncRequest {
        let runners: Vec<proto::Runner> = self
            .runners
            .list()
            .iter()
            .map(|r| proto::Runner {
                agent_id: agent_id.to_string(),
                ..proto::Runner::from(r)
            })
            .collect();
        proto::SyncRequest {
            agent_id: agent_id.to_string(),
            active_runners: runners.len() as u32,
            runners,
        }
    }

    /// Hand one received command to its handler task.
    pub fn dispatch(&self, response: proto::SyncResponse, agent_id: &str) {
        let command = match Command::try_from(response) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "ignoring malformed command");
                return;
            }
        };

        match command {
            Command::Noop => {}
            Command::CreateRunner {
                runner_id,
                runner_name,
                setup_script,
                request_id,
            } => {
                let span = info_span!(parent: &self.span, "create_runner", %runner_id, %request_id);
                let _guard = span.enter();
                info!(%runner_name, "creating runner");
                let runner = hangar_core::Runner::new(&runner_id, &runner_name, agent_id, &setup_script);
                if let Err(e) = self.runners.create(runner) {
                    error!(error = %e, "failed to accept runner");
                    return;
                }
                let runners = self.runners.clone();
                let vm = self.vm.clone();
                self.provisions.spawn(
                    &runner_id,
                    provision(runners, vm, runner_id.clone(), setup_script).instrument(span.clone()),
                );
            }
            Command::DeleteRunner {
                runner_id,
                request_id,
            } => {
                let span = info_span!(parent: &self.span, "delete_runner", %runner_id, %request_id);
                let runners = self.runners.clone();
                let vm = self.vm.clone();
                let in_flight = self.provisions.take(&runner_id);
                tokio::spawn(teardown(runners, vm, runner_id, in_flight).instrument(span));
            }
        }
    }

    /// Refresh the guest-reported job state of every reachable runner.
    fn poll_guests(&self) {
        for runner in self.runners.list() {
            if !runner.state.is_ready() {
                continue;
            }
            let runners = self.runners.clone();
            let vm = self.vm.clone();
            tokio::spawn(
                async move {
                    match vm.guest_status(&runner.id).await {
                        Ok(status) => {
                            let state = status.guest_state();
                            if state != runner.guest_state {
                                if let Err(e) = runners.update_guest_state(&runner.id, state) {
                                    warn!(runner_id = %runner.id, error = %e, "could not record guest state");
                                }
                            }
                        }
                        Err(e) => debug!(runner_id = %runner.id, error = %e, "guest status unavailable"),
                    }
                }
                .in_current_span(),
            );
        }
    }
}

// ── Command handlers ───────────────────────────────────────────────

/// Move the runner on, or report why the pipeline has to stop.
fn advance(runners: &RunnerManager, runner_id: &str, state: RunnerState) -> bool {
    match runners.update_state(runner_id, state) {
        Ok(()) => true,
        Err(e) => {
            warn!(%runner_id, %state, error = %e, "provisioning stopped");
            false
        }
    }
}

fn fail(runners: &RunnerManager, runner_id: &str, message: String) {
    error!(%runner_id, error = %message, "provisioning failed");
    if let Err(e) = runners.set_error(runner_id, &message) {
        warn!(%runner_id, error = %e, "could not record runner error");
    }
}

/// Drive a freshly accepted runner to RUNNING. Every failure parks the
/// runner in ERROR with a message naming the failed step.
pub async fn provision(
    runners: RunnerManager,
    vm: Arc<dyn VmManager>,
    runner_id: String,
    setup_script: String,
) {
    let id = runner_id.as_str();
    if !advance(&runners, id, RunnerState::Creating) {
        return;
    }
    if let Err(e) = vm.create(id).await {
        return fail(&runners, id, format!("VM creation failed: {e}"));
    }

    if !advance(&runners, id, RunnerState::Booting) {
        return;
    }
    match vm.start(id).await {
        Ok(ip) => {
            if let Err(e) = runners.set_ip_address(id, &ip) {
                warn!(%runner_id, error = %e, "could not record runner IP");
            }
        }
        Err(e) => return fail(&runners, id, format!("VM start failed: {e}")),
    }
    if let Err(e) = vm.wait_for_ssh(id).await {
        return fail(&runners, id, format!("SSH wait failed: {e}"));
    }

    if !advance(&runners, id, RunnerState::SshReady) {
        return;
    }
    info!(%runner_id, "runner SSH ready");
    if let Err(e) = vm.run_setup_script(id, &setup_script).await {
        return fail(&runners, id, format!("Setup script failed: {e}"));
    }

    if advance(&runners, id, RunnerState::Running) {
        let ip = runners.get(id).map(|r| r.ip_address).unwrap_or_default();
        info!(%runner_id, ip_address = %ip, "runner is now running");
    }
}

/// Tear the runner's VM down and forget it. Already-gone VMs and
/// runners count as deleted. `in_flight` is the runner's provisioning
/// task, aborted and awaited before the VM is touched.
pub async fn teardown(
    runners: RunnerManager,
    vm: Arc<dyn VmManager>,
    runner_id: String,
    in_flight: Option<JoinHandle<()>>,
) {
    let id = runner_id.as_str();
    info!("deleting runner");
    if let Some(task) = in_flight {
        task.abort();
        if task.await.is_err() {
            info!("in-flight provisioning cancelled");
        }
    }
    match runners.update_state(id, RunnerState::TearingDown) {
        Ok(()) => {}
        Err(RunnerError::NotFound(_)) => debug!("runner not tracked locally"),
        Err(e) => warn!(error = %e, "tearing down from unexpected state"),
    }

    if let Err(e) = vm.delete(id).await {
        if !e.is_not_found() {
            error!(error = %e, "failed to delete VM");
            if let Err(e) = runners.set_error(id, &format!("VM deletion failed: {e}")) {
                warn!(error = %e, "could not record runner error");
            }
            return;
        }
        warn!("VM bundle already deleted, continuing");
    }

    match runners.delete(id) {
        Ok(_) => info!("runner deleted"),
        Err(RunnerError::NotFound(_)) => info!("runner already removed"),
        Err(e) => error!(error = %e, "failed to remove runner"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use hangar_core::Runner;
    use hangar_vm::{ExecOutput, GuestStatus, VmError, VmInfo, VmResult};

    /// Scripted VM manager: every step succeeds unless told otherwise.
    #[derive(Default)]
    struct ScriptedVm {
        fail_at: Option<&'static str>,
        /// `start` never returns.
        hang_start: bool,
        /// Runner table that loses the runner while `start` runs.
        forget_on_start: Option<RunnerManager>,
        delete_error: Mutex<Option<VmError>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedVm {
        fn failing(step: &'static str) -> Self {
            Self {
                fail_at: Some(step),
                ..Default::default()
            }
        }

        fn step(&self, name: &str, runner_id: &str) -> VmResult<()> {
            self.calls.lock().unwrap().push(format!("{name}:{runner_id}"));
            if self.fail_at == Some(name) {
                return Err(VmError::Hypervisor(format!("{name} exploded")));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VmManager for ScriptedVm {
        async fn create(&self, runner_id: &str) -> VmResult<VmInfo> {
            self.step("create", runner_id)?;
            Ok(VmInfo {
                runner_id: runner_id.to_string(),
                bundle_path: format!("/tmp/{runner_id}.bundle").into(),
                ip_address: String::new(),
            })
        }

        async fn start(&self, runner_id: &str) -> VmResult<String> {
            self.step("start", runner_id)?;
            if let Some(runners) = &self.forget_on_start {
                runners.delete(runner_id).unwrap();
            }
            if self.hang_start {
                std::future::pending::<()>().await;
            }
            Ok("192.168.64.20".to_string())
        }

        async fn stop(&self, runner_id: &str) -> VmResult<()> {
            self.step("stop", runner_id)
        }

        async fn delete(&self, runner_id: &str) -> VmResult<()> {
            self.step("delete", runner_id)?;
            match self.delete_error.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn wait_for_ssh(&self, runner_id: &str) -> VmResult<()> {
            self.step("ssh", runner_id)
        }

        async fn run_setup_script(&self, runner_id: &str, _script: &str) -> VmResult<()> {
            self.step("setup", runner_id)
        }

        async fn exec(&self, runner_id: &str, _command: &str, _args: &[String]) -> VmResult<ExecOutput> {
            self.step("exec", runner_id)?;
            Ok(ExecOutput {
                output: String::new(),
                exit_code: 0,
                error: None,
            })
        }

        async fn guest_status(&self, runner_id: &str) -> VmResult<GuestStatus> {
            self.step("status", runner_id)?;
            Ok(GuestStatus {
                state: 2,
                runner_name: "ci".into(),
                repository: String::new(),
                labels: vec![],
                job: None,
                error_message: None,
            })
        }
    }

    fn accepted(runners: &RunnerManager, id: &str) {
        runners.create(Runner::new(id, "ci", "agent-1", "echo hi")).unwrap();
    }

    #[tokio::test]
    async fn provision_reaches_running_with_ip() {
        let runners = RunnerManager::new();
        accepted(&runners, "r1");
        let vm = Arc::new(ScriptedVm::default());

        provision(runners.clone(), vm.clone(), "r1".into(), "echo hi".into()).await;

        let runner = runners.get("r1").unwrap();
        assert_eq!(runner.state, RunnerState::Running);
        assert_eq!(runner.ip_address, "192.168.64.20");
        assert_eq!(vm.calls(), ["create:r1", "start:r1", "ssh:r1", "setup:r1"]);
    }

    #[tokio::test]
    async fn each_failed_step_names_itself() {
        for (step, prefix, ip) in [
            ("create", "VM creation failed: ", ""),
            ("start", "VM start failed: ", ""),
            ("ssh", "SSH wait failed: ", "192.168.64.20"),
            ("setup", "Setup script failed: ", "192.168.64.20"),
        ] {
            let runners = RunnerManager::new();
            accepted(&runners, "r1");
            let vm = Arc::new(ScriptedVm::failing(step));

            provision(runners.clone(), vm, "r1".into(), "echo hi".into()).await;

            let runner = runners.get("r1").unwrap();
            assert_eq!(runner.state, RunnerState::Error, "{step}");
            assert!(runner.error_message.starts_with(prefix), "{}", runner.error_message);
            assert!(runner.error_message.contains(&format!("{step} exploded")));
            assert_eq!(runner.ip_address, ip, "{step}");
        }
    }

    #[tokio::test]
    async fn runner_removed_mid_start_stops_provisioning() {
        let runners = RunnerManager::new();
        accepted(&runners, "r1");
        let vm = Arc::new(ScriptedVm {
            forget_on_start: Some(runners.clone()),
            ..Default::default()
        });

        // Recording the IP fails and is logged; the next transition stops the run.
        provision(runners.clone(), vm.clone(), "r1".into(), "echo hi".into()).await;

        assert!(runners.get("r1").is_err());
        assert_eq!(vm.calls(), ["create:r1", "start:r1", "ssh:r1"]);
    }

    #[tokio::test]
    async fn failed_teardown_of_untracked_runner_is_quiet() {
        let runners = RunnerManager::new();
        let vm = Arc::new(ScriptedVm::default());
        *vm.delete_error.lock().unwrap() = Some(VmError::Hypervisor("busy".into()));

        teardown(runners.clone(), vm.clone(), "r1".into(), None).await;

        assert_eq!(runners.count(), 0);
        assert_eq!(vm.calls(), ["delete:r1"]);
    }

    #[tokio::test]
    async fn teardown_removes_runner() {
        let runners = RunnerManager::new();
        accepted(&runners, "r1");
        let vm = Arc::new(ScriptedVm::default());
        provision(runners.clone(), vm.clone(), "r1".into(), String::new()).await;

        teardown(runners.clone(), vm.clone(), "r1".into(), None).await;
        assert!(runners.get("r1").is_err());
        assert!(vm.calls().contains(&"delete:r1".to_string()));
    }

    #[tokio::test]
    async fn teardown_of_unknown_runner_is_quiet_success() {
        let runners = RunnerManager::new();
        let vm = Arc::new(ScriptedVm::default());
        *vm.delete_error.lock().unwrap() = Some(VmError::NotFound("ghost".into()));

        teardown(runners.clone(), vm, "ghost".into(), None).await;
        assert_eq!(runners.count(), 0);
    }

    #[tokio::test]
    async fn teardown_failure_parks_runner_in_error() {
        let runners = RunnerManager::new();
        accepted(&runners, "r1");
        let vm = Arc::new(ScriptedVm::default());
        *vm.delete_error.lock().unwrap() = Some(VmError::Hypervisor("disk busy".into()));

        teardown(runners.clone(), vm, "r1".into(), None).await;
        let runner = runners.get("r1").unwrap();
        assert_eq!(runner.state, RunnerState::Error);
        assert!(runner.error_message.contains("disk busy"));
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(300), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn create_command(runner_id: &str) -> proto::SyncResponse {
        Command::CreateRunner {
            runner_id: runner_id.into(),
            runner_name: "ci".into(),
            setup_script: String::new(),
            request_id: format!("req-{runner_id}"),
        }
        .into()
    }

    fn delete_command(runner_id: &str) -> proto::SyncResponse {
        Command::DeleteRunner {
            runner_id: runner_id.into(),
            request_id: format!("del-{runner_id}"),
        }
        .into()
    }

    fn client(vm: Arc<dyn VmManager>) -> SyncClient {
        SyncClient::new(
            SyncClientConfig {
                server_addr: "127.0.0.1:1".into(),
                hostname: "mac-1".into(),
                capacity: AgentCapacity {
                    max_runners: 2,
                    ..Default::default()
                },
                reconnect_delay: Duration::from_millis(10),
            },
            RunnerManager::new(),
            vm,
        )
    }

    #[test]
    fn snapshot_stamps_current_agent_id() {
        let client = client(Arc::new(ScriptedVm::default()));
        client
            .runners()
            .create(Runner::new("r1", "ci", "old-agent", ""))
            .unwrap();

        let snapshot = client.snapshot("new-agent");
        assert_eq!(snapshot.agent_id, "new-agent");
        assert_eq!(snapshot.active_runners, 1);
        assert_eq!(snapshot.runners[0].agent_id, "new-agent");
        assert_eq!(snapshot.runners[0].runner_id, "r1");
    }

    #[tokio::test]
    async fn dispatch_create_then_duplicate_is_ignored() {
        let vm = Arc::new(ScriptedVm::default());
        let client = client(vm.clone());
        let create = Command::CreateRunner {
            runner_id: "r1".into(),
            runner_name: "ci".into(),
            setup_script: String::new(),
            request_id: "req-1".into(),
        };
        client.dispatch(create.clone().into(), "agent-1");
        client.dispatch(create.into(), "agent-1");
        client.dispatch(Command::Noop.into(), "agent-1");

        tokio::time::timeout(Duration::from_secs(2), async {
            while client.runners().get("r1").map(|r| r.state) != Ok(RunnerState::Running) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(client.runners().count(), 1);
        assert_eq!(vm.calls().iter().filter(|c| c.starts_with("create")).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_keeps_retrying_until_shutdown() {
        let client = client(Arc::new(ScriptedVm::default()));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { client.run(rx).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delete_during_boot_aborts_provisioning() {
        let vm = Arc::new(ScriptedVm {
            hang_start: true,
            ..Default::default()
        });
        let client = client(vm.clone());

        client.dispatch(create_command("r1"), "agent-1");
        wait_for(|| client.runners().get("r1").map(|r| r.state) == Ok(RunnerState::Booting)).await;
        assert_eq!(client.provisions.len(), 1);

        client.dispatch(delete_command("r1"), "agent-1");
        wait_for(|| client.runners().get("r1").is_err()).await;

        assert_eq!(client.provisions.len(), 0);
        assert_eq!(vm.calls(), ["create:r1", "start:r1", "delete:r1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_provisioning_deregisters_itself() {
        let client = client(Arc::new(ScriptedVm::default()));
        client.dispatch(create_command("r1"), "agent-1");
        wait_for(|| client.runners().get("r1").map(|r| r.state) == Ok(RunnerState::Running)).await;
        wait_for(|| client.provisions.len() == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn delete_while_waiting_for_ip_hands_next_guest_to_next_runner() {
        use hangar_vm::fake::{FakeHypervisor, FakeShell};
        use hangar_vm::{GuestShimClient, IpArbiter, VmLifecycleManager};

        let dir = tempfile::tempdir().unwrap();
        let hypervisor = Arc::new(FakeHypervisor::new());
        let arbiter = IpArbiter::new();
        let vm = Arc::new(VmLifecycleManager::new(
            hypervisor.clone(),
            arbiter.clone(),
            Arc::new(FakeShell::new()),
            GuestShimClient::new(1),
            dir.path().join("template"),
            dir.path().join("runners"),
        ));
        let client = client(vm);

        // No guest announces for r1, so it parks in the IP wait.
        client.dispatch(create_command("r1"), "agent-1");
        wait_for(|| arbiter.pending() == 1).await;

        client.dispatch(delete_command("r1"), "agent-1");
        wait_for(|| client.runners().get("r1").is_err()).await;
        assert_eq!(arbiter.pending(), 0);

        hypervisor.announce_via(arbiter.clone(), "192.168.64.30");
        client.dispatch(create_command("r2"), "agent-1");
        wait_for(|| client.runners().get("r2").map(|r| r.state) == Ok(RunnerState::Running)).await;
        assert_eq!(client.runners().get("r2").unwrap().ip_address, "192.168.64.30");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_inbound_stream_ends_session() {
        let client = client(Arc::new(ScriptedVm::default()));
        let (tx, _rx) = mpsc::channel(16);
        let inbound = tokio_stream::empty::<Result<proto::SyncResponse, Status>>();

        let err = client
            .drive(inbound, &tx, Duration::from_secs(3600), "agent-1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("closed the sync stream"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_ends_session() {
        let client = client(Arc::new(ScriptedVm::default()));
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        // The coordinator never sends anything; only the send side can fail.
        let inbound = tokio_stream::pending::<Result<proto::SyncResponse, Status>>();
        client
            .runners()
            .create(Runner::new("r1", "ci", "agent-1", ""))
            .unwrap();

        let err = client
            .drive(inbound, &tx, Duration::from_secs(30), "agent-1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sync send failed"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn received_command_shows_up_in_next_snapshot() {
        let client = client(Arc::new(ScriptedVm::default()));
        let (tx, mut rx) = mpsc::channel(16);
        let inbound = tokio_stream::iter(vec![Ok::<_, Status>(create_command("r1"))])
            .chain(tokio_stream::pending());

        let session = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .drive(inbound, &tx, Duration::from_secs(30), "agent-1")
                    .await
            })
        };

        let snapshot = loop {
            let snapshot = rx.recv().await.unwrap();
            if snapshot.runners.iter().any(|r| r.runner_id == "r1") {
                break snapshot;
            }
        };
        assert_eq!(snapshot.agent_id, "agent-1");
        assert!(!session.is_finished());
        session.abort();
    }
}
