//! Agent-facing gRPC service: coordinator side of the sync protocol.
//!
//! ```text
//!   agent                              coordinator
//!     │ RegisterAgent(hostname, cap) ──▶ mint id, store ONLINE
//!     │◀── (agent_id, interval) ───────┘
//!     │ Sync ══════════════════════════▶ per stream task:
//!     │   snapshot ───────────────────▶   mark ONLINE
//!     │                                    reconcile runners in Store
//!     │◀────────── one command ───────    pop queue (or Noop)
//!     │   ...                              stream end → OFFLINE
//! ```

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hangar_core::{Agent, AgentCapacity, AgentId, AgentStatus, Runner};
use hangar_state::Store;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::commands::{Command, CommandQueue};
use crate::proto;
use crate::proto::agent_service_server::AgentService;

/// Interval suggested to agents at registration.
pub const DEFAULT_SYNC_INTERVAL_SECS: u32 = 5;

type SyncStream = Pin<Box<dyn Stream<Item = Result<proto::SyncResponse, Status>> + Send>>;

/// Live sync streams keyed by agent id. Each attach gets a fresh
/// generation so a stale stream ending cannot detach its successor.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<Mutex<HashMap<AgentId, u64>>>,
    next: Arc<AtomicU64>,
}

impl StreamRegistry {
    fn attach(&self, agent_id: &str) -> u64 {
        let generation = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.streams
            .lock()
            .expect("stream registry lock")
            .insert(agent_id.to_string(), generation);
        generation
    }

    /// Returns whether `generation` was still the live stream.
    fn detach(&self, agent_id: &str, generation: u64) -> bool {
        let mut streams = self.streams.lock().expect("stream registry lock");
        if streams.get(agent_id) == Some(&generation) {
            streams.remove(agent_id);
            true
        } else {
            false
        }
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.streams
            .lock()
            .expect("stream registry lock")
            .contains_key(agent_id)
    }

    pub fn connected(&self) -> usize {
        self.streams.lock().expect("stream registry lock").len()
    }
}

/// gRPC implementation of `AgentService`.
#[derive(Clone)]
pub struct AgentServer {
    store: Store,
    commands: CommandQueue,
    streams: StreamRegistry,
    sync_interval_secs: u32,
    span: Span,
}

impl AgentServer {
    pub fn new(store: Store, commands: CommandQueue) -> Self {
        Self {
            store,
            commands,
            streams: StreamRegistry::default(),
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            span: Span::none(),
        }
    }

    pub fn with_sync_interval(mut self, secs: u32) -> Self {
        self.sync_interval_secs = secs;
        self
    }

    /// Parent span for registration and every sync stream task.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn streams(&self) -> StreamRegistry {
        self.streams.clone()
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> proto::agent_service_server::AgentServiceServer<Self> {
        proto::agent_service_server::AgentServiceServer::new(self)
    }

    /// Drive one agent's stream until it ends.
    async fn run_stream(
        self,
        mut inbound: Streaming<proto::SyncRequest>,
        tx: mpsc::Sender<Result<proto::SyncResponse, Status>>,
    ) {
        let mut session: Option<(AgentId, u64)> = None;

        loop {
            let snapshot = match inbound.message().await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => {
                    debug!("agent closed sync stream");
                    break;
                }
                Err(status) => {
                    warn!(error = %status, "sync stream failed");
                    break;
                }
            };

            let agent_id = match &session {
                Some((agent_id, _)) => agent_id.clone(),
                None => {
                    let agent_id = snapshot.agent_id.clone();
                    let generation = self.streams.attach(&agent_id);
                    info!(%agent_id, "agent connected");
                    session = Some((agent_id.clone(), generation));
                    agent_id
                }
            };

            if let Err(e) = self.store.update_agent_status(&agent_id, AgentStatus::Online) {
                if e.is_not_found() {
                    // Registered with a previous coordinator; make it re-register.
                    warn!(%agent_id, "sync from unknown agent");
                    let _ = tx
                        .send(Err(Status::not_found(format!(
                            "agent {agent_id} is not registered"
                        ))))
                        .await;
                    if let Some((agent_id, generation)) = session.take() {
                        self.streams.detach(&agent_id, generation);
                    }
                    return;
                }
                error!(%agent_id, error = %e, "failed to update agent status");
            }

            let runners: Vec<Runner> = snapshot.runners.into_iter().map(Runner::from).collect();
            debug!(
                %agent_id,
                active = snapshot.active_runners,
                reported = runners.len(),
                "snapshot received"
            );
            if let Err(e) = self.store.update_agent_runners(&agent_id, runners) {
                error!(%agent_id, error = %e, "failed to update agent runners");
            }

            let command = self.commands.next(&agent_id);
            if command != Command::Noop {
                info!(%agent_id, command = command.kind(), "command delivered");
            }
            if tx.send(Ok(command.into())).await.is_err() {
                warn!(%agent_id, "agent went away before reply was sent");
                break;
            }
        }

        let Some((agent_id, generation)) = session else {
            return;
        };
        if self.streams.detach(&agent_id, generation) {
            info!(%agent_id, "agent disconnected");
            if let Err(e) = self.store.update_agent_status(&agent_id, AgentStatus::Offline) {
                error!(%agent_id, error = %e, "failed to update agent status");
            }
        }
    }
}

#[tonic::async_trait]
impl AgentService for AgentServer {
    async fn register_agent(
        &self,
        request: Request<proto::RegisterAgentRequest>,
    ) -> Result<Response<proto::RegisterAgentResponse>, Status> {
        let req = request.into_inner();
        let agent_id = uuid::Uuid::new_v4().to_string();
        let capacity: AgentCapacity = req.capacity.map(Into::into).unwrap_or_default();

        self.store.register_agent(Agent {
            id: agent_id.clone(),
            hostname: req.hostname.clone(),
            capacity,
            status: AgentStatus::Online,
        });

        self.span.in_scope(|| {
            info!(
                %agent_id,
                hostname = %req.hostname,
                max_runners = capacity.max_runners,
                "agent registered"
            );
        });

        Ok(Response::new(proto::RegisterAgentResponse {
            agent_id,
            sync_interval_seconds: self.sync_interval_secs,
        }))
    }

    type SyncStream = SyncStream;

    async fn sync(
        &self,
        request: Request<Streaming<proto::SyncRequest>>,
    ) -> Result<Response<Self::SyncStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let span = info_span!(parent: &self.span, "sync_stream");
        tokio::spawn(self.clone().run_stream(inbound, tx).instrument(span));
        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hangar_core::RunnerState;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::transport::{Channel, Server};

    use crate::proto::agent_service_client::AgentServiceClient;
    use crate::proto::sync_response::Command as WireCommand;

    async fn spawn_server(server: AgentServer) -> AgentServiceClient<Channel> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            Server::builder()
                .add_service(server.into_service())
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });
        AgentServiceClient::connect(format!("http://{addr}")).await.unwrap()
    }

    async fn register(client: &mut AgentServiceClient<Channel>) -> String {
        client
            .register_agent(proto::RegisterAgentRequest {
                hostname: "mac-mini-1".into(),
                capacity: Some(proto::AgentCapacity {
                    max_runners: 2,
                    cpu_cores: 8,
                    memory_bytes: 16 << 30,
                }),
            })
            .await
            .unwrap()
            .into_inner()
            .agent_id
    }

    fn snapshot(agent_id: &str, runners: Vec<proto::Runner>) -> proto::SyncRequest {
        proto::SyncRequest {
            agent_id: agent_id.into(),
            active_runners: runners.len() as u32,
            runners,
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn register_mints_online_agent() {
        let store = Store::new();
        let mut client = spawn_server(AgentServer::new(store.clone(), CommandQueue::new())).await;

        let resp = client
            .register_agent(proto::RegisterAgentRequest {
                hostname: "mac-mini-1".into(),
                capacity: None,
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.sync_interval_seconds, DEFAULT_SYNC_INTERVAL_SECS);
        assert!(uuid::Uuid::parse_str(&resp.agent_id).is_ok());

        let agent = store.get_agent(&resp.agent_id).unwrap();
        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(agent.hostname, "mac-mini-1");
    }

    #[tokio::test]
    async fn each_snapshot_gets_one_reply_in_queue_order() {
        let store = Store::new();
        let commands = CommandQueue::new();
        let server = AgentServer::new(store.clone(), commands.clone());
        let streams = server.streams();
        let mut client = spawn_server(server).await;
        let agent_id = register(&mut client).await;

        let (tx, rx) = mpsc::channel(4);
        tx.send(snapshot(&agent_id, vec![])).await.unwrap();
        let mut inbound = client.sync(ReceiverStream::new(rx)).await.unwrap().into_inner();

        let first = inbound.message().await.unwrap().unwrap();
        assert!(matches!(first.command, Some(WireCommand::Noop(_))));
        assert!(streams.is_connected(&agent_id));

        commands.enqueue(
            &agent_id,
            Command::DeleteRunner {
                runner_id: "r1".into(),
                request_id: "req-1".into(),
            },
        );
        let runner = proto::Runner {
            runner_id: "r1".into(),
            runner_name: "ci-1".into(),
            agent_id: agent_id.clone(),
            state: proto::RunnerState::Running as i32,
            ip_address: "192.168.64.3".into(),
            ..Default::default()
        };
        tx.send(snapshot(&agent_id, vec![runner])).await.unwrap();

        let second = inbound.message().await.unwrap().unwrap();
        match second.command {
            Some(WireCommand::DeleteRunner(cmd)) => {
                assert_eq!(cmd.runner_id, "r1");
                assert_eq!(cmd.request_id, "req-1");
            }
            other => panic!("unexpected reply {other:?}"),
        }
        let stored = store.get_runner("r1").unwrap();
        assert_eq!(stored.state, RunnerState::Running);
        assert_eq!(stored.ip_address, "192.168.64.3");

        drop(tx);
        wait_for(|| store.get_agent(&agent_id).unwrap().status == AgentStatus::Offline).await;
        assert!(!streams.is_connected(&agent_id));
        assert_eq!(streams.connected(), 0);
    }

    #[tokio::test]
    async fn unknown_agent_is_told_to_reregister() {
        let store = Store::new();
        let mut client = spawn_server(AgentServer::new(store.clone(), CommandQueue::new())).await;

        let (tx, rx) = mpsc::channel(1);
        tx.send(snapshot("forgotten", vec![])).await.unwrap();
        let mut inbound = client.sync(ReceiverStream::new(rx)).await.unwrap().into_inner();

        let status = inbound.message().await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert!(store.get_agent("forgotten").is_err());
    }

    #[test]
    fn stale_stream_cannot_detach_successor() {
        let streams = StreamRegistry::default();
        let old = streams.attach("agent-1");
        let new = streams.attach("agent-1");
        assert!(!streams.detach("agent-1", old));
        assert!(streams.is_connected("agent-1"));
        assert!(streams.detach("agent-1", new));
        assert!(!streams.is_connected("agent-1"));
    }
}
