//! Autoscaler-facing `InstanceService`: AddInstance / DeleteInstance.
//!
//! Both handlers only queue a command for the owning agent and then poll
//! the store until the agent's snapshots show the outcome. Nothing here
//! talks to an agent directly.
//!
//! A delete can arrive before the agent has reported the runner at all.
//! If the create is still queued it is withdrawn; otherwise the handler
//! waits for the first report and deletes as usual.

use std::sync::Arc;
use std::time::Duration;

use hangar_core::config::CoordinatorConfig;
use hangar_core::{Runner, RunnerState};
use hangar_metrics::MetricsCollector;
use hangar_scheduler::AgentSelector;
use hangar_state::{StateError, Store};
use thiserror::Error;
use tokio::time::Instant;
use tonic::{Request, Response, Status};
use tracing::{Instrument, Span, info, info_span, warn};

use crate::commands::{Command, CommandQueue};
use crate::proto;
use crate::proto::instance_service_server::InstanceService;

/// Reported back to the autoscaler as the instance type.
pub const SHOES_TYPE: &str = "hangar";

/// gRPC metadata key carrying a caller-supplied request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// External id handed out for `runner_id`.
pub fn external_id_for(runner_id: &str) -> String {
    format!("hangar-{runner_id}")
}

#[derive(Debug, Clone, Copy)]
pub struct HandlerTimeouts {
    pub add_instance: Duration,
    pub delete_instance: Duration,
    pub poll_interval: Duration,
}

impl Default for HandlerTimeouts {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

impl From<&CoordinatorConfig> for HandlerTimeouts {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            add_instance: config.add_instance_timeout(),
            delete_instance: config.delete_instance_timeout(),
            poll_interval: config.state_poll_interval(),
        }
    }
}

#[derive(Debug, Error)]
enum WaitError {
    #[error("runner entered error state: {0}")]
    RunnerFailed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl WaitError {
    /// `(request status, failure reason)` labels for metrics.
    fn labels(&self) -> (&'static str, &'static str) {
        match self {
            WaitError::RunnerFailed(_) => ("failed_runner_error", "runner_error"),
            WaitError::Timeout(_) => ("failed_timeout", "startup_timeout"),
        }
    }
}

/// gRPC implementation of `InstanceService`.
pub struct InstanceServer {
    store: Store,
    scheduler: Arc<dyn AgentSelector>,
    commands: CommandQueue,
    timeouts: HandlerTimeouts,
    metrics: MetricsCollector,
    span: Span,
}

impl InstanceServer {
    pub fn new(store: Store, scheduler: Arc<dyn AgentSelector>, commands: CommandQueue) -> Self {
        let metrics = MetricsCollector::new(
            store.clone(),
            CoordinatorConfig::default().metrics_interval(),
        );
        Self {
            store,
            scheduler,
            commands,
            timeouts: HandlerTimeouts::default(),
            metrics,
            span: Span::none(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: HandlerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Record request outcomes into a shared collector.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> proto::instance_service_server::InstanceServiceServer<Self> {
        proto::instance_service_server::InstanceServiceServer::new(self)
    }

    /// Poll until the runner is SSH-ready (or further along).
    async fn wait_until_ready(&self, runner_id: &str) -> Result<Runner, WaitError> {
        let timeout = self.timeouts.add_instance;
        let poll = async {
            loop {
                tokio::time::sleep(self.timeouts.poll_interval).await;
                // Not reported yet is not an error.
                let Ok(runner) = self.store.get_runner(runner_id) else {
                    continue;
                };
                if runner.state.is_ready() {
                    return Ok(runner);
                }
                if runner.state == RunnerState::Error {
                    return Err(WaitError::RunnerFailed(runner.error_message));
                }
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| WaitError::Timeout(timeout))?
    }

    /// Poll until the runner's first report lands in the store.
    async fn wait_until_reported(&self, runner_id: &str) -> Result<Runner, WaitError> {
        let timeout = self.timeouts.delete_instance;
        let poll = async {
            loop {
                if let Ok(runner) = self.store.get_runner(runner_id) {
                    return runner;
                }
                tokio::time::sleep(self.timeouts.poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| WaitError::Timeout(timeout))
    }

    /// Poll until the store no longer knows the runner.
    async fn wait_until_removed(&self, runner_id: &str) -> Result<(), WaitError> {
        let timeout = self.timeouts.delete_instance;
        let poll = async {
            while self.store.get_runner(runner_id).is_ok() {
                tokio::time::sleep(self.timeouts.poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| WaitError::Timeout(timeout))
    }
}

fn request_id<T>(request: &Request<T>) -> String {
    request
        .metadata()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[tonic::async_trait]
impl InstanceService for InstanceServer {
    async fn add_instance(
        &self,
        request: Request<proto::AddInstanceRequest>,
    ) -> Result<Response<proto::AddInstanceResponse>, Status> {
        let request_id = request_id(&request);
        let req = request.into_inner();
        let span = info_span!(parent: &self.span, "add_instance", %request_id);

        async move {
            info!(
                runner_name = %req.runner_name,
                resource_type = %req.resource_type,
                "add instance requested"
            );

            let started = Instant::now();
            let agent_id = match self.scheduler.select_agent() {
                Ok(agent_id) => agent_id,
                Err(e) => {
                    warn!(error = %e, "placement failed");
                    self.metrics
                        .record_add_instance("failed_no_agent", started.elapsed())
                        .await;
                    return Err(Status::unavailable(format!("no available agent: {e}")));
                }
            };

            let runner_id = uuid::Uuid::new_v4().to_string();
            let cloud_id = external_id_for(&runner_id);
            info!(%runner_id, %cloud_id, %agent_id, "creating runner");

            self.store.register_external_id(&cloud_id, &runner_id);
            self.commands.enqueue(
                &agent_id,
                Command::CreateRunner {
                    runner_id: runner_id.clone(),
                    runner_name: req.runner_name,
                    setup_script: req.setup_script,
                    request_id: request_id.clone(),
                },
            );

            let runner = match self.wait_until_ready(&runner_id).await {
                Ok(runner) => runner,
                Err(e) => {
                    warn!(%runner_id, error = %e, "runner failed to start");
                    let (status, reason) = e.labels();
                    self.metrics.record_runner_failure(reason).await;
                    self.metrics.record_add_instance(status, started.elapsed()).await;
                    return Err(Status::internal(format!("runner failed to start: {e}")));
                }
            };
            self.metrics.record_runner_startup(started.elapsed()).await;
            self.metrics.record_add_instance("success", started.elapsed()).await;

            info!(%runner_id, ip_address = %runner.ip_address, state = %runner.state, "runner ready");
            Ok(Response::new(proto::AddInstanceResponse {
                cloud_id,
                shoes_type: SHOES_TYPE.to_string(),
                ip_address: runner.ip_address,
            }))
        }
        .instrument(span)
        .await
    }

    async fn delete_instance(
        &self,
        request: Request<proto::DeleteInstanceRequest>,
    ) -> Result<Response<proto::DeleteInstanceResponse>, Status> {
        let request_id = request_id(&request);
        let req = request.into_inner();
        let span = info_span!(parent: &self.span, "delete_instance", %request_id, cloud_id = %req.cloud_id);

        async move {
            info!("delete instance requested");

            let runner = match self.store.get_runner_by_external_id(&req.cloud_id) {
                Ok(runner) => runner,
                Err(StateError::RunnerNotFound(runner_id)) => {
                    // Registered at placement, never reported.
                    if let Some(agent_id) = self.commands.withdraw_create(&runner_id) {
                        self.store.forget_external_id(&req.cloud_id);
                        info!(%runner_id, %agent_id, "create withdrawn before delivery");
                        self.metrics.record_delete_instance("withdrawn").await;
                        return Ok(Response::new(proto::DeleteInstanceResponse {}));
                    }
                    info!(%runner_id, "create already delivered, waiting for first report");
                    match self.wait_until_reported(&runner_id).await {
                        Ok(runner) => runner,
                        Err(e) => {
                            warn!(%runner_id, error = %e, "runner never reported");
                            self.store.forget_external_id(&req.cloud_id);
                            self.metrics.record_delete_instance("never_reported").await;
                            return Ok(Response::new(proto::DeleteInstanceResponse {}));
                        }
                    }
                }
                Err(e) if e.is_not_found() => {
                    info!(error = %e, "runner already gone");
                    self.metrics.record_delete_instance("already_gone").await;
                    return Ok(Response::new(proto::DeleteInstanceResponse {}));
                }
                Err(e) => {
                    self.metrics.record_delete_instance("failed_lookup").await;
                    return Err(Status::internal(e.to_string()));
                }
            };

            let agent_id = match self.store.get_agent_for_runner(&runner.id) {
                Ok(agent_id) => agent_id,
                Err(e) => {
                    self.metrics.record_delete_instance("failed_get_agent").await;
                    return Err(Status::internal(format!("failed to get agent: {e}")));
                }
            };

            info!(runner_id = %runner.id, %agent_id, "deleting runner");
            self.commands.enqueue(
                &agent_id,
                Command::DeleteRunner {
                    runner_id: runner.id.clone(),
                    request_id: request_id.clone(),
                },
            );

            match self.wait_until_removed(&runner.id).await {
                Ok(()) => self.metrics.record_delete_instance("success").await,
                Err(e) => {
                    warn!(runner_id = %runner.id, error = %e, "runner removal not confirmed");
                    self.metrics.record_delete_instance("unconfirmed").await;
                }
            }

            info!(runner_id = %runner.id, "delete instance completed");
            Ok(Response::new(proto::DeleteInstanceResponse {}))
        }
        .instrument(span)
        .await
    }
}
