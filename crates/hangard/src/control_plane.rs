//! Coordinator mode: serves the agent and instance gRPC services, the
//! read-only HTTP API, and runs the ERROR sweeper.
//!
//! In this mode, the daemon:
//! 1. Creates the in-memory store and per-agent command queues
//! 2. Serves `AgentService` + `InstanceService` over gRPC
//! 3. Serves the HTTP API (separate port)
//! 4. Sweeps runners stuck in ERROR in the background
//! 5. Refreshes fleet metrics for `/metrics` on a fixed interval
//!
//! Nothing is persisted. After a restart agents re-register and
//! re-report their runners.

use std::net::SocketAddr;
use std::sync::Arc;

use hangar_cluster::api::{self, ApiState};
use hangar_cluster::{AgentServer, CommandQueue, ErrorSweeper, HandlerTimeouts, InstanceServer};
use hangar_core::config::CoordinatorConfig;
use hangar_metrics::MetricsCollector;
use hangar_scheduler::CapacityScheduler;
use hangar_state::Store;
use tokio::sync::watch;
use tower_http::LatencyUnit;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Instrument, Level, info, info_span};

/// The gRPC services of one coordinator, sharing a store and queues.
pub struct CoordinatorServices {
    pub store: Store,
    pub commands: CommandQueue,
    pub agents: AgentServer,
    pub instances: InstanceServer,
    pub metrics: MetricsCollector,
}

pub fn build_services(config: &CoordinatorConfig) -> CoordinatorServices {
    let store = Store::new();
    let commands = CommandQueue::new();
    let scheduler = Arc::new(CapacityScheduler::new(store.clone()));
    let metrics = MetricsCollector::new(store.clone(), config.metrics_interval());

    let agents = AgentServer::new(store.clone(), commands.clone())
        .with_sync_interval(config.sync_interval_secs as u32)
        .with_span(info_span!("agent_service", component = "agent_service"));
    let instances = InstanceServer::new(store.clone(), scheduler, commands.clone())
        .with_timeouts(HandlerTimeouts::from(config))
        .with_metrics(metrics.clone())
        .with_span(info_span!("instance_service", component = "instance_service"));

    CoordinatorServices {
        store,
        commands,
        agents,
        instances,
        metrics,
    }
}

/// Run the coordinator until Ctrl-C.
pub async fn run_coordinator(config: CoordinatorConfig) -> anyhow::Result<()> {
    info!("hangar daemon starting in coordinator mode");

    let services = build_services(&config);
    let api_state = ApiState {
        store: services.store.clone(),
        streams: services.agents.streams(),
        metrics: services.metrics.clone(),
    };

    // ── Shutdown signal ──────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut grpc_shutdown = shutdown_rx.clone();
    let mut http_shutdown = shutdown_rx.clone();

    // ── gRPC server ──────────────────────────────────────────────
    let grpc_addr: SocketAddr = config.grpc_addr.parse()?;
    info!(%grpc_addr, "gRPC server starting (agents + instances)");

    let trace = TraceLayer::new_for_grpc()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(
            DefaultOnResponse::new()
                .level(Level::INFO)
                .latency_unit(LatencyUnit::Millis),
        );
    let agents = services.agents;
    let instances = services.instances;
    let grpc_handle = tokio::spawn(async move {
        if let Err(e) = tonic::transport::Server::builder()
            .layer(trace)
            .add_service(agents.into_service())
            .add_service(instances.into_service())
            .serve_with_shutdown(grpc_addr, async move {
                let _ = grpc_shutdown.wait_for(|stop| *stop).await;
            })
            .await
        {
            tracing::error!(error = %e, "gRPC server error");
        }
    });

    // ── Background tasks ─────────────────────────────────────────
    let sweeper = ErrorSweeper::new(services.store.clone(), services.commands.clone())
        .with_interval(config.sweep_interval())
        .with_grace_period(config.error_grace_period())
        .with_span(info_span!("error_sweeper", component = "error_sweeper"))
        .start();

    let metrics = services.metrics;
    let metrics_shutdown = shutdown_rx.clone();
    let metrics_handle = tokio::spawn(
        async move { metrics.run(metrics_shutdown).await }
            .instrument(info_span!("metrics", component = "metrics")),
    );

    // ── HTTP API ─────────────────────────────────────────────────
    let http_addr: SocketAddr = config.http_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP API starting");

    let http_handle = tokio::spawn(async move {
        let server = axum::serve(listener, api::build_router(api_state)).with_graceful_shutdown(
            async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            },
        );
        if let Err(e) = server.await {
            tracing::error!(error = %e, "HTTP API error");
        }
    });

    // ── Wait for shutdown ────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    sweeper.stop().await;
    let _ = metrics_handle.await;
    let _ = grpc_handle.await;
    let _ = http_handle.await;

    info!("coordinator stopped");
    Ok(())
}
