//! Metrics collector: fleet gauges plus request counters.
//!
//! Gauges are a [`FleetSnapshot`] recomputed from the store by
//! [`MetricsCollector::collect`]. Counters only ever grow; they are never
//! reset by a collection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hangar_core::{AgentStatus, GuestRunnerState, RunnerState};
use hangar_state::Store;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info};

use crate::prometheus::render_prometheus;

/// Upper bounds, in seconds, of the duration histogram buckets.
pub const DURATION_BUCKETS: [f64; 6] = [10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// Fixed-bucket histogram with cumulative bucket counts.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub bounds: Vec<f64>,
    /// `buckets[i]` counts observations `<= bounds[i]`.
    pub buckets: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

impl Histogram {
    pub fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            buckets: vec![0; bounds.len()],
            sum: 0.0,
            count: 0,
        }
    }

    pub fn observe(&mut self, value: f64) {
        for (bound, bucket) in self.bounds.iter().zip(self.buckets.iter_mut()) {
            if value <= *bound {
                *bucket += 1;
            }
        }
        self.sum += value;
        self.count += 1;
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new(&DURATION_BUCKETS)
    }
}

/// Configured and used slots of one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLoad {
    pub agent_id: String,
    pub hostname: String,
    pub max_runners: u32,
    /// Runners occupying a slot.
    pub current_runners: usize,
}

/// Point-in-time gauges over the whole fleet.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetSnapshot {
    /// Every reportable state, zero counts included.
    pub runners_by_state: Vec<(RunnerState, usize)>,
    pub runners_idle: usize,
    pub runners_busy: usize,
    pub runner_errors: usize,
    pub agents_by_status: Vec<(AgentStatus, usize)>,
    pub agents_online: usize,
    pub agents: Vec<AgentLoad>,
    /// Sum of `max_runners` over online agents.
    pub capacity_total: u32,
    pub capacity_available: u32,
    /// Occupied share of `capacity_total`, 0 when there is no capacity.
    pub utilization: f64,
}

impl FleetSnapshot {
    pub fn from_store(store: &Store) -> Self {
        let runners = store.list_runners();
        let agents = store.list_agents();

        let runners_by_state = RunnerState::ALL
            .into_iter()
            .filter(|s| *s != RunnerState::Unspecified)
            .map(|state| (state, runners.iter().filter(|r| r.state == state).count()))
            .collect();
        let guests_in = |guest: GuestRunnerState| {
            runners.iter().filter(|r| r.guest_state == guest).count()
        };

        let agents_by_status = AgentStatus::ALL
            .into_iter()
            .filter(|s| *s != AgentStatus::Unspecified)
            .map(|status| (status, agents.iter().filter(|a| a.status == status).count()))
            .collect();

        let loads: Vec<AgentLoad> = agents
            .iter()
            .map(|a| AgentLoad {
                agent_id: a.id.clone(),
                hostname: a.hostname.clone(),
                max_runners: a.capacity.max_runners,
                current_runners: store.get_runner_count(&a.id),
            })
            .collect();

        let (agents_online, capacity_total, occupied) = loads
            .iter()
            .zip(&agents)
            .filter(|(_, a)| a.status == AgentStatus::Online)
            .fold((0usize, 0u32, 0u32), |(n, total, used), (load, _)| {
                (n + 1, total + load.max_runners, used + load.current_runners as u32)
            });
        let utilization = if capacity_total > 0 {
            f64::from(occupied) / f64::from(capacity_total)
        } else {
            0.0
        };

        Self {
            runners_by_state,
            runners_idle: guests_in(GuestRunnerState::Idle),
            runners_busy: guests_in(GuestRunnerState::Running),
            runner_errors: runners.iter().filter(|r| r.state == RunnerState::Error).count(),
            agents_by_status,
            agents_online,
            agents: loads,
            capacity_total,
            capacity_available: capacity_total.saturating_sub(occupied),
            utilization,
        }
    }
}

impl Default for FleetSnapshot {
    fn default() -> Self {
        Self::from_store(&Store::new())
    }
}

/// Counters and histograms fed by the instance handlers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestMetrics {
    /// AddInstance outcomes by status.
    pub add_instance: BTreeMap<String, u64>,
    /// DeleteInstance outcomes by status.
    pub delete_instance: BTreeMap<String, u64>,
    /// Failed runner starts by reason.
    pub runner_failures: BTreeMap<String, u64>,
    pub add_instance_duration: Histogram,
    /// Placement to SSH-ready, successful starts only.
    pub runner_startup_duration: Histogram,
}

/// Shared handle; clones see the same gauges and counters.
#[derive(Clone)]
pub struct MetricsCollector {
    store: Store,
    fleet: Arc<RwLock<FleetSnapshot>>,
    requests: Arc<Mutex<RequestMetrics>>,
    interval: Duration,
}

impl MetricsCollector {
    pub fn new(store: Store, interval: Duration) -> Self {
        Self {
            store,
            fleet: Arc::new(RwLock::new(FleetSnapshot::default())),
            requests: Arc::new(Mutex::new(RequestMetrics::default())),
            interval,
        }
    }

    /// Recompute the fleet gauges from the store.
    pub async fn collect(&self) -> FleetSnapshot {
        let snapshot = FleetSnapshot::from_store(&self.store);
        debug!(
            agents = snapshot.agents.len(),
            capacity_total = snapshot.capacity_total,
            capacity_available = snapshot.capacity_available,
            "fleet metrics collected"
        );
        *self.fleet.write().await = snapshot.clone();
        snapshot
    }

    /// Gauges as of the last collection.
    pub async fn fleet(&self) -> FleetSnapshot {
        self.fleet.read().await.clone()
    }

    pub async fn requests(&self) -> RequestMetrics {
        self.requests.lock().await.clone()
    }

    pub async fn record_add_instance(&self, status: &str, elapsed: Duration) {
        let mut requests = self.requests.lock().await;
        *requests.add_instance.entry(status.to_string()).or_default() += 1;
        requests.add_instance_duration.observe(elapsed.as_secs_f64());
    }

    pub async fn record_delete_instance(&self, status: &str) {
        let mut requests = self.requests.lock().await;
        *requests.delete_instance.entry(status.to_string()).or_default() += 1;
    }

    pub async fn record_runner_startup(&self, elapsed: Duration) {
        debug!(seconds = elapsed.as_secs_f64(), "runner startup recorded");
        self.requests
            .lock()
            .await
            .runner_startup_duration
            .observe(elapsed.as_secs_f64());
    }

    pub async fn record_runner_failure(&self, reason: &str) {
        debug!(%reason, "runner failure recorded");
        let mut requests = self.requests.lock().await;
        *requests.runner_failures.entry(reason.to_string()).or_default() += 1;
    }

    /// Prometheus text for the last collection and all counters.
    pub async fn render(&self) -> String {
        let fleet = self.fleet().await;
        let requests = self.requests().await;
        render_prometheus(&fleet, &requests)
    }

    /// Collect now, then every interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "metrics collector started");
        self.collect().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.collect().await;
                }
                _ = shutdown.changed() => {
                    info!("metrics collector shutting down");
                    break;
                }
            }
        }
    }
}
