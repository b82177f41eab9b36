//! hangar-metrics: observability for the coordinator.
//!
//! Fleet gauges (runners per state, agent load, capacity) are recomputed
//! from the store on a fixed interval. Request counters and duration
//! histograms are fed by the instance handlers as requests finish. Both
//! are rendered together in the Prometheus text format.
//!
//! # Architecture
//!
//! ```text
//! MetricsCollector
//!   ├── collect() → FleetSnapshot::from_store()
//!   ├── run() → periodic collect loop
//!   ├── record_add_instance() / record_delete_instance()
//!   ├── record_runner_startup() / record_runner_failure()
//!   └── render() → text/plain for /metrics
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{AgentLoad, FleetSnapshot, Histogram, MetricsCollector, RequestMetrics};
pub use prometheus::render_prometheus;
