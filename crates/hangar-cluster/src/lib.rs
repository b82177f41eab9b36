//! hangar-cluster: the coordinator/agent protocol.
//!
//! Provides the gRPC services the coordinator exposes, the agent-side
//! sync client, and the background sweeper for failed runners.
//!
//! # Architecture
//!
//! ```text
//! Coordinator
//!   ├── AgentServer (gRPC AgentService)
//!   │   ├── RegisterAgent() → mints agent_id, stores agent ONLINE
//!   │   └── Sync() → snapshot in, one queued command (or Noop) out
//!   ├── InstanceServer (gRPC InstanceService)
//!   │   ├── AddInstance() → schedule, queue CreateRunner, wait SSH_READY
//!   │   ├── DeleteInstance() → queue DeleteRunner (or withdraw the create)
//!   │   └── outcomes recorded into a MetricsCollector
//!   ├── CommandQueue (per-agent FIFO)
//!   ├── ErrorSweeper (deletes runners stuck in ERROR)
//!   └── api (read-only HTTP over the store, plus /metrics)
//!
//! Agent
//!   └── SyncClient
//!       ├── registers, opens Sync, reconnects on failure
//!       ├── sends snapshots on a tick and on every local change
//!       └── runs each command as a task against VmManager + RunnerManager
//! ```

pub mod agent;
pub mod api;
pub mod commands;
pub mod convert;
pub mod instances;
pub mod server;
pub mod sweeper;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("hangar.v1");
}

pub use agent::{SyncClient, SyncClientConfig};
pub use commands::{Command, CommandQueue};
pub use instances::{HandlerTimeouts, InstanceServer};
pub use server::{AgentServer, StreamRegistry};
pub use sweeper::{ErrorSweeper, SweeperHandle};
