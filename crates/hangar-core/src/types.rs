//! Domain types for agents and runners.
//!
//! These are the coordinator's and the agent's in-memory view of the
//! fleet. Wire (protobuf) representations are converted to and from
//! these types at the gRPC edge.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a host agent (minted by the coordinator).
pub type AgentId = String;

/// Unique identifier for a runner (internal identity).
pub type RunnerId = String;

/// Identifier handed to the external autoscaler for a runner.
pub type ExternalId = String;

// ── Agent ──────────────────────────────────────────────────────────

/// Connection status of an agent as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Unspecified,
    Online,
    Offline,
}

impl AgentStatus {
    pub const ALL: [AgentStatus; 3] = [AgentStatus::Unspecified, AgentStatus::Online, AgentStatus::Offline];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Unspecified => "unspecified",
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
        }
    }
}

/// Resources an agent advertises when it registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentCapacity {
    /// Maximum number of concurrently active runners.
    pub max_runners: u32,
    pub cpu_cores: u32,
    pub memory_bytes: u64,
}

/// A host process managing VM-backed runners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub hostname: String,
    pub capacity: AgentCapacity,
    pub status: AgentStatus,
}

// ── Runner ─────────────────────────────────────────────────────────

/// Lifecycle state of a runner. Transition rules live in [`crate::lifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    #[default]
    Unspecified,
    Creating,
    Booting,
    SshReady,
    Running,
    Error,
    TearingDown,
}

impl RunnerState {
    /// Every state, in declaration order.
    pub const ALL: [RunnerState; 7] = [
        RunnerState::Unspecified,
        RunnerState::Creating,
        RunnerState::Booting,
        RunnerState::SshReady,
        RunnerState::Running,
        RunnerState::Error,
        RunnerState::TearingDown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerState::Unspecified => "unspecified",
            RunnerState::Creating => "creating",
            RunnerState::Booting => "booting",
            RunnerState::SshReady => "ssh_ready",
            RunnerState::Running => "running",
            RunnerState::Error => "error",
            RunnerState::TearingDown => "tearing_down",
        }
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job state reported by the monitor running inside the guest.
///
/// Informational only; it never gates [`RunnerState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestRunnerState {
    #[default]
    Unspecified,
    Offline,
    Idle,
    Running,
}

/// One ephemeral CI job environment backed by a single VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    pub id: RunnerId,
    pub name: String,
    pub agent_id: AgentId,
    pub state: RunnerState,
    pub guest_state: GuestRunnerState,
    /// Guest address, empty until the guest announces it.
    pub ip_address: String,
    /// Unix timestamp (milliseconds) when the agent accepted the runner.
    pub created_at: u64,
    pub error_message: String,
    pub setup_script: String,
}

impl Runner {
    /// A freshly accepted runner, not yet provisioning.
    pub fn new(id: &str, name: &str, agent_id: &str, setup_script: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            agent_id: agent_id.to_string(),
            state: RunnerState::Unspecified,
            guest_state: GuestRunnerState::Unspecified,
            ip_address: String::new(),
            created_at: epoch_millis(),
            error_message: String::new(),
            setup_script: setup_script.to_string(),
        }
    }
}

/// Current wall-clock time as Unix milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
