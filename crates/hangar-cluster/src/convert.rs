//! Conversions between the wire types in [`crate::proto`] and the
//! `hangar-core` domain types.
//!
//! Unknown enum values decode to the unspecified variant. A sync
//! response without a command is the only undecodable message.

use hangar_core::{AgentCapacity, AgentStatus, GuestRunnerState, Runner, RunnerState};
use thiserror::Error;

use crate::commands::Command;
use crate::proto;
use crate::proto::sync_response::Command as WireCommand;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("sync response carries no command")]
    MissingCommand,
}

// ── Enums ──────────────────────────────────────────────────────────

impl From<RunnerState> for proto::RunnerState {
    fn from(state: RunnerState) -> Self {
        match state {
            RunnerState::Unspecified => proto::RunnerState::Unspecified,
            RunnerState::Creating => proto::RunnerState::Creating,
            RunnerState::Booting => proto::RunnerState::Booting,
            RunnerState::SshReady => proto::RunnerState::SshReady,
            RunnerState::Running => proto::RunnerState::Running,
            RunnerState::Error => proto::RunnerState::Error,
            RunnerState::TearingDown => proto::RunnerState::TearingDown,
        }
    }
}

impl From<proto::RunnerState> for RunnerState {
    fn from(state: proto::RunnerState) -> Self {
        match state {
            proto::RunnerState::Unspecified => RunnerState::Unspecified,
            proto::RunnerState::Creating => RunnerState::Creating,
            proto::RunnerState::Booting => RunnerState::Booting,
            proto::RunnerState::SshReady => RunnerState::SshReady,
            proto::RunnerState::Running => RunnerState::Running,
            proto::RunnerState::Error => RunnerState::Error,
            proto::RunnerState::TearingDown => RunnerState::TearingDown,
        }
    }
}

impl From<GuestRunnerState> for proto::GuestRunnerState {
    fn from(state: GuestRunnerState) -> Self {
        match state {
            GuestRunnerState::Unspecified => proto::GuestRunnerState::Unspecified,
            GuestRunnerState::Offline => proto::GuestRunnerState::Offline,
            GuestRunnerState::Idle => proto::GuestRunnerState::Idle,
            GuestRunnerState::Running => proto::GuestRunnerState::Running,
        }
    }
}

impl From<proto::GuestRunnerState> for GuestRunnerState {
    fn from(state: proto::GuestRunnerState) -> Self {
        match state {
            proto::GuestRunnerState::Unspecified => GuestRunnerState::Unspecified,
            proto::GuestRunnerState::Offline => GuestRunnerState::Offline,
            proto::GuestRunnerState::Idle => GuestRunnerState::Idle,
            proto::GuestRunnerState::Running => GuestRunnerState::Running,
        }
    }
}

impl From<AgentStatus> for proto::AgentStatus {
    fn from(status: AgentStatus) -> Self {
        match status {
            AgentStatus::Unspecified => proto::AgentStatus::Unspecified,
            AgentStatus::Online => proto::AgentStatus::Online,
            AgentStatus::Offline => proto::AgentStatus::Offline,
        }
    }
}

fn runner_state(raw: i32) -> RunnerState {
    proto::RunnerState::try_from(raw)
        .unwrap_or(proto::RunnerState::Unspecified)
        .into()
}

fn guest_state(raw: i32) -> GuestRunnerState {
    proto::GuestRunnerState::try_from(raw)
        .unwrap_or(proto::GuestRunnerState::Unspecified)
        .into()
}

// ── Messages ───────────────────────────────────────────────────────

impl From<AgentCapacity> for proto::AgentCapacity {
    fn from(capacity: AgentCapacity) -> Self {
        Self {
            max_runners: capacity.max_runners,
            cpu_cores: capacity.cpu_cores,
            memory_bytes: capacity.memory_bytes,
        }
    }
}

impl From<proto::AgentCapacity> for AgentCapacity {
    fn from(capacity: proto::AgentCapacity) -> Self {
        Self {
            max_runners: capacity.max_runners,
            cpu_cores: capacity.cpu_cores,
            memory_bytes: capacity.memory_bytes,
        }
    }
}

impl From<&Runner> for proto::Runner {
    fn from(runner: &Runner) -> Self {
        Self {
            runner_id: runner.id.clone(),
            runner_name: runner.name.clone(),
            agent_id: runner.agent_id.clone(),
            state: proto::RunnerState::from(runner.state).into(),
            ip_address: runner.ip_address.clone(),
            created_at_unix_ms: runner.created_at,
            error_message: runner.error_message.clone(),
            guest_runner_state: proto::GuestRunnerState::from(runner.guest_state).into(),
        }
    }
}

/// The setup script never travels in snapshots; it decodes as empty.
impl From<proto::Runner> for Runner {
    fn from(runner: proto::Runner) -> Self {
        Self {
            id: runner.runner_id,
            name: runner.runner_name,
            agent_id: runner.agent_id,
            state: runner_state(runner.state),
            guest_state: guest_state(runner.guest_runner_state),
            ip_address: runner.ip_address,
            created_at: runner.created_at_unix_ms,
            error_message: runner.error_message,
            setup_script: String::new(),
        }
    }
}

impl From<Command> for proto::SyncResponse {
    fn from(command: Command) -> Self {
        let command = match command {
            Command::CreateRunner {
                runner_id,
                runner_name,
                setup_script,
                request_id,
            } => WireCommand::CreateRunner(proto::CreateRunnerCommand {
                runner_id,
                runner_name,
                setup_script,
                request_id,
            }),
            Command::DeleteRunner {
                runner_id,
                request_id,
            } => WireCommand::DeleteRunner(proto::DeleteRunnerCommand {
                runner_id,
                request_id,
            }),
            Command::Noop => WireCommand::Noop(proto::NoopCommand {}),
        };
        Self {
            command: Some(command),
        }
    }
}

impl TryFrom<proto::SyncResponse> for Command {
    type Error = ConvertError;

    fn try_from(response: proto::SyncResponse) -> Result<Self, Self::Error> {
        match response.command.ok_or(ConvertError::MissingCommand)? {
            WireCommand::CreateRunner(cmd) => Ok(Command::CreateRunner {
                runner_id: cmd.runner_id,
                runner_name: cmd.runner_name,
                setup_script: cmd.setup_script,
                request_id: cmd.request_id,
            }),
            WireCommand::DeleteRunner(cmd) => Ok(Command::DeleteRunner {
                runner_id: cmd.runner_id,
                request_id: cmd.request_id,
            }),
            WireCommand::Noop(_) => Ok(Command::Noop),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_runner_keeps_every_reported_field() {
        let mut runner = Runner::new("r1", "ci-mac-1", "agent-1", "");
        runner.state = RunnerState::SshReady;
        runner.guest_state = GuestRunnerState::Idle;
        runner.ip_address = "192.168.64.7".into();
        runner.error_message = "previous hiccup".into();

        let wire = proto::Runner::from(&runner);
        assert_eq!(wire.state, proto::RunnerState::SshReady as i32);
        assert_eq!(Runner::from(wire), runner);
    }

    #[test]
    fn unknown_enum_values_decode_unspecified() {
        let wire = proto::Runner {
            runner_id: "r1".into(),
            state: 42,
            guest_runner_state: -3,
            ..Default::default()
        };
        let runner = Runner::from(wire);
        assert_eq!(runner.state, RunnerState::Unspecified);
        assert_eq!(runner.guest_state, GuestRunnerState::Unspecified);
    }

    #[test]
    fn commands_cross_the_wire() {
        let create = Command::CreateRunner {
            runner_id: "r1".into(),
            runner_name: "ci".into(),
            setup_script: "echo hi".into(),
            request_id: "req-1".into(),
        };
        let wire = proto::SyncResponse::from(create.clone());
        assert!(matches!(wire.command, Some(WireCommand::CreateRunner(_))));
        assert_eq!(Command::try_from(wire).unwrap(), create);
        assert_eq!(
            Command::try_from(proto::SyncResponse::from(Command::Noop)).unwrap(),
            Command::Noop
        );
    }

    #[test]
    fn empty_response_is_rejected() {
        let err = Command::try_from(proto::SyncResponse { command: None }).unwrap_err();
        assert_eq!(err, ConvertError::MissingCommand);
    }
}
