//! Runner lifecycle transitions.
//!
//! ```text
//! UNSPECIFIED → CREATING → BOOTING → SSH_READY → RUNNING → TEARING_DOWN
//!                  │           │          │          │
//!                  └───────────┴──────────┴──────────┴──→ TEARING_DOWN
//! any state ──→ ERROR ──→ TEARING_DOWN
//! ```
//!
//! `TEARING_DOWN` has no outgoing transitions. `ERROR` is reachable
//! from every state, including itself and `TEARING_DOWN`.

use thiserror::Error;

use crate::types::RunnerState;

/// Result type alias for lifecycle transitions.
pub type TransitionResult<T> = Result<T, TransitionError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid state transition: {from} -> {to}")]
    Invalid { from: RunnerState, to: RunnerState },
}

impl RunnerState {
    /// States reachable from `self` by an ordinary (non-error) transition.
    pub fn allowed_transitions(self) -> &'static [RunnerState] {
        use RunnerState::*;
        match self {
            Unspecified => &[Creating],
            Creating => &[Booting, TearingDown],
            Booting => &[SshReady, TearingDown],
            SshReady => &[Running, TearingDown],
            Running => &[TearingDown],
            Error => &[TearingDown],
            TearingDown => &[],
        }
    }

    /// Whether `self → to` is a legal transition.
    pub fn can_transition_to(self, to: RunnerState) -> bool {
        to == RunnerState::Error || self.allowed_transitions().contains(&to)
    }

    /// Validate `self → to`, returning the new state.
    pub fn transition(self, to: RunnerState) -> TransitionResult<RunnerState> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(TransitionError::Invalid { from: self, to })
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self == RunnerState::TearingDown
    }

    /// Whether a runner in this state occupies one of its agent's slots.
    ///
    /// Failed and departing runners are not counted.
    pub fn occupies_slot(self) -> bool {
        !matches!(self, RunnerState::Error | RunnerState::TearingDown)
    }

    /// The runner is reachable and can be handed out.
    pub fn is_ready(self) -> bool {
        matches!(self, RunnerState::SshReady | RunnerState::Running)
    }
}
