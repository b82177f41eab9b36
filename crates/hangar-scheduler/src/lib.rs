//! hangar-scheduler: picks the agent that should host a new runner.
//!
//! Placement only: selecting an agent does not reserve a slot. The
//! chosen agent's load is reflected once its next snapshot reaches the
//! store, so two placements racing inside one sync interval may land on
//! the same agent.

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{AgentSelector, CapacityScheduler, Candidate};
