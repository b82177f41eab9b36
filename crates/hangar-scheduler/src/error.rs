//! Scheduler error types.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("no available agent")]
    NoAvailableAgent,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
