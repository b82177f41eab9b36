//! Agent-local runner records.
//!
//! The agent's source of truth for what it is hosting; the coordinator
//! only ever sees snapshots of it. State changes go through the
//! lifecycle table (except [`RunnerManager::set_error`], which is always
//! legal) and wake anyone waiting on [`RunnerManager::changed`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use hangar_core::{GuestRunnerState, Runner, RunnerState, TransitionError};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

pub type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("runner {0} already exists")]
    AlreadyExists(String),

    #[error("runner not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

#[derive(Clone, Default)]
pub struct RunnerManager {
    runners: Arc<RwLock<HashMap<String, Runner>>>,
    changed: Arc<Notify>,
}

impl RunnerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves after the next local state change.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    fn touch(&self) {
        self.changed.notify_one();
    }

    fn with_runner<T>(
        &self,
        runner_id: &str,
        f: impl FnOnce(&mut Runner) -> RunnerResult<T>,
    ) -> RunnerResult<T> {
        let result = {
            let mut runners = self.runners.write().expect("runners lock");
            let runner = runners
                .get_mut(runner_id)
                .ok_or_else(|| RunnerError::NotFound(runner_id.to_string()))?;
            f(runner)?
        };
        self.touch();
        Ok(result)
    }

    /// Accept a new runner in `Unspecified`. Fails on a duplicate id.
    pub fn create(&self, runner: Runner) -> RunnerResult<()> {
        {
            let mut runners = self.runners.write().expect("runners lock");
            if runners.contains_key(&runner.id) {
                return Err(RunnerError::AlreadyExists(runner.id));
            }
            debug!(runner_id = %runner.id, name = %runner.name, "runner accepted");
            runners.insert(runner.id.clone(), runner);
        }
        self.touch();
        Ok(())
    }

    pub fn get(&self, runner_id: &str) -> RunnerResult<Runner> {
        self.runners
            .read()
            .expect("runners lock")
            .get(runner_id)
            .cloned()
            .ok_or_else(|| RunnerError::NotFound(runner_id.to_string()))
    }

    /// All runners, ordered by id.
    pub fn list(&self) -> Vec<Runner> {
        let mut runners: Vec<Runner> = self
            .runners
            .read()
            .expect("runners lock")
            .values()
            .cloned()
            .collect();
        runners.sort_by(|a, b| a.id.cmp(&b.id));
        runners
    }

    pub fn count(&self) -> usize {
        self.runners.read().expect("runners lock").len()
    }

    /// Move a runner along the lifecycle table. An illegal move leaves
    /// the runner untouched.
    pub fn update_state(&self, runner_id: &str, state: RunnerState) -> RunnerResult<()> {
        self.with_runner(runner_id, |runner| {
            runner.state = runner.state.transition(state)?;
            debug!(%runner_id, %state, "runner state updated");
            Ok(())
        })
    }

    /// Put the runner in `Error` with `message`.
    pub fn set_error(&self, runner_id: &str, message: &str) -> RunnerResult<()> {
        self.with_runner(runner_id, |runner| {
            runner.state = RunnerState::Error;
            runner.error_message = message.to_string();
            Ok(())
        })
    }

    pub fn set_ip_address(&self, runner_id: &str, ip: &str) -> RunnerResult<()> {
        self.with_runner(runner_id, |runner| {
            runner.ip_address = ip.to_string();
            Ok(())
        })
    }

    pub fn update_guest_state(&self, runner_id: &str, state: GuestRunnerState) -> RunnerResult<()> {
        self.with_runner(runner_id, |runner| {
            runner.guest_state = state;
            Ok(())
        })
    }

    pub fn delete(&self, runner_id: &str) -> RunnerResult<Runner> {
        let removed = self
            .runners
            .write()
            .expect("runners lock")
            .remove(runner_id)
            .ok_or_else(|| RunnerError::NotFound(runner_id.to_string()))?;
        self.touch();
        Ok(removed)
    }
}
