//! Background cleanup of runners stuck in ERROR.
//!
//! A runner whose provisioning failed stays in ERROR on its agent until
//! someone deletes it. The sweeper queues that delete once the runner is
//! older than the grace period, at most one per runner while it waits in
//! the agent's queue. If the owning agent cannot be found the record is
//! dropped from the store directly.

use std::time::Duration;

use hangar_core::config::CoordinatorConfig;
use hangar_core::{RunnerState, epoch_millis};
use hangar_state::Store;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::commands::{Command, CommandQueue};

/// Outcome of one [`ErrorSweeper::sweep_once`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Delete commands newly queued to agents.
    pub queued: usize,
    /// Orphans removed straight from the store.
    pub removed: usize,
}

pub struct ErrorSweeper {
    store: Store,
    commands: CommandQueue,
    interval: Duration,
    grace_period: Duration,
    span: Span,
}

impl ErrorSweeper {
    pub fn new(store: Store, commands: CommandQueue) -> Self {
        let defaults = CoordinatorConfig::default();
        Self {
            store,
            commands,
            interval: defaults.sweep_interval(),
            grace_period: defaults.error_grace_period(),
            span: Span::none(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Queue deletes for every ERROR runner created more than the grace
    /// period ago.
    pub fn sweep_once(&self) -> SweepReport {
        let now = epoch_millis();
        let grace_ms = self.grace_period.as_millis() as u64;
        let mut report = SweepReport::default();

        for runner in self.store.list_runners() {
            if runner.state != RunnerState::Error
                || now.saturating_sub(runner.created_at) <= grace_ms
            {
                continue;
            }
            info!(
                runner_id = %runner.id,
                error_message = %runner.error_message,
                "cleaning up runner in error state"
            );

            match self.store.get_agent_for_runner(&runner.id) {
                Ok(agent_id) => {
                    let delete = Command::DeleteRunner {
                        runner_id: runner.id.clone(),
                        request_id: String::new(),
                    };
                    if self.commands.enqueue_unique(&agent_id, delete) {
                        report.queued += 1;
                    }
                }
                Err(e) => {
                    warn!(runner_id = %runner.id, error = %e, "no agent for runner, removing from store");
                    match self.store.delete_runner(&runner.id) {
                        Ok(()) => report.removed += 1,
                        Err(e) => error!(runner_id = %runner.id, error = %e, "failed to delete runner"),
                    }
                }
            }
        }
        report
    }

    /// Run [`Self::sweep_once`] every interval until the handle is stopped.
    pub fn start(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let span = self.span.clone();

        let handle = tokio::spawn(
            async move {
                info!(interval = ?self.interval, grace_period = ?self.grace_period, "error sweeper started");
                let mut ticker = tokio::time::interval(self.interval);
                // The first tick completes immediately.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let report = self.sweep_once();
                            if report != SweepReport::default() {
                                debug!(queued = report.queued, removed = report.removed, "sweep finished");
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            info!("error sweeper shutting down");
                            break;
                        }
                    }
                }
            }
            .instrument(span),
        );

        SweeperHandle {
            handle,
            shutdown_tx,
        }
    }
}

/// Stops a running sweeper.
pub struct SweeperHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl SweeperHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "error sweeper task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_core::{Agent, AgentCapacity, AgentStatus, Runner};

    const HOUR_MS: u64 = 3_600_000;

    fn store_with(runners: Vec<Runner>) -> Store {
        let store = Store::new();
        store.register_agent(Agent {
            id: "agent-1".into(),
            hostname: "mac-1".into(),
            capacity: AgentCapacity {
                max_runners: 2,
                ..Default::default()
            },
            status: AgentStatus::Online,
        });
        store.update_agent_runners("agent-1", runners).unwrap();
        store
    }

    fn runner(id: &str, state: RunnerState, age_ms: u64) -> Runner {
        let mut runner = Runner::new(id, "ci", "agent-1", "");
        runner.state = state;
        runner.created_at = epoch_millis() - age_ms;
        runner
    }

    #[test]
    fn only_old_error_runners_are_swept() {
        let store = store_with(vec![
            runner("old-error", RunnerState::Error, HOUR_MS),
            runner("fresh-error", RunnerState::Error, 1_000),
            runner("old-running", RunnerState::Running, HOUR_MS),
        ]);
        let commands = CommandQueue::new();
        let sweeper = ErrorSweeper::new(store.clone(), commands.clone());

        let report = sweeper.sweep_once();
        assert_eq!(report, SweepReport { queued: 1, removed: 0 });
        assert_eq!(
            commands.next("agent-1"),
            Command::DeleteRunner {
                runner_id: "old-error".into(),
                request_id: String::new(),
            }
        );
        assert_eq!(commands.next("agent-1"), Command::Noop);
        // The runner leaves the store only once the agent reports it gone.
        assert!(store.get_runner("old-error").is_ok());
    }

    #[test]
    fn grace_period_is_configurable() {
        let store = store_with(vec![runner("r1", RunnerState::Error, 5_000)]);
        let commands = CommandQueue::new();
        let sweeper = ErrorSweeper::new(store, commands.clone())
            .with_grace_period(Duration::from_secs(1));
        assert_eq!(sweeper.sweep_once().queued, 1);
        assert_eq!(commands.pending("agent-1"), 1);
    }

    #[test]
    fn repeated_sweeps_queue_one_delete() {
        let store = store_with(vec![runner("r1", RunnerState::Error, HOUR_MS)]);
        let commands = CommandQueue::new();
        let sweeper = ErrorSweeper::new(store, commands.clone());

        assert_eq!(sweeper.sweep_once().queued, 1);
        assert_eq!(sweeper.sweep_once().queued, 0);
        assert_eq!(sweeper.sweep_once().queued, 0);
        assert_eq!(commands.pending("agent-1"), 1);

        // Once the agent has taken it, a still-failed runner is swept again.
        commands.next("agent-1");
        assert_eq!(sweeper.sweep_once().queued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn started_sweeper_ticks_until_stopped() {
        let store = store_with(vec![runner("r1", RunnerState::Error, HOUR_MS)]);
        let commands = CommandQueue::new();
        let handle = ErrorSweeper::new(store, commands.clone())
            .with_interval(Duration::from_secs(60))
            .start();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(commands.pending("agent-1"), 0);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(commands.pending("agent-1"), 1);

        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(commands.pending("agent-1"), 1);
    }
}
