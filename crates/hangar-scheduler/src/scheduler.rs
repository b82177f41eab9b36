//! Most-free-slots placement over the online agents in the store.

use hangar_core::AgentId;
use hangar_state::Store;
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

/// Chooses a placement target for one new runner.
pub trait AgentSelector: Send + Sync {
    fn select_agent(&self) -> SchedulerResult<AgentId>;
}

/// An online agent with at least one free slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub agent_id: AgentId,
    pub available: u32,
}

/// Picks the online agent with the most free slots.
#[derive(Clone)]
pub struct CapacityScheduler {
    store: Store,
}

impl CapacityScheduler {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Online agents with spare capacity, in store iteration order.
    ///
    /// Agents that vanish or go offline between the listing and the
    /// capacity check are skipped.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.store
            .get_online_agents()
            .into_iter()
            .filter_map(|agent| match self.store.available_slots(&agent.id) {
                Ok(available) if available > 0 => Some(Candidate {
                    agent_id: agent.id,
                    available,
                }),
                _ => None,
            })
            .collect()
    }
}

impl AgentSelector for CapacityScheduler {
    fn select_agent(&self) -> SchedulerResult<AgentId> {
        let mut best: Option<Candidate> = None;
        for candidate in self.candidates() {
            // Strictly greater: the first agent seen wins a tie.
            if best
                .as_ref()
                .is_none_or(|b| candidate.available > b.available)
            {
                best = Some(candidate);
            }
        }

        let chosen = best.ok_or(SchedulerError::NoAvailableAgent)?;
        debug!(agent_id = %chosen.agent_id, available = chosen.available, "agent selected");
        Ok(chosen.agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_core::{Agent, AgentCapacity, AgentStatus, Runner, RunnerState};

    fn add_agent(store: &Store, id: &str, max_runners: u32, status: AgentStatus) {
        store.register_agent(Agent {
            id: id.to_string(),
            hostname: id.to_string(),
            capacity: AgentCapacity {
                max_runners,
                cpu_cores: 4,
                memory_bytes: 8 << 30,
            },
            status,
        });
    }

    fn report(store: &Store, agent_id: &str, states: &[RunnerState]) {
        let runners = states
            .iter()
            .enumerate()
            .map(|(i, state)| {
                let mut r = Runner::new(&format!("{agent_id}-r{i}"), "ci", agent_id, "");
                r.state = *state;
                r
            })
            .collect();
        store.update_agent_runners(agent_id, runners).unwrap();
    }

    #[test]
    fn empty_store_has_no_agent() {
        let scheduler = CapacityScheduler::new(Store::new());
        assert_eq!(scheduler.select_agent(), Err(SchedulerError::NoAvailableAgent));
    }

    #[test]
    fn picks_agent_with_most_free_slots() {
        let store = Store::new();
        add_agent(&store, "busy", 2, AgentStatus::Online);
        add_agent(&store, "idle", 2, AgentStatus::Online);
        report(&store, "busy", &[RunnerState::Running]);

        let scheduler = CapacityScheduler::new(store);
        assert_eq!(scheduler.select_agent().unwrap(), "idle");
    }

    #[test]
    fn skips_offline_and_full_agents() {
        let store = Store::new();
        add_agent(&store, "offline", 2, AgentStatus::Offline);
        add_agent(&store, "full", 1, AgentStatus::Online);
        report(&store, "full", &[RunnerState::Booting]);

        let scheduler = CapacityScheduler::new(store.clone());
        assert!(scheduler.candidates().is_empty());
        assert_eq!(scheduler.select_agent(), Err(SchedulerError::NoAvailableAgent));

        // A failed runner frees its slot.
        report(&store, "full", &[RunnerState::Error]);
        assert_eq!(scheduler.select_agent().unwrap(), "full");
    }

    #[test]
    fn placement_does_not_reserve_capacity() {
        let store = Store::new();
        add_agent(&store, "a1", 2, AgentStatus::Online);
        let scheduler = CapacityScheduler::new(store);

        let first = scheduler.select_agent().unwrap();
        let second = scheduler.select_agent().unwrap();
        assert_eq!(first, "a1");
        assert_eq!(first, second);
    }
}
