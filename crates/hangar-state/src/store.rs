//! Store: in-memory agent and runner registry with cross-indexes.
//!
//! Runner records arrive exclusively through agent snapshots
//! ([`Store::update_agent_runners`]); the coordinator never fabricates a
//! runner on its own. External ids are registered by the request handler
//! before the owning agent has reported the runner, so an external id may
//! briefly point at a runner the store has not seen yet. Lookups through
//! such an id fail with `RunnerNotFound` until the first snapshot lands.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use hangar_core::{Agent, AgentId, AgentStatus, ExternalId, Runner, RunnerId};
use tracing::debug;

use crate::error::{StateError, StateResult};

#[derive(Default)]
struct Inner {
    agents: HashMap<AgentId, Agent>,
    runners: HashMap<RunnerId, Runner>,
    runner_to_agent: HashMap<RunnerId, AgentId>,
    external_to_runner: HashMap<ExternalId, RunnerId>,
}

impl Inner {
    /// Drop a runner together with both of its index entries.
    fn remove_runner(&mut self, runner_id: &str) -> Option<Runner> {
        let removed = self.runners.remove(runner_id);
        self.runner_to_agent.remove(runner_id);
        self.external_to_runner.retain(|_, rid| rid != runner_id);
        removed
    }

    /// Runners attributed to `agent_id` that occupy a slot.
    fn active_count(&self, agent_id: &str) -> usize {
        self.runner_to_agent
            .iter()
            .filter(|(_, aid)| aid.as_str() == agent_id)
            .filter_map(|(rid, _)| self.runners.get(rid))
            .filter(|r| r.state.occupies_slot())
            .count()
    }
}

/// Thread-safe authoritative store shared by the coordinator's tasks.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Agents ─────────────────────────────────────────────────────

    /// Insert an agent, replacing any previous record with the same id.
    pub fn register_agent(&self, agent: Agent) {
        let mut inner = self.inner.write().expect("store lock");
        debug!(agent_id = %agent.id, hostname = %agent.hostname, "agent stored");
        inner.agents.insert(agent.id.clone(), agent);
    }

    pub fn get_agent(&self, agent_id: &str) -> StateResult<Agent> {
        let inner = self.inner.read().expect("store lock");
        inner
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| StateError::AgentNotFound(agent_id.to_string()))
    }

    /// All agents, ordered by id.
    pub fn list_agents(&self) -> Vec<Agent> {
        let inner = self.inner.read().expect("store lock");
        let mut agents: Vec<Agent> = inner.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn update_agent_status(&self, agent_id: &str, status: AgentStatus) -> StateResult<()> {
        let mut inner = self.inner.write().expect("store lock");
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| StateError::AgentNotFound(agent_id.to_string()))?;
        if agent.status != status {
            debug!(%agent_id, from = ?agent.status, to = ?status, "agent status changed");
        }
        agent.status = status;
        Ok(())
    }

    /// Agents currently `Online`, in unspecified order.
    pub fn get_online_agents(&self) -> Vec<Agent> {
        let inner = self.inner.read().expect("store lock");
        inner
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Online)
            .cloned()
            .collect()
    }

    // ── Snapshot reconciliation ────────────────────────────────────

    /// Replace the agent's runner set with `runners`.
    ///
    /// Runners previously attributed to this agent but missing from
    /// `runners` are deleted along with their external-id entries. Records
    /// are stored exactly as reported.
    pub fn update_agent_runners(&self, agent_id: &str, runners: Vec<Runner>) -> StateResult<()> {
        let mut inner = self.inner.write().expect("store lock");
        if !inner.agents.contains_key(agent_id) {
            return Err(StateError::AgentNotFound(agent_id.to_string()));
        }

        let reported: HashSet<&str> = runners.iter().map(|r| r.id.as_str()).collect();
        let stale: Vec<RunnerId> = inner
            .runner_to_agent
            .iter()
            .filter(|(rid, aid)| aid.as_str() == agent_id && !reported.contains(rid.as_str()))
            .map(|(rid, _)| rid.clone())
            .collect();

        for runner_id in &stale {
            inner.remove_runner(runner_id);
            debug!(%agent_id, %runner_id, "stale runner removed");
        }

        for runner in runners {
            inner
                .runner_to_agent
                .insert(runner.id.clone(), agent_id.to_string());
            inner.runners.insert(runner.id.clone(), runner);
        }
        Ok(())
    }

    // ── Runners ────────────────────────────────────────────────────

    pub fn get_runner(&self, runner_id: &str) -> StateResult<Runner> {
        let inner = self.inner.read().expect("store lock");
        inner
            .runners
            .get(runner_id)
            .cloned()
            .ok_or_else(|| StateError::RunnerNotFound(runner_id.to_string()))
    }

    /// Resolve an external id to its runner.
    ///
    /// `ExternalIdNotFound` when the id is unknown, `RunnerNotFound` when
    /// the id is registered but the runner has not been reported (yet).
    pub fn get_runner_by_external_id(&self, external_id: &str) -> StateResult<Runner> {
        let inner = self.inner.read().expect("store lock");
        let runner_id = inner
            .external_to_runner
            .get(external_id)
            .ok_or_else(|| StateError::ExternalIdNotFound(external_id.to_string()))?;
        inner
            .runners
            .get(runner_id)
            .cloned()
            .ok_or_else(|| StateError::RunnerNotFound(runner_id.clone()))
    }

    pub fn get_agent_for_runner(&self, runner_id: &str) -> StateResult<AgentId> {
        let inner = self.inner.read().expect("store lock");
        inner
            .runner_to_agent
            .get(runner_id)
            .cloned()
            .ok_or_else(|| StateError::RunnerNotFound(runner_id.to_string()))
    }

    /// All runners, ordered by id.
    pub fn list_runners(&self) -> Vec<Runner> {
        let inner = self.inner.read().expect("store lock");
        let mut runners: Vec<Runner> = inner.runners.values().cloned().collect();
        runners.sort_by(|a, b| a.id.cmp(&b.id));
        runners
    }

    /// Runners attributed to one agent, ordered by id.
    pub fn list_runners_by_agent(&self, agent_id: &str) -> Vec<Runner> {
        let inner = self.inner.read().expect("store lock");
        let mut runners: Vec<Runner> = inner
            .runner_to_agent
            .iter()
            .filter(|(_, aid)| aid.as_str() == agent_id)
            .filter_map(|(rid, _)| inner.runners.get(rid).cloned())
            .collect();
        runners.sort_by(|a, b| a.id.cmp(&b.id));
        runners
    }

    pub fn register_external_id(&self, external_id: &str, runner_id: &str) {
        let mut inner = self.inner.write().expect("store lock");
        inner
            .external_to_runner
            .insert(external_id.to_string(), runner_id.to_string());
        debug!(%external_id, %runner_id, "external id registered");
    }

    /// Drop an external id without touching any runner record. Returns
    /// whether the id was known.
    pub fn forget_external_id(&self, external_id: &str) -> bool {
        let mut inner = self.inner.write().expect("store lock");
        let known = inner.external_to_runner.remove(external_id).is_some();
        if known {
            debug!(%external_id, "external id forgotten");
        }
        known
    }

    /// Remove a runner and both of its index entries.
    pub fn delete_runner(&self, runner_id: &str) -> StateResult<()> {
        let mut inner = self.inner.write().expect("store lock");
        inner
            .remove_runner(runner_id)
            .map(|_| ())
            .ok_or_else(|| StateError::RunnerNotFound(runner_id.to_string()))
    }

    // ── Capacity ───────────────────────────────────────────────────

    /// Runners on the agent that occupy a slot (everything except
    /// `Error` and `TearingDown`).
    pub fn get_runner_count(&self, agent_id: &str) -> usize {
        let inner = self.inner.read().expect("store lock");
        inner.active_count(agent_id)
    }

    /// Online and below `max_runners`. Unknown agents are an error.
    pub fn has_capacity(&self, agent_id: &str) -> StateResult<bool> {
        let inner = self.inner.read().expect("store lock");
        let agent = inner
            .agents
            .get(agent_id)
            .ok_or_else(|| StateError::AgentNotFound(agent_id.to_string()))?;
        if agent.status != AgentStatus::Online {
            return Ok(false);
        }
        Ok(inner.active_count(agent_id) < agent.capacity.max_runners as usize)
    }

    /// Free slots on an online agent (`max_runners - active`, saturating).
    pub fn available_slots(&self, agent_id: &str) -> StateResult<u32> {
        let inner = self.inner.read().expect("store lock");
        let agent = inner
            .agents
            .get(agent_id)
            .ok_or_else(|| StateError::AgentNotFound(agent_id.to_string()))?;
        if agent.status != AgentStatus::Online {
            return Err(StateError::AgentOffline(agent_id.to_string()));
        }
        let active = inner.active_count(agent_id) as u32;
        Ok(agent.capacity.max_runners.saturating_sub(active))
    }
}
