//! Per-agent pending command queues.
//!
//! The coordinator never pushes to an agent. Commands wait here until the
//! agent's next snapshot arrives, and each snapshot drains exactly one.
//! Entries never expire: a command queued for an agent that never comes
//! back stays queued.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use hangar_core::{AgentId, RunnerId};
use tracing::debug;

/// Instruction for one agent, delivered as the reply to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateRunner {
        runner_id: RunnerId,
        runner_name: String,
        setup_script: String,
        request_id: String,
    },
    DeleteRunner {
        runner_id: RunnerId,
        request_id: String,
    },
    Noop,
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CreateRunner { .. } => "create_runner",
            Command::DeleteRunner { .. } => "delete_runner",
            Command::Noop => "noop",
        }
    }
}

#[derive(Clone, Default)]
pub struct CommandQueue {
    queues: Arc<Mutex<HashMap<AgentId, VecDeque<Command>>>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, agent_id: &str, command: Command) {
        let mut queues = self.queues.lock().expect("command queue lock");
        debug!(%agent_id, command = command.kind(), "command queued");
        queues
            .entry(agent_id.to_string())
            .or_default()
            .push_back(command);
    }

    /// Queue `command` unless an identical one is already waiting for
    /// `agent_id`. Returns whether it was queued.
    pub fn enqueue_unique(&self, agent_id: &str, command: Command) -> bool {
        let mut queues = self.queues.lock().expect("command queue lock");
        let queue = queues.entry(agent_id.to_string()).or_default();
        if queue.contains(&command) {
            debug!(%agent_id, command = command.kind(), "command already queued");
            return false;
        }
        debug!(%agent_id, command = command.kind(), "command queued");
        queue.push_back(command);
        true
    }

    /// Remove a `CreateRunner` for `runner_id` that no agent has received
    /// yet. Returns the agent it was queued for.
    pub fn withdraw_create(&self, runner_id: &str) -> Option<AgentId> {
        let mut queues = self.queues.lock().expect("command queue lock");
        for (agent_id, queue) in queues.iter_mut() {
            let pos = queue.iter().position(
                |c| matches!(c, Command::CreateRunner { runner_id: id, .. } if id == runner_id),
            );
            if let Some(pos) = pos {
                queue.remove(pos);
                debug!(%agent_id, %runner_id, "queued create withdrawn");
                return Some(agent_id.clone());
            }
        }
        None
    }

    /// Pop the oldest command for `agent_id`, or `Noop` when there is none.
    pub fn next(&self, agent_id: &str) -> Command {
        let mut queues = self.queues.lock().expect("command queue lock");
        queues
            .get_mut(agent_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Command::Noop)
    }

    pub fn pending(&self, agent_id: &str) -> usize {
        let queues = self.queues.lock().expect("command queue lock");
        queues.get(agent_id).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delete(id: &str) -> Command {
        Command::DeleteRunner {
            runner_id: id.to_string(),
            request_id: String::new(),
        }
    }

    #[test]
    fn empty_queue_yields_noop() {
        let queue = CommandQueue::new();
        assert_eq!(queue.next("agent-1"), Command::Noop);
        assert_eq!(queue.pending("agent-1"), 0);
    }

    #[test]
    fn fifo_per_agent() {
        let queue = CommandQueue::new();
        queue.enqueue("a", delete("r1"));
        queue.enqueue("b", delete("r9"));
        queue.enqueue("a", delete("r2"));
        assert_eq!(queue.pending("a"), 2);

        assert_eq!(queue.next("a"), delete("r1"));
        assert_eq!(queue.next("a"), delete("r2"));
        assert_eq!(queue.next("a"), Command::Noop);
        assert_eq!(queue.next("b"), delete("r9"));
    }

    #[test]
    fn enqueue_unique_skips_identical_command() {
        let queue = CommandQueue::new();
        assert!(queue.enqueue_unique("a", delete("r1")));
        assert!(!queue.enqueue_unique("a", delete("r1")));
        assert!(queue.enqueue_unique("a", delete("r2")));
        assert!(queue.enqueue_unique("b", delete("r1")));
        assert_eq!(queue.pending("a"), 2);
    }

    #[test]
    fn withdraw_create_removes_only_that_runner() {
        let queue = CommandQueue::new();
        let create = |id: &str| Command::CreateRunner {
            runner_id: id.to_string(),
            runner_name: "ci".into(),
            setup_script: String::new(),
            request_id: String::new(),
        };
        queue.enqueue("a", create("r1"));
        queue.enqueue("b", delete("r2"));
        queue.enqueue("b", create("r2"));

        assert_eq!(queue.withdraw_create("r2").as_deref(), Some("b"));
        assert_eq!(queue.withdraw_create("r2"), None);
        assert_eq!(queue.next("b"), delete("r2"));
        assert_eq!(queue.pending("a"), 1);
    }

    #[test]
    fn clones_share_queues() {
        let queue = CommandQueue::new();
        let other = queue.clone();
        other.enqueue("a", delete("r1"));
        assert_eq!(queue.pending("a"), 1);
    }
}
