//! Wait-for graph and deadlock victim selection.
//!
//! An edge `waiter -> blocker` means `waiter` cannot be granted until
//! `blocker` releases a lock it holds or leaves the queue ahead of it. A
//! cycle in this graph is a deadlock.
//!
//! Victim choice is deterministic: the agent with the lowest priority loses;
//! among equal priorities the one holding the oldest lock loses (agents
//! holding nothing sort after every lock holder); remaining ties go to the
//! lowest `AgentId`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::agent::AgentId;
use crate::core::cycles;
use crate::core::task::Priority;

#[derive(Debug, Clone, Default)]
pub struct WaitForGraph {
    edges: BTreeMap<AgentId, BTreeSet<AgentId>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `waiter` is blocked on `blocker`. Self-waits are ignored.
    pub fn add_wait(&mut self, waiter: &AgentId, blocker: &AgentId) {
        if waiter == blocker {
            return;
        }
        self.edges
            .entry(waiter.clone())
            .or_default()
            .insert(blocker.clone());
        self.edges.entry(blocker.clone()).or_default();
    }

    pub fn waits_on(&self, waiter: &AgentId) -> Vec<AgentId> {
        self.edges
            .get(waiter)
            .map(|blockers| blockers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    /// Every cycle, each as the DFS path suffix from the revisited agent.
    pub fn cycles(&self) -> Vec<Vec<AgentId>> {
        cycles::find_cycles(&self.adjacency())
    }

    /// All agents that are part of some cycle, sorted.
    pub fn deadlocked_agents(&self) -> BTreeSet<AgentId> {
        cycles::nodes_on_cycles(&self.adjacency())
    }

    fn adjacency(&self) -> BTreeMap<AgentId, Vec<AgentId>> {
        self.edges
            .iter()
            .map(|(waiter, blockers)| (waiter.clone(), blockers.iter().cloned().collect()))
            .collect()
    }
}

/// What the coordinator knows about a deadlocked agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VictimCandidate {
    pub agent: AgentId,
    /// Highest priority among the agent's held locks and pending requests.
    pub priority: Priority,
    /// Acquisition time of the agent's oldest held lock.
    pub oldest_lock: Option<DateTime<Utc>>,
}

impl VictimCandidate {
    fn sort_key(&self) -> (Priority, DateTime<Utc>, &AgentId) {
        (
            self.priority,
            self.oldest_lock.unwrap_or(DateTime::<Utc>::MAX_UTC),
            &self.agent,
        )
    }
}

/// Pick the agent whose work is given up to break a cycle.
pub fn select_victim(candidates: &[VictimCandidate]) -> Option<&VictimCandidate> {
    candidates.iter().min_by(|a, b| a.sort_key().cmp(&b.sort_key()))
}
