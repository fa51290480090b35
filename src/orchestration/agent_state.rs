//! Read model of what every worker is doing.
//!
//! The supervisor owns worker processes; this manager only mirrors the
//! worker's logical state (idle, working, stalled, crashed) as observed from
//! heartbeats and protocol messages. The engine consults it to find idle
//! workers and to notice silent ones.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::agent::AgentId;
use crate::core::task::{ResourceId, TaskId};
use crate::events::{EventKind, EventSink};
use crate::orchestration::coordinator::RequestId;
use crate::util::millis;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum AgentStatus {
    #[default]
    Idle,
    Working {
        task_id: TaskId,
    },
    /// No heartbeat within the stale threshold.
    Stalled,
    Crashed {
        reason: String,
    },
}

impl AgentStatus {
    pub fn name(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working { .. } => "working",
            AgentStatus::Stalled => "stalled",
            AgentStatus::Crashed { .. } => "crashed",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, AgentStatus::Idle)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Working { task_id } => write!(f, "working on {}", task_id),
            AgentStatus::Crashed { reason } => write!(f, "crashed: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub current_task: Option<TaskId>,
    #[serde(default)]
    pub held_resources: BTreeSet<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_request: Option<RequestId>,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub tasks_failed: u32,
}

impl AgentState {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            status: AgentStatus::Idle,
            last_heartbeat: Utc::now(),
            current_task: None,
            held_resources: BTreeSet::new(),
            pending_request: None,
            connected: false,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    pub fn silent_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or_default()
    }

    /// Connected, idle and not waiting on a lock request.
    pub fn is_available(&self) -> bool {
        self.connected && self.status.is_idle() && self.pending_request.is_none()
    }
}

pub struct AgentStateManager {
    agents: RwLock<HashMap<AgentId, AgentState>>,
    events: EventSink,
}

impl AgentStateManager {
    pub fn new(events: EventSink) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub async fn register(&self, agent: &AgentId) -> Result<()> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(agent) {
            return Err(Error::AgentExists(agent.clone()));
        }
        agents.insert(agent.clone(), AgentState::new(agent.clone()));
        debug!(%agent, "agent registered");
        Ok(())
    }

    pub async fn unregister(&self, agent: &AgentId) -> Option<AgentState> {
        self.agents.write().await.remove(agent)
    }

    /// Mark a worker connected, registering it if unknown. A worker that
    /// reconnects after a crash or stall starts over as idle.
    pub async fn connect(&self, agent: &AgentId) {
        let mut agents = self.agents.write().await;
        let state = agents
            .entry(agent.clone())
            .or_insert_with(|| AgentState::new(agent.clone()));
        state.connected = true;
        state.last_heartbeat = Utc::now();
        if matches!(state.status, AgentStatus::Crashed { .. } | AgentStatus::Stalled) {
            state.current_task = None;
            state.pending_request = None;
            state.held_resources.clear();
            self.set_status(state, AgentStatus::Idle);
        }
        info!(%agent, "agent connected");
    }

    pub async fn disconnect(&self, agent: &AgentId) {
        if let Some(state) = self.agents.write().await.get_mut(agent) {
            state.connected = false;
            state.pending_request = None;
            info!(%agent, "agent disconnected");
        }
    }

    pub async fn heartbeat(&self, agent: &AgentId) -> Result<()> {
        let mut agents = self.agents.write().await;
        let state = agents
            .get_mut(agent)
            .ok_or_else(|| Error::AgentNotFound(agent.clone()))?;
        state.last_heartbeat = Utc::now();
        if state.status == AgentStatus::Stalled {
            let next = match &state.current_task {
                Some(task_id) => AgentStatus::Working {
                    task_id: task_id.clone(),
                },
                None => AgentStatus::Idle,
            };
            self.set_status(state, next);
        }
        Ok(())
    }

    pub async fn assign(&self, agent: &AgentId, task: &TaskId) -> Result<()> {
        self.update(agent, |manager, state| {
            state.current_task = Some(task.clone());
            state.pending_request = None;
            manager.set_status(
                state,
                AgentStatus::Working {
                    task_id: task.clone(),
                },
            );
        })
        .await
    }

    /// The agent has a lock request queued in the coordinator.
    pub async fn waiting(&self, agent: &AgentId, request: RequestId) -> Result<()> {
        self.update(agent, |_, state| state.pending_request = Some(request))
            .await
    }

    pub async fn clear_wait(&self, agent: &AgentId) -> Result<()> {
        self.update(agent, |_, state| state.pending_request = None).await
    }

    pub async fn locks_acquired(&self, agent: &AgentId, resources: &[ResourceId]) -> Result<()> {
        self.update(agent, |_, state| {
            state.held_resources.extend(resources.iter().cloned());
            state.pending_request = None;
        })
        .await
    }

    pub async fn locks_released(&self, agent: &AgentId) -> Result<()> {
        self.update(agent, |_, state| state.held_resources.clear())
            .await
    }

    /// The agent's current task ended.
    pub async fn finish(&self, agent: &AgentId, success: bool) -> Result<()> {
        self.update(agent, |manager, state| {
            if success {
                state.tasks_completed += 1;
            } else {
                state.tasks_failed += 1;
            }
            state.current_task = None;
            state.held_resources.clear();
            if !matches!(state.status, AgentStatus::Crashed { .. }) {
                manager.set_status(state, AgentStatus::Idle);
            }
        })
        .await
    }

    pub async fn mark_crashed(&self, agent: &AgentId, reason: &str) -> Result<()> {
        self.update(agent, |manager, state| {
            state.connected = false;
            state.pending_request = None;
            state.held_resources.clear();
            manager.set_status(
                state,
                AgentStatus::Crashed {
                    reason: reason.to_string(),
                },
            );
        })
        .await
    }

    /// Flag connected agents silent for longer than `threshold` as stalled.
    /// Returns the newly stalled agents, sorted.
    pub async fn mark_stale(&self, threshold: Duration) -> Vec<AgentId> {
        let now = Utc::now();
        let mut agents = self.agents.write().await;
        let mut stalled = Vec::new();
        for state in agents.values_mut() {
            if !state.connected
                || matches!(state.status, AgentStatus::Stalled | AgentStatus::Crashed { .. })
            {
                continue;
            }
            let silent_for = state.silent_for(now);
            if silent_for <= threshold {
                continue;
            }
            warn!(agent = %state.agent_id, silent_ms = millis(silent_for), "heartbeat stale");
            self.events.agent(
                &state.agent_id,
                EventKind::HeartbeatStale {
                    silent_for_ms: millis(silent_for),
                },
            );
            self.set_status(state, AgentStatus::Stalled);
            stalled.push(state.agent_id.clone());
        }
        stalled.sort();
        stalled
    }

    /// Agents ready for new work, sorted by id.
    pub async fn idle_agents(&self) -> Vec<AgentId> {
        let agents = self.agents.read().await;
        let mut idle: Vec<AgentId> = agents
            .values()
            .filter(|state| state.is_available())
            .map(|state| state.agent_id.clone())
            .collect();
        idle.sort();
        idle
    }

    pub async fn get(&self, agent: &AgentId) -> Option<AgentState> {
        self.agents.read().await.get(agent).cloned()
    }

    pub async fn snapshot(&self) -> Vec<AgentState> {
        let agents = self.agents.read().await;
        let mut states: Vec<AgentState> = agents.values().cloned().collect();
        states.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        states
    }

    /// Reload states from a snapshot; every agent starts disconnected.
    pub async fn restore(&self, states: Vec<AgentState>) {
        let mut agents = self.agents.write().await;
        agents.clear();
        for mut state in states {
            state.connected = false;
            state.pending_request = None;
            agents.insert(state.agent_id.clone(), state);
        }
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    async fn update(
        &self,
        agent: &AgentId,
        apply: impl FnOnce(&Self, &mut AgentState),
    ) -> Result<()> {
        let mut agents = self.agents.write().await;
        let state = agents
            .get_mut(agent)
            .ok_or_else(|| Error::AgentNotFound(agent.clone()))?;
        apply(self, state);
        Ok(())
    }

    fn set_status(&self, state: &mut AgentState, status: AgentStatus) {
        if state.status == status {
            return;
        }
        debug!(agent = %state.agent_id, from = state.status.name(), to = status.name(), "agent status");
        state.status = status;
        self.events.agent(
            &state.agent_id,
            EventKind::AgentStatusChanged {
                status: state.status.to_string(),
            },
        );
    }
}
