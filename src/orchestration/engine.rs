//! The orchestrator binds the task graph, the coordinator, the supervisor
//! and the agent read model together.
//!
//! Control flow: the graph reports executable tasks, [`Orchestrator::dispatch`]
//! pairs them with idle workers and asks the coordinator for their locks, a
//! grant turns into an `AssignTask` message, and the worker's
//! `TaskCompleted`/`TaskFailed` report releases the locks and unblocks
//! dependents.
//!
//! All inbound worker messages pass through one queue consumed by
//! [`Orchestrator::run`], so messages of one worker are handled in the
//! order they were received.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentId, WorkerCommand};
use crate::config::Config;
use crate::core::dag::{DependencyEdge, DependencyKind, StatusCounts, TaskDAG};
use crate::core::plan::TaskPlan;
use crate::core::task::{ResourceId, Task, TaskId};
use crate::events::{EventKind, EventSink};
use crate::orchestration::agent_state::{AgentState, AgentStateManager};
use crate::orchestration::coordinator::{
    CollaborationCoordinator, CoordinatorMetrics, DenialReason, ExecutionDecision,
    ExecutionRequest, Grant, ReleaseCause, RequestId, RequestTicket, ResourceLock,
};
use crate::orchestration::health::HealthMonitor;
use crate::orchestration::supervisor::{
    SupervisionReport, Supervisor, WorkerProcess, WorkerSpec,
};
use crate::transport::{Envelope, FrameReader, FrameSender, Message, TransportListener};
use crate::{Error, Result};

/// How long a fresh connection may take to identify itself.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for each worker to take its shutdown notice.
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);

/// What [`Orchestrator::dispatch`] did with one executable task.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Started,
    Queued(RequestId),
    Denied(DenialReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub agent: AgentId,
    pub task: TaskId,
    pub outcome: DispatchOutcome,
}

/// Deadlock resolutions, expired locks and stalled agents handled by one
/// maintenance round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    pub deadlock_victims: Vec<AgentId>,
    pub expired_locks: Vec<ResourceLock>,
    pub stalled_agents: Vec<AgentId>,
}

impl MaintenanceReport {
    pub fn is_quiet(&self) -> bool {
        self.deadlock_victims.is_empty()
            && self.expired_locks.is_empty()
            && self.stalled_agents.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub tasks: StatusCounts,
    pub coordinator: CoordinatorMetrics,
    pub workers: usize,
    pub connected: usize,
}

/// Serializable state of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tasks: Vec<Task>,
    pub edges: Vec<DependencyEdge>,
    pub locks: Vec<ResourceLock>,
    pub workers: Vec<WorkerProcess>,
    #[serde(default)]
    pub agents: Vec<AgentState>,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

/// What to do once a queued request is granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrantAction {
    /// The request was made by dispatch; start (or resume) the task.
    StartTask,
    /// The worker asked for the locks itself; tell it.
    NotifyWorker,
}

/// Identifies one accepted socket. A worker that reconnects gets a new id,
/// so the close of its old socket can be told apart from the live one.
type ConnectionId = u64;

enum Inbound {
    Connected {
        agent: AgentId,
        connection: ConnectionId,
        sender: FrameSender,
    },
    Received {
        agent: AgentId,
        envelope: Envelope,
    },
    Disconnected {
        agent: AgentId,
        connection: ConnectionId,
    },
}

#[derive(Clone)]
struct Peer {
    connection: ConnectionId,
    sender: FrameSender,
}

pub struct Orchestrator {
    config: Arc<Config>,
    dag: RwLock<TaskDAG>,
    coordinator: Arc<CollaborationCoordinator>,
    supervisor: Arc<Supervisor>,
    agents: AgentStateManager,
    events: EventSink,
    connections: RwLock<HashMap<AgentId, Peer>>,
    /// Tasks with a queued dispatch request.
    reserved: Mutex<HashSet<TaskId>>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, events: EventSink) -> Result<Arc<Self>> {
        let monitor = HealthMonitor::new(config.health.clone());
        Self::with_monitor(config, events, monitor)
    }

    /// Like [`Orchestrator::new`] with a custom health monitor.
    pub fn with_monitor(
        config: Arc<Config>,
        events: EventSink,
        monitor: HealthMonitor,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let coordinator = Arc::new(CollaborationCoordinator::new(
            config.coordinator.clone(),
            events.clone(),
        ));
        let supervisor = Supervisor::new(
            config.max_workers,
            monitor,
            config.restart.clone(),
            events.clone(),
        )
        .with_releaser(coordinator.clone());

        Ok(Arc::new(Self {
            agents: AgentStateManager::new(events.clone()),
            config,
            dag: RwLock::new(TaskDAG::new()),
            coordinator,
            supervisor: Arc::new(supervisor),
            events,
            connections: RwLock::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn coordinator(&self) -> &CollaborationCoordinator {
        &self.coordinator
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn agents(&self) -> &AgentStateManager {
        &self.agents
    }

    // -- task graph -------------------------------------------------------

    pub async fn add_task(&self, task: Task) -> Result<()> {
        let id = task.id.clone();
        let title = task.title.clone();
        let executable = {
            let mut dag = self.dag.write().await;
            dag.add_task(task)?;
            dag.get_executable_tasks().contains(&id)
        };
        self.events.task(&id, EventKind::TaskAdded { title });
        if executable {
            self.events.task(&id, EventKind::TaskExecutable);
        }
        Ok(())
    }

    pub async fn add_dependency(&self, from: &TaskId, to: &TaskId, kind: DependencyKind) -> Result<()> {
        let result = self.dag.write().await.add_dependency(from, to, kind);
        match &result {
            Ok(()) => self.events.task(
                to,
                EventKind::DependencyAdded {
                    from: from.clone(),
                    to: to.clone(),
                },
            ),
            Err(Error::CyclicDependency { cycle }) => {
                self.events.system(EventKind::CycleDetected {
                    cycle: cycle.clone(),
                });
            }
            Err(_) => {}
        }
        result
    }

    pub async fn remove_dependency(&self, from: &TaskId, to: &TaskId) -> Result<bool> {
        let (removed, executable) = {
            let mut dag = self.dag.write().await;
            let removed = dag.remove_dependency(from, to)?;
            (removed, dag.get_executable_tasks().contains(to))
        };
        if removed {
            self.events.task(
                to,
                EventKind::DependencyRemoved {
                    from: from.clone(),
                    to: to.clone(),
                },
            );
            if executable {
                self.events.task(to, EventKind::TaskExecutable);
            }
        }
        Ok(removed)
    }

    /// Merge a task plan into the graph. Nothing is added if the plan is
    /// invalid.
    pub async fn load_plan(&self, plan: &TaskPlan) -> Result<usize> {
        let mut dag = self.dag.write().await;
        let mut staged = TaskDAG::restore(
            dag.tasks().into_iter().cloned().collect(),
            dag.edges(),
        )?;
        let added = plan.apply_to(&mut staged)?;
        *dag = staged;
        info!(added, total = dag.task_count(), "plan loaded");
        Ok(added)
    }

    pub async fn executable_tasks(&self) -> BTreeSet<TaskId> {
        self.dag.read().await.get_executable_tasks()
    }

    pub async fn critical_path(&self) -> Result<Vec<TaskId>> {
        self.dag.read().await.critical_path()
    }

    pub async fn task(&self, id: &TaskId) -> Option<Task> {
        self.dag.read().await.get_task(id).cloned()
    }

    pub async fn retry_task(&self, id: &TaskId) -> Result<bool> {
        let executable = self.dag.write().await.retry_task(id)?;
        self.events.task(id, EventKind::TaskRetried);
        if executable {
            self.events.task(id, EventKind::TaskExecutable);
        }
        Ok(executable)
    }

    pub async fn purge_task(&self, id: &TaskId) -> Result<Task> {
        let task = self.dag.write().await.purge_task(id)?;
        self.reserved.lock().await.remove(id);
        self.events.task(id, EventKind::TaskPurged);
        Ok(task)
    }

    pub async fn all_complete(&self) -> bool {
        self.dag.read().await.all_complete()
    }

    // -- workers ----------------------------------------------------------

    /// Launch and supervise a worker process for `agent`.
    pub async fn spawn_worker(self: &Arc<Self>, agent: &AgentId) -> Result<WorkerProcess> {
        let mut spec = WorkerSpec::new(agent.clone(), WorkerCommand::from_config(&self.config))
            .with_socket(self.config.socket_path()?);
        if let Some(dir) = self.config.worker.working_dir() {
            spec = spec.with_working_dir(dir);
        }
        for (key, value) in &self.config.worker.env {
            spec = spec.with_env(key.clone(), value.clone());
        }

        let process = self.supervisor.start(spec).await?;
        if let Err(e) = self.agents.register(agent).await {
            debug!(%agent, error = %e, "agent already known");
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.supervisor.supervise(agent, tx).await?;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                this.on_supervision(report).await;
            }
        });
        Ok(process)
    }

    pub async fn stop_worker(&self, agent: &AgentId) -> Result<()> {
        self.supervisor.stop(agent).await?;
        self.fail_agent_work(agent, "worker stopped", ReleaseCause::Stopped)
            .await;
        self.agents.disconnect(agent).await;
        Ok(())
    }

    /// Mark an agent connected without a socket, e.g. a worker driven
    /// in-process.
    pub async fn register_agent(&self, agent: &AgentId) {
        self.agents.connect(agent).await;
    }

    // -- dispatch ---------------------------------------------------------

    /// Pair executable tasks with idle agents and request their locks.
    ///
    /// Tasks are considered by descending priority, critical-path members
    /// first among equals, then by id. A denied request leaves the agent
    /// free for the next task.
    pub async fn dispatch(self: &Arc<Self>) -> Result<Vec<Assignment>> {
        let mut idle = self.agents.idle_agents().await.into_iter().peekable();
        if idle.peek().is_none() {
            return Ok(Vec::new());
        }

        let candidates = self.ranked_candidates().await;
        let mut assignments = Vec::new();
        for (task, resources, priority) in candidates {
            let Some(agent) = idle.peek().cloned() else {
                break;
            };
            let request = ExecutionRequest::new(agent.clone(), task.clone(), resources)
                .with_priority(priority);
            let outcome = match self.coordinator.request_execution(request).await? {
                ExecutionDecision::Granted(grant) => {
                    if let Err(e) = self.begin_task(&agent, &task, &grant.resources).await {
                        warn!(%agent, %task, error = %e, "could not start granted task");
                        continue;
                    }
                    DispatchOutcome::Started
                }
                ExecutionDecision::Queued(ticket) => match self.park(ticket, GrantAction::StartTask).await {
                    Ok(id) => DispatchOutcome::Queued(id),
                    Err(e) => {
                        warn!(%agent, %task, error = %e, "request withdrawn");
                        idle.next();
                        continue;
                    }
                },
                ExecutionDecision::Denied(reason) => {
                    assignments.push(Assignment {
                        agent,
                        task,
                        outcome: DispatchOutcome::Denied(reason),
                    });
                    continue;
                }
            };
            idle.next();
            assignments.push(Assignment {
                agent,
                task,
                outcome,
            });
        }
        Ok(assignments)
    }

    async fn ranked_candidates(&self) -> Vec<(TaskId, BTreeSet<ResourceId>, i32)> {
        let reserved = self.reserved.lock().await.clone();
        let dag = self.dag.read().await;
        let critical: BTreeSet<TaskId> = match dag.critical_path() {
            Ok(path) => path.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "critical path unavailable");
                BTreeSet::new()
            }
        };
        let executable = dag.get_executable_tasks();
        let mut tasks: Vec<&Task> = executable
            .iter()
            .filter(|id| !reserved.contains(*id))
            .filter_map(|id| dag.get_task(id))
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| critical.contains(&b.id).cmp(&critical.contains(&a.id)))
                .then_with(|| a.id.cmp(&b.id))
        });
        tasks
            .into_iter()
            .map(|task| (task.id.clone(), task.required_resources.clone(), task.priority))
            .collect()
    }

    /// Move a granted task to Running and hand it to the worker. A task that
    /// is already running on this agent is resumed (its locks came back
    /// after a deadlock preemption).
    async fn begin_task(&self, agent: &AgentId, task_id: &TaskId, resources: &[ResourceId]) -> Result<()> {
        let started = {
            let mut dag = self.dag.write().await;
            let resuming = dag
                .get_task(task_id)
                .is_some_and(|t| t.is_running() && t.agent_id.as_ref() == Some(agent));
            let result = if resuming {
                Ok(())
            } else {
                dag.start_task(task_id, agent.clone())
            };
            result.map(|()| dag.get_task(task_id).cloned())
        };
        let task = match started {
            Ok(Some(task)) => task,
            Ok(None) => return Err(Error::TaskNotFound(task_id.clone())),
            Err(e) => {
                let _ = self.coordinator.notify_completion(agent, task_id, &[]).await;
                return Err(e);
            }
        };

        self.agents.assign(agent, task_id).await?;
        self.agents.locks_acquired(agent, resources).await?;
        info!(%agent, task = %task_id, "task assigned");
        self.events.task(
            task_id,
            EventKind::TaskStarted {
                agent: agent.clone(),
            },
        );
        self.send_to(
            agent,
            Message::AssignTask {
                task_id: task.id,
                title: task.title,
                description: task.description,
                resources: resources.to_vec(),
            },
        )
        .await;
        Ok(())
    }

    /// Record a queued request on its agent and wait for the grant in the
    /// background. If the agent cannot take it the request is withdrawn,
    /// so its locks are never granted to nobody.
    async fn park(self: &Arc<Self>, ticket: RequestTicket, action: GrantAction) -> Result<RequestId> {
        let id = ticket.request_id;
        if let Err(e) = self.agents.waiting(&ticket.agent_id, id).await {
            self.coordinator.cancel(id).await;
            return Err(e);
        }
        if action == GrantAction::StartTask {
            self.reserved.lock().await.insert(ticket.task_id.clone());
        }
        self.spawn_waiter(ticket, action);
        Ok(id)
    }

    fn spawn_waiter(self: &Arc<Self>, ticket: RequestTicket, action: GrantAction) {
        let this = Arc::clone(self);
        let timeout = self.config.coordinator.request_timeout;
        tokio::spawn(async move {
            let agent = ticket.agent_id.clone();
            let task = ticket.task_id.clone();
            let outcome = this.coordinator.wait_for(ticket, timeout).await;
            this.on_wait_finished(agent, task, action, outcome).await;
        });
    }

    async fn on_wait_finished(
        &self,
        agent: AgentId,
        task: TaskId,
        action: GrantAction,
        outcome: Result<Grant>,
    ) {
        if action == GrantAction::StartTask {
            self.reserved.lock().await.remove(&task);
        }
        match (outcome, action) {
            (Ok(grant), GrantAction::StartTask) => {
                if let Err(e) = self.begin_task(&agent, &task, &grant.resources).await {
                    warn!(%agent, %task, error = %e, "could not start task after wait");
                    let _ = self.agents.clear_wait(&agent).await;
                }
            }
            (Ok(grant), GrantAction::NotifyWorker) => {
                let _ = self.agents.locks_acquired(&agent, &grant.resources).await;
                self.send_to(
                    &agent,
                    Message::ExecutionGranted {
                        task_id: task,
                        resources: grant.resources,
                    },
                )
                .await;
            }
            (Err(e), action) => {
                debug!(%agent, %task, error = %e, "queued request ended without grant");
                let _ = self.agents.clear_wait(&agent).await;
                // A withdrawn request was cancelled on purpose or its task ended.
                if action == GrantAction::NotifyWorker && !matches!(e, Error::RequestCancelled(_)) {
                    self.send_to(&agent, Message::from_error(&e)).await;
                }
            }
        }
    }

    // -- task outcomes ----------------------------------------------------

    /// A worker finished its task. Completing a completed task is a no-op.
    pub async fn complete_task(&self, agent: &AgentId, task_id: &TaskId) -> Result<BTreeSet<TaskId>> {
        let unblocked = {
            let mut dag = self.dag.write().await;
            let task = dag
                .get_task(task_id)
                .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
            if task.is_completed() {
                return Ok(BTreeSet::new());
            }
            check_assignee(task, agent)?;
            dag.complete_task(task_id)?
        };

        self.coordinator.notify_completion(agent, task_id, &[]).await?;
        self.agents.finish(agent, true).await?;
        info!(%agent, task = %task_id, unblocked = unblocked.len(), "task completed");
        self.events.task(
            task_id,
            EventKind::TaskCompleted {
                agent: Some(agent.clone()),
                unblocked: unblocked.iter().cloned().collect(),
            },
        );
        for id in &unblocked {
            self.events.task(id, EventKind::TaskExecutable);
        }
        Ok(unblocked)
    }

    pub async fn fail_task(&self, agent: &AgentId, task_id: &TaskId, error: &str) -> Result<()> {
        {
            let mut dag = self.dag.write().await;
            let task = dag
                .get_task(task_id)
                .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
            check_assignee(task, agent)?;
            dag.fail_task(task_id, error)?;
        }
        self.coordinator.notify_completion(agent, task_id, &[]).await?;
        self.agents.finish(agent, false).await?;
        self.events.task(
            task_id,
            EventKind::TaskFailed {
                agent: Some(agent.clone()),
                error: error.to_string(),
            },
        );
        Ok(())
    }

    /// Fail everything an agent is running and take its locks away.
    async fn fail_agent_work(&self, agent: &AgentId, reason: &str, cause: ReleaseCause) {
        let running = self.dag.read().await.running_tasks_of(agent);
        for task in running {
            if let Err(e) = self.fail_task(agent, &task, reason).await {
                warn!(%agent, %task, error = %e, "could not fail task");
            }
        }
        self.coordinator.release_agent(agent, cause).await;
        let _ = self.agents.locks_released(agent).await;
    }

    // -- messages ---------------------------------------------------------

    /// Handle one message from a connected worker. Returns the reply, if
    /// any.
    pub async fn handle_message(self: &Arc<Self>, agent: &AgentId, message: Message) -> Result<Option<Message>> {
        if let Some(claimed) = message.sender() {
            if claimed != agent {
                return Err(Error::Validation(format!(
                    "message from {} claims to come from {}",
                    agent, claimed
                )));
            }
        }

        match message {
            Message::Heartbeat { .. } => {
                self.agents.heartbeat(agent).await?;
                match self.supervisor.record_heartbeat(agent).await {
                    Ok(()) | Err(Error::AgentNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                Ok(None)
            }
            Message::TaskCompleted { task_id, .. } => {
                self.complete_task(agent, &task_id).await?;
                Ok(None)
            }
            Message::TaskFailed { task_id, error, .. } => {
                self.fail_task(agent, &task_id, &error).await?;
                Ok(None)
            }
            Message::RequestExecution {
                task_id, resources, ..
            } => {
                // Locks are only handed out for a task the worker is running,
                // so finishing that task releases them again.
                let priority = {
                    let dag = self.dag.read().await;
                    let task = dag
                        .get_task(&task_id)
                        .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
                    check_assignee(task, agent)?;
                    if !task.is_running() {
                        return Err(Error::Validation(format!("task {} is not running", task_id)));
                    }
                    task.priority
                };
                let request = ExecutionRequest::new(agent.clone(), task_id.clone(), resources)
                    .with_priority(priority);
                let reply = match self.coordinator.request_execution(request).await? {
                    ExecutionDecision::Granted(grant) => {
                        self.agents.locks_acquired(agent, &grant.resources).await?;
                        Message::ExecutionGranted {
                            task_id,
                            resources: grant.resources,
                        }
                    }
                    ExecutionDecision::Queued(ticket) => {
                        let request_id = self.park(ticket, GrantAction::NotifyWorker).await?;
                        Message::ExecutionQueued {
                            task_id,
                            request_id,
                        }
                    }
                    ExecutionDecision::Denied(reason) => Message::ExecutionDenied { task_id, reason },
                };
                Ok(Some(reply))
            }
            Message::CancelRequest { request_id, .. } => {
                let owned = self
                    .coordinator
                    .pending_requests()
                    .await
                    .iter()
                    .any(|p| p.request_id == request_id && &p.agent_id == agent);
                if !owned || !self.coordinator.cancel(request_id).await {
                    return Err(Error::Validation(format!(
                        "request {} is not pending for {}",
                        request_id, agent
                    )));
                }
                Ok(Some(Message::RequestCancelled { request_id }))
            }
            Message::SendInput { agent_id, input } => {
                let delivered = self
                    .send_to(
                        &agent_id,
                        Message::SendInput {
                            agent_id: agent_id.clone(),
                            input,
                        },
                    )
                    .await;
                if !delivered {
                    return Err(Error::AgentNotFound(agent_id));
                }
                Ok(None)
            }
            Message::CreateSession { .. } => Err(Error::Validation(
                "session already established".to_string(),
            )),
            other => Err(Error::Validation(format!(
                "unexpected message from worker: {}",
                other.name()
            ))),
        }
    }

    /// Queue a message for a worker without waiting on its socket. A worker
    /// that stopped reading loses the message instead of stalling the loop.
    async fn send_to(&self, agent: &AgentId, message: Message) -> bool {
        let peer = self.connections.read().await.get(agent).cloned();
        let Some(peer) = peer else {
            debug!(%agent, kind = message.name(), "no connection, message not sent");
            return false;
        };
        let kind = message.name();
        match peer.sender.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(%agent, kind, error = %e, "send failed");
                false
            }
        }
    }

    /// Tell every connected worker to shut down, waiting a bounded time for
    /// each notice to be written.
    async fn broadcast_shutdown(&self) {
        let peers: Vec<(AgentId, FrameSender)> = self
            .connections
            .read()
            .await
            .iter()
            .map(|(agent, peer)| (agent.clone(), peer.sender.clone()))
            .collect();
        let notices = peers.iter().map(|(agent, sender)| async move {
            match tokio::time::timeout(SHUTDOWN_FLUSH, sender.send(Message::Shutdown)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(%agent, error = %e, "shutdown notice not sent"),
                Err(_) => warn!(%agent, "shutdown notice not flushed in time"),
            }
        });
        futures::future::join_all(notices).await;
    }

    // -- maintenance ------------------------------------------------------

    /// Resolve deadlocks, expire old locks and deal with silent agents.
    pub async fn maintain(self: &Arc<Self>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self.coordinator.resolve_deadlocks().await {
            Ok(resolutions) => {
                for resolution in resolutions {
                    let victim = resolution.victim.clone();
                    let _ = self.agents.locks_released(&victim).await;
                    for member in &resolution.cycle {
                        self.send_to(
                            member,
                            Message::DeadlockDetected {
                                agents: resolution.cycle.clone(),
                                victim: victim.clone(),
                            },
                        )
                        .await;
                    }
                    self.send_to(
                        &victim,
                        Message::ForceRelease {
                            agent_id: victim.clone(),
                            resources: resolution
                                .released
                                .iter()
                                .map(|lock| lock.resource.clone())
                                .collect(),
                            cause: ReleaseCause::Deadlock,
                        },
                    )
                    .await;
                    for ticket in resolution.requeued {
                        let task = ticket.task_id.clone();
                        if let Err(e) = self.park(ticket, GrantAction::StartTask).await {
                            warn!(agent = %victim, %task, error = %e, "requeued request withdrawn");
                        }
                    }
                    report.deadlock_victims.push(victim);
                }
            }
            Err(e) => {
                error!(error = %e, "deadlock could not be resolved");
                self.events.system(EventKind::Failure {
                    error_kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }

        let expired = self.coordinator.expire_locks().await;
        let mut expired_tasks = BTreeSet::new();
        for lock in &expired {
            if expired_tasks.insert((lock.holder.clone(), lock.task_id.clone())) {
                self.send_to(
                    &lock.holder,
                    Message::ForceRelease {
                        agent_id: lock.holder.clone(),
                        resources: vec![lock.resource.clone()],
                        cause: ReleaseCause::Timeout,
                    },
                )
                .await;
            }
        }
        for (holder, task) in expired_tasks {
            let running = self
                .dag
                .read()
                .await
                .get_task(&task)
                .is_some_and(|t| t.is_running());
            if running {
                if let Err(e) = self.fail_task(&holder, &task, "lock expired").await {
                    warn!(agent = %holder, %task, error = %e, "could not fail task after lock expiry");
                }
            }
        }
        report.expired_locks = expired;

        let stalled = self
            .agents
            .mark_stale(self.config.health.stale_heartbeat_after)
            .await;
        for agent in &stalled {
            // Supervised workers are restarted by their monitor.
            if self.supervisor.get(agent).await.is_none() {
                self.fail_agent_work(agent, "heartbeat stale", ReleaseCause::Failed)
                    .await;
                self.agents.disconnect(agent).await;
            }
        }
        report.stalled_agents = stalled;

        if !report.is_quiet() {
            info!(
                victims = report.deadlock_victims.len(),
                expired = report.expired_locks.len(),
                stalled = report.stalled_agents.len(),
                "maintenance round"
            );
        }
        report
    }

    async fn on_supervision(&self, report: SupervisionReport) {
        match report {
            SupervisionReport::Restarted { agent, reason, .. } => {
                let reason = format!("worker restarted: {}", reason);
                self.fail_agent_work(&agent, &reason, ReleaseCause::Restart)
                    .await;
                self.connections.write().await.remove(&agent);
                self.agents.disconnect(&agent).await;
            }
            SupervisionReport::Crashed { agent, reason } => {
                self.fail_agent_work(&agent, &reason, ReleaseCause::Failed)
                    .await;
                self.connections.write().await.remove(&agent);
                let _ = self.agents.mark_crashed(&agent, &reason).await;
            }
            SupervisionReport::Healthy { .. } | SupervisionReport::Inactive { .. } => {}
        }
    }

    // -- snapshot ---------------------------------------------------------

    pub async fn snapshot(&self) -> Snapshot {
        let (tasks, edges) = {
            let dag = self.dag.read().await;
            (dag.tasks().into_iter().cloned().collect(), dag.edges())
        };
        Snapshot {
            tasks,
            edges,
            locks: self.coordinator.locks().await,
            workers: self.supervisor.snapshot().await,
            agents: self.agents.snapshot().await,
            taken_at: Utc::now(),
        }
    }

    /// Replace graph, locks and agent states with a snapshot. Worker
    /// processes are not revived; agents come back as they reconnect.
    pub async fn restore(&self, snapshot: Snapshot) -> Result<()> {
        let dag = TaskDAG::restore(snapshot.tasks, snapshot.edges)?;
        dag.validate()?;
        for lock in &snapshot.locks {
            if !dag.contains_task(&lock.task_id) {
                return Err(Error::TaskNotFound(lock.task_id.clone()));
            }
        }
        self.coordinator.restore_locks(snapshot.locks).await?;
        self.agents.restore(snapshot.agents).await;
        self.reserved.lock().await.clear();
        info!(
            tasks = dag.task_count(),
            workers = snapshot.workers.len(),
            "state restored"
        );
        *self.dag.write().await = dag;
        Ok(())
    }

    pub async fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            tasks: self.dag.read().await.status_counts(),
            coordinator: self.coordinator.metrics().await,
            workers: self.supervisor.active_count().await,
            connected: self.connections.read().await.len(),
        }
    }

    // -- run loop ---------------------------------------------------------

    /// Accept worker connections and drive the system until `cancel` fires.
    pub async fn run(self: Arc<Self>, listener: TransportListener, cancel: CancellationToken) -> Result<()> {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Inbound>();
        let mut next_connection: ConnectionId = 0;
        let mut maintenance = tokio::time::interval(self.config.coordinator.deadlock_check_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(socket = %listener.path().display(), "orchestrator running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(connection) => {
                        next_connection += 1;
                        let (reader, sender) = connection.split();
                        tokio::spawn(serve_connection(
                            next_connection,
                            reader,
                            sender,
                            inbound_tx.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(inbound) = inbound_rx.recv() => {
                    self.process_inbound(inbound).await;
                    self.dispatch_logged().await;
                }
                _ = maintenance.tick() => {
                    self.maintain().await;
                    self.dispatch_logged().await;
                }
            }
        }

        info!("orchestrator shutting down");
        self.broadcast_shutdown().await;
        self.supervisor.stop_all().await;
        Ok(())
    }

    async fn dispatch_logged(self: &Arc<Self>) {
        match self.dispatch().await {
            Ok(assignments) if !assignments.is_empty() => {
                debug!(count = assignments.len(), "dispatched");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "dispatch failed"),
        }
    }

    async fn process_inbound(self: &Arc<Self>, inbound: Inbound) {
        match inbound {
            Inbound::Connected {
                agent,
                connection,
                sender,
            } => {
                let replaced = self
                    .connections
                    .write()
                    .await
                    .insert(agent.clone(), Peer { connection, sender });
                if let Some(old) = replaced {
                    warn!(%agent, old = old.connection, new = connection, "worker reconnected, using the new connection");
                }
                self.agents.connect(&agent).await;
                self.events.agent(&agent, EventKind::WorkerConnected);
            }
            Inbound::Received { agent, envelope } => {
                let kind = envelope.message.name();
                match self.handle_message(&agent, envelope.message).await {
                    Ok(Some(reply)) => {
                        self.send_to(&agent, reply).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(%agent, kind, error = %e, "message rejected");
                        self.send_to(&agent, Message::from_error(&e)).await;
                    }
                }
            }
            Inbound::Disconnected { agent, connection } => {
                let current = {
                    let mut connections = self.connections.write().await;
                    let current = connections
                        .get(&agent)
                        .is_some_and(|peer| peer.connection == connection);
                    if current {
                        connections.remove(&agent);
                    }
                    current
                };
                if !current {
                    debug!(%agent, connection, "superseded connection closed");
                    return;
                }
                self.fail_agent_work(&agent, "worker disconnected", ReleaseCause::Disconnected)
                    .await;
                self.agents.disconnect(&agent).await;
                self.events.agent(&agent, EventKind::WorkerDisconnected);
            }
        }
    }
}

fn check_assignee(task: &Task, agent: &AgentId) -> Result<()> {
    if task.agent_id.as_ref() == Some(agent) {
        return Ok(());
    }
    Err(Error::Validation(format!(
        "task {} is not assigned to {}",
        task.id, agent
    )))
}

/// Handshake, then forward every frame of one connection to the engine.
async fn serve_connection(
    connection: ConnectionId,
    mut reader: FrameReader,
    sender: FrameSender,
    inbound: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
) {
    let agent = match tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.recv()).await {
        Ok(Ok(Some(envelope))) => match envelope.message {
            Message::CreateSession { agent_id, pid } if !agent_id.is_blank() => {
                info!(agent = %agent_id, connection, ?pid, "session created");
                agent_id
            }
            other => {
                let error = Error::Validation(format!("expected create_session, got {}", other.name()));
                let _ = sender.send(Message::from_error(&error)).await;
                return;
            }
        },
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            warn!(error = %e, "handshake failed");
            return;
        }
        Err(_) => {
            warn!("handshake timed out");
            return;
        }
    };

    if sender
        .send(Message::SessionAccepted {
            agent_id: agent.clone(),
        })
        .await
        .is_err()
    {
        return;
    }
    if inbound
        .send(Inbound::Connected {
            agent: agent.clone(),
            connection,
            sender: sender.clone(),
        })
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.recv() => match frame {
                Ok(Some(envelope)) => {
                    if inbound.send(Inbound::Received { agent: agent.clone(), envelope }).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(%agent, error = %e, "connection error");
                    if e.is_protocol_violation() {
                        let error = Error::from(e);
                        let _ = sender.send(Message::from_error(&error)).await;
                    }
                    break;
                }
            }
        }
    }

    let _ = inbound.send(Inbound::Disconnected { agent, connection });
}
