//! Collaboration coordinator: exclusive resource locks for workers.
//!
//! A worker asks for every resource a task needs in one request. The
//! request is granted only when all of them are free and nobody queued
//! earlier is waiting for any of them; otherwise it joins the FIFO queue of
//! each resource and receives a [`RequestTicket`]. Requests are denied
//! outright when the worker already holds one of the resources, or when the
//! lock it would wait behind has been held longer than the stale bound.
//!
//! The whole lock table sits behind one async mutex, so every transition
//! (grant, queue, release, promotion, deadlock resolution) is atomic with
//! respect to concurrent requests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::AgentId;
use crate::core::task::{Priority, ResourceId, TaskId};
use crate::events::{EventKind, EventSink};
use crate::orchestration::deadlock::{select_victim, VictimCandidate, WaitForGraph};
use crate::orchestration::supervisor::LockReleaser;
use crate::util::{duration_ms, millis, option_duration_ms};
use crate::{Error, Result};

/// Default age after which a held lock counts as stale.
pub const DEFAULT_LOCK_STALE_AFTER_MS: u64 = 10 * 60 * 1000;

/// Default age after which a held lock is forcibly expired.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30 * 60 * 1000;

/// Default interval between deadlock sweeps.
pub const DEFAULT_DEADLOCK_CHECK_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Waiting behind a lock older than this is denied instead of queued.
    #[serde(rename = "lock_stale_after_ms", with = "option_duration_ms")]
    pub lock_stale_after: Option<Duration>,
    /// Locks older than this are released by [`CollaborationCoordinator::expire_locks`].
    #[serde(rename = "lock_timeout_ms", with = "option_duration_ms")]
    pub lock_timeout: Option<Duration>,
    /// How long a queued request may wait before it is withdrawn.
    #[serde(rename = "request_timeout_ms", with = "option_duration_ms")]
    pub request_timeout: Option<Duration>,
    #[serde(rename = "deadlock_check_interval_ms", with = "duration_ms")]
    pub deadlock_check_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_stale_after: Some(Duration::from_millis(DEFAULT_LOCK_STALE_AFTER_MS)),
            lock_timeout: Some(Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS)),
            request_timeout: None,
            deadlock_check_interval: Duration::from_millis(DEFAULT_DEADLOCK_CHECK_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// An exclusive lock on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource: ResourceId,
    pub holder: AgentId,
    pub task_id: TaskId,
    #[serde(default)]
    pub priority: Priority,
    pub acquired_at: DateTime<Utc>,
}

impl ResourceLock {
    pub fn held_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or_default()
    }
}

/// Why locks were taken away from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseCause {
    Completed,
    Failed,
    Deadlock,
    Timeout,
    Restart,
    Stopped,
    Disconnected,
}

impl std::fmt::Display for ReleaseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReleaseCause::Completed => "completed",
            ReleaseCause::Failed => "failed",
            ReleaseCause::Deadlock => "deadlock",
            ReleaseCause::Timeout => "timeout",
            ReleaseCause::Restart => "restart",
            ReleaseCause::Stopped => "stopped",
            ReleaseCause::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum DenialReason {
    /// The requester already holds this resource.
    AlreadyHeld { resource: ResourceId },
    /// The resource is held by a lock older than the stale bound.
    StaleLock {
        resource: ResourceId,
        holder: AgentId,
        held_for_ms: u64,
    },
    /// The requester already has a pending request for this task.
    DuplicateRequest { task_id: TaskId },
}

impl DenialReason {
    pub fn resource(&self) -> Option<&ResourceId> {
        match self {
            DenialReason::AlreadyHeld { resource } | DenialReason::StaleLock { resource, .. } => {
                Some(resource)
            }
            DenialReason::DuplicateRequest { .. } => None,
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::AlreadyHeld { resource } => write!(f, "{} is already held by the requester", resource),
            DenialReason::StaleLock {
                resource,
                holder,
                held_for_ms,
            } => write!(
                f,
                "{} is held by {} with a stale lock ({}ms)",
                resource, holder, held_for_ms
            ),
            DenialReason::DuplicateRequest { task_id } => {
                write!(f, "a request for task {} is already pending", task_id)
            }
        }
    }
}

impl From<DenialReason> for Error {
    fn from(reason: DenialReason) -> Self {
        let resource = reason
            .resource()
            .cloned()
            .unwrap_or_else(|| ResourceId::new("*"));
        Error::ResourceUnavailable { resource, reason }
    }
}

/// A worker's request to lock every resource a task needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub resources: BTreeSet<ResourceId>,
    pub priority: Priority,
}

impl ExecutionRequest {
    pub fn new<I, R>(agent_id: AgentId, task_id: TaskId, resources: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ResourceId>,
    {
        Self {
            agent_id,
            task_id,
            resources: resources.into_iter().map(Into::into).collect(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Locks handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub request_id: RequestId,
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub resources: Vec<ResourceId>,
    /// Time spent queued; zero for immediate grants.
    pub waited: Duration,
}

/// Handle to a queued request.
pub struct RequestTicket {
    pub request_id: RequestId,
    pub agent_id: AgentId,
    pub task_id: TaskId,
    rx: oneshot::Receiver<Result<Grant>>,
}

impl RequestTicket {
    /// Suspend until the request is granted or withdrawn.
    pub async fn granted(self) -> Result<Grant> {
        let id = self.request_id;
        self.rx.await.map_err(|_| Error::RequestCancelled(id))?
    }
}

impl std::fmt::Debug for RequestTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTicket")
            .field("request_id", &self.request_id)
            .field("agent_id", &self.agent_id)
            .field("task_id", &self.task_id)
            .finish()
    }
}

#[derive(Debug)]
pub enum ExecutionDecision {
    Granted(Grant),
    Queued(RequestTicket),
    Denied(DenialReason),
}

impl ExecutionDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, ExecutionDecision::Granted(_))
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, ExecutionDecision::Queued(_))
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, ExecutionDecision::Denied(_))
    }
}

/// Outcome of breaking one deadlock cycle.
#[derive(Debug)]
pub struct DeadlockResolution {
    pub cycle: Vec<AgentId>,
    pub victim: AgentId,
    /// Locks taken from the victim.
    pub released: Vec<ResourceLock>,
    /// New requests queued at the tail on the victim's behalf, one per task
    /// that lost its locks.
    pub requeued: Vec<RequestTicket>,
}

/// Read-only view of a queued request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub resources: Vec<ResourceId>,
    pub priority: Priority,
}

/// Efficiency and utilization view of the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoordinatorMetrics {
    pub requests: u64,
    pub granted_immediately: u64,
    pub granted_after_wait: u64,
    pub queued: u64,
    pub denied: u64,
    pub cancelled: u64,
    pub released: u64,
    pub forced_releases: u64,
    pub deadlocks_resolved: u64,
    pub total_wait_ms: u64,
    pub held_locks: usize,
    pub waiting_requests: usize,
    pub busy_agents: usize,
}

impl CoordinatorMetrics {
    /// Share of requests granted without waiting.
    pub fn efficiency(&self) -> f64 {
        if self.requests == 0 {
            return 1.0;
        }
        self.granted_immediately as f64 / self.requests as f64
    }

    /// Mean queueing time of requests that had to wait.
    pub fn average_wait(&self) -> Duration {
        match self.total_wait_ms.checked_div(self.granted_after_wait) {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::ZERO,
        }
    }
}

struct Pending {
    id: RequestId,
    /// Queue position; lower is earlier. Renewed when a request is moved to
    /// the tail.
    seq: u64,
    request: ExecutionRequest,
    enqueued_at: Instant,
    notify: Option<oneshot::Sender<Result<Grant>>>,
}

enum Admission {
    Grant,
    Queue,
    Deny(DenialReason),
}

#[derive(Default)]
struct LockTable {
    locks: BTreeMap<ResourceId, ResourceLock>,
    queues: BTreeMap<ResourceId, VecDeque<RequestId>>,
    pending: BTreeMap<RequestId, Pending>,
    next_id: u64,
    next_seq: u64,
    metrics: CoordinatorMetrics,
}

impl LockTable {
    fn next_request_id(&mut self) -> RequestId {
        self.next_id += 1;
        RequestId(self.next_id)
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn admit(
        &self,
        request: &ExecutionRequest,
        now: DateTime<Utc>,
        stale_after: Option<Duration>,
    ) -> Admission {
        for resource in &request.resources {
            if let Some(lock) = self.locks.get(resource) {
                if lock.holder == request.agent_id {
                    return Admission::Deny(DenialReason::AlreadyHeld {
                        resource: resource.clone(),
                    });
                }
            }
        }

        let duplicate = self.pending.values().any(|p| {
            p.request.agent_id == request.agent_id && p.request.task_id == request.task_id
        });
        if duplicate {
            return Admission::Deny(DenialReason::DuplicateRequest {
                task_id: request.task_id.clone(),
            });
        }

        let free = request.resources.iter().all(|resource| {
            !self.locks.contains_key(resource)
                && self.queues.get(resource).map_or(true, VecDeque::is_empty)
        });
        if free {
            return Admission::Grant;
        }

        if let Some(stale_after) = stale_after {
            for resource in &request.resources {
                if let Some(lock) = self.locks.get(resource) {
                    let held_for = lock.held_for(now);
                    if held_for > stale_after {
                        return Admission::Deny(DenialReason::StaleLock {
                            resource: resource.clone(),
                            holder: lock.holder.clone(),
                            held_for_ms: millis(held_for),
                        });
                    }
                }
            }
        }

        Admission::Queue
    }

    fn grant(
        &mut self,
        request_id: RequestId,
        request: ExecutionRequest,
        waited: Duration,
        now: DateTime<Utc>,
    ) -> Grant {
        for resource in &request.resources {
            self.locks.insert(
                resource.clone(),
                ResourceLock {
                    resource: resource.clone(),
                    holder: request.agent_id.clone(),
                    task_id: request.task_id.clone(),
                    priority: request.priority,
                    acquired_at: now,
                },
            );
        }
        Grant {
            request_id,
            agent_id: request.agent_id,
            task_id: request.task_id,
            resources: request.resources.into_iter().collect(),
            waited,
        }
    }

    fn enqueue(
        &mut self,
        id: RequestId,
        request: ExecutionRequest,
        notify: Option<oneshot::Sender<Result<Grant>>>,
    ) {
        for resource in &request.resources {
            self.queues.entry(resource.clone()).or_default().push_back(id);
        }
        let seq = self.next_seq();
        self.pending.insert(
            id,
            Pending {
                id,
                seq,
                request,
                enqueued_at: Instant::now(),
                notify,
            },
        );
    }

    fn dequeue(&mut self, id: RequestId) -> Option<Pending> {
        let pending = self.pending.remove(&id)?;
        for resource in &pending.request.resources {
            if let Some(queue) = self.queues.get_mut(resource) {
                queue.retain(|queued| *queued != id);
                if queue.is_empty() {
                    self.queues.remove(resource);
                }
            }
        }
        Some(pending)
    }

    fn withdraw_where(&mut self, mut predicate: impl FnMut(&ExecutionRequest) -> bool) -> Vec<Pending> {
        let ids: Vec<RequestId> = self
            .pending
            .values()
            .filter(|p| predicate(&p.request))
            .map(|p| p.id)
            .collect();
        ids.into_iter().filter_map(|id| self.dequeue(id)).collect()
    }

    fn release_where(&mut self, mut predicate: impl FnMut(&ResourceLock) -> bool) -> Vec<ResourceLock> {
        let resources: Vec<ResourceId> = self
            .locks
            .values()
            .filter(|lock| predicate(lock))
            .map(|lock| lock.resource.clone())
            .collect();
        resources
            .iter()
            .filter_map(|resource| self.locks.remove(resource))
            .collect()
    }

    /// Move an agent's pending requests behind everything currently queued.
    fn requeue_agent(&mut self, agent: &AgentId) {
        let mut mine: Vec<(u64, RequestId)> = self
            .pending
            .values()
            .filter(|p| &p.request.agent_id == agent)
            .map(|p| (p.seq, p.id))
            .collect();
        mine.sort();
        for (_, id) in mine {
            if let Some(mut pending) = self.dequeue(id) {
                for resource in &pending.request.resources {
                    self.queues.entry(resource.clone()).or_default().push_back(id);
                }
                pending.seq = self.next_seq();
                self.pending.insert(id, pending);
            }
        }
    }

    /// Grant every queued request that is now at the head of all its queues
    /// and whose resources are all free. One pass in queue order suffices:
    /// a grant only adds locks and only unblocks later requests.
    fn promote(&mut self, now: DateTime<Utc>) -> Vec<(Grant, Option<oneshot::Sender<Result<Grant>>>)> {
        let mut order: Vec<(u64, RequestId)> =
            self.pending.values().map(|p| (p.seq, p.id)).collect();
        order.sort();

        let mut granted = Vec::new();
        for (_, id) in order {
            let ready = match self.pending.get(&id) {
                Some(pending) => pending.request.resources.iter().all(|resource| {
                    !self.locks.contains_key(resource)
                        && self
                            .queues
                            .get(resource)
                            .and_then(VecDeque::front)
                            .map_or(true, |head| *head == id)
                }),
                None => false,
            };
            if !ready {
                continue;
            }
            if let Some(pending) = self.dequeue(id) {
                let waited = pending.enqueued_at.elapsed();
                let grant = self.grant(id, pending.request, waited, now);
                granted.push((grant, pending.notify));
            }
        }
        granted
    }

    fn wait_for_graph(&self) -> WaitForGraph {
        let mut graph = WaitForGraph::new();
        for pending in self.pending.values() {
            let waiter = &pending.request.agent_id;
            for resource in &pending.request.resources {
                if let Some(lock) = self.locks.get(resource) {
                    graph.add_wait(waiter, &lock.holder);
                }
                if let Some(queue) = self.queues.get(resource) {
                    for ahead in queue.iter().take_while(|queued| **queued != pending.id) {
                        if let Some(other) = self.pending.get(ahead) {
                            graph.add_wait(waiter, &other.request.agent_id);
                        }
                    }
                }
            }
        }
        graph
    }

    fn victim_candidate(&self, agent: &AgentId) -> VictimCandidate {
        let held = self.locks.values().filter(|lock| &lock.holder == agent);
        let oldest_lock = held.clone().map(|lock| lock.acquired_at).min();
        let priority = held
            .map(|lock| lock.priority)
            .chain(
                self.pending
                    .values()
                    .filter(|p| &p.request.agent_id == agent)
                    .map(|p| p.request.priority),
            )
            .max()
            .unwrap_or_default();
        VictimCandidate {
            agent: agent.clone(),
            priority,
            oldest_lock,
        }
    }

    fn snapshot_metrics(&self) -> CoordinatorMetrics {
        let busy: BTreeSet<&AgentId> = self.locks.values().map(|lock| &lock.holder).collect();
        CoordinatorMetrics {
            held_locks: self.locks.len(),
            waiting_requests: self.pending.len(),
            busy_agents: busy.len(),
            ..self.metrics.clone()
        }
    }
}

pub struct CollaborationCoordinator {
    table: Mutex<LockTable>,
    config: CoordinatorConfig,
    events: EventSink,
}

impl CollaborationCoordinator {
    pub fn new(config: CoordinatorConfig, events: EventSink) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            config,
            events,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Ask for every resource of a task at once.
    pub async fn request_execution(&self, request: ExecutionRequest) -> Result<ExecutionDecision> {
        if request.agent_id.is_blank() {
            return Err(Error::Validation("agent id must not be empty".into()));
        }
        if request.task_id.is_blank() {
            return Err(Error::Validation("task id must not be empty".into()));
        }

        let mut table = self.table.lock().await;
        table.metrics.requests += 1;
        let now = Utc::now();

        match table.admit(&request, now, self.config.lock_stale_after) {
            Admission::Grant => {
                let id = table.next_request_id();
                let grant = table.grant(id, request, Duration::ZERO, now);
                table.metrics.granted_immediately += 1;
                debug!(agent = %grant.agent_id, task = %grant.task_id, resources = grant.resources.len(), "execution granted");
                self.events.task(
                    &grant.task_id,
                    EventKind::LockGranted {
                        agent: grant.agent_id.clone(),
                        task: grant.task_id.clone(),
                        resources: grant.resources.clone(),
                        waited_ms: 0,
                    },
                );
                Ok(ExecutionDecision::Granted(grant))
            }
            Admission::Deny(reason) => {
                table.metrics.denied += 1;
                info!(agent = %request.agent_id, task = %request.task_id, %reason, "execution denied");
                self.events.task(
                    &request.task_id,
                    EventKind::LockDenied {
                        agent: request.agent_id.clone(),
                        task: request.task_id.clone(),
                        reason: reason.clone(),
                    },
                );
                Ok(ExecutionDecision::Denied(reason))
            }
            Admission::Queue => {
                let id = table.next_request_id();
                let (tx, rx) = oneshot::channel();
                let ticket = RequestTicket {
                    request_id: id,
                    agent_id: request.agent_id.clone(),
                    task_id: request.task_id.clone(),
                    rx,
                };
                self.events.task(
                    &request.task_id,
                    EventKind::LockQueued {
                        agent: request.agent_id.clone(),
                        task: request.task_id.clone(),
                        request_id: id,
                        resources: request.resources.iter().cloned().collect(),
                    },
                );
                debug!(agent = %request.agent_id, task = %request.task_id, request = %id, "execution queued");
                table.enqueue(id, request, Some(tx));
                table.metrics.queued += 1;
                Ok(ExecutionDecision::Queued(ticket))
            }
        }
    }

    /// Wait for a queued request. On timeout the request is withdrawn, unless
    /// it was granted in the meantime, in which case the grant is returned.
    pub async fn wait_for(&self, ticket: RequestTicket, timeout: Option<Duration>) -> Result<Grant> {
        let Some(limit) = timeout else {
            return ticket.granted().await;
        };
        let RequestTicket {
            request_id, mut rx, ..
        } = ticket;
        match tokio::time::timeout(limit, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::RequestCancelled(request_id)),
            Err(_) => {
                if self.cancel(request_id).await {
                    Err(Error::Timeout(limit))
                } else {
                    match rx.try_recv() {
                        Ok(outcome) => outcome,
                        Err(_) => Err(Error::Timeout(limit)),
                    }
                }
            }
        }
    }

    /// Withdraw a queued request. Returns false if it is no longer pending.
    pub async fn cancel(&self, request_id: RequestId) -> bool {
        let mut table = self.table.lock().await;
        let Some(pending) = table.dequeue(request_id) else {
            return false;
        };
        table.metrics.cancelled += 1;
        debug!(request = %request_id, agent = %pending.request.agent_id, "request cancelled");
        self.events.agent(
            &pending.request.agent_id,
            EventKind::RequestCancelled {
                agent: pending.request.agent_id.clone(),
                request_id,
            },
        );
        if let Some(notify) = pending.notify {
            let _ = notify.send(Err(Error::RequestCancelled(request_id)));
        }
        self.promote(&mut table);
        true
    }

    /// Release locks after a task finished (or failed).
    ///
    /// Every listed resource must be held by `agent` for `task`, otherwise
    /// nothing is released and [`Error::NotLockHolder`] is returned. An
    /// empty list releases all locks of the task and withdraws its queued
    /// requests. Returns the grants this release unblocked.
    pub async fn notify_completion(
        &self,
        agent: &AgentId,
        task: &TaskId,
        resources: &[ResourceId],
    ) -> Result<Vec<Grant>> {
        let mut table = self.table.lock().await;

        for resource in resources {
            match table.locks.get(resource) {
                Some(lock) if &lock.holder == agent && &lock.task_id == task => {}
                _ => {
                    return Err(Error::NotLockHolder {
                        agent: agent.clone(),
                        resource: resource.clone(),
                    })
                }
            }
        }

        let released = if resources.is_empty() {
            let withdrawn =
                table.withdraw_where(|r| &r.agent_id == agent && &r.task_id == task);
            for pending in withdrawn {
                table.metrics.cancelled += 1;
                if let Some(notify) = pending.notify {
                    let _ = notify.send(Err(Error::RequestCancelled(pending.id)));
                }
            }
            table.release_where(|lock| &lock.holder == agent && &lock.task_id == task)
        } else {
            let wanted: BTreeSet<&ResourceId> = resources.iter().collect();
            table.release_where(|lock| wanted.contains(&lock.resource))
        };

        table.metrics.released += released.len() as u64;
        if !released.is_empty() {
            debug!(%agent, %task, count = released.len(), "locks released");
            self.events.task(
                task,
                EventKind::LockReleased {
                    agent: agent.clone(),
                    task: task.clone(),
                    resources: released.iter().map(|lock| lock.resource.clone()).collect(),
                },
            );
        }
        Ok(self.promote(&mut table))
    }

    /// Force-release everything an agent holds and withdraw its queued
    /// requests.
    pub async fn release_agent(&self, agent: &AgentId, cause: ReleaseCause) -> Vec<ResourceLock> {
        let mut table = self.table.lock().await;
        for pending in table.withdraw_where(|r| &r.agent_id == agent) {
            table.metrics.cancelled += 1;
            if let Some(notify) = pending.notify {
                let _ = notify.send(Err(Error::RequestCancelled(pending.id)));
            }
        }
        let released = table.release_where(|lock| &lock.holder == agent);
        if !released.is_empty() {
            table.metrics.forced_releases += released.len() as u64;
            warn!(%agent, %cause, count = released.len(), "locks force-released");
            self.events.agent(
                agent,
                EventKind::LockForceReleased {
                    agent: agent.clone(),
                    resources: released.iter().map(|lock| lock.resource.clone()).collect(),
                    cause,
                },
            );
        }
        self.promote(&mut table);
        released
    }

    /// Release locks held longer than the configured lock timeout.
    pub async fn expire_locks(&self) -> Vec<ResourceLock> {
        let Some(limit) = self.config.lock_timeout else {
            return Vec::new();
        };
        let mut table = self.table.lock().await;
        let now = Utc::now();
        let expired = table.release_where(|lock| lock.held_for(now) > limit);
        for lock in &expired {
            warn!(resource = %lock.resource, holder = %lock.holder, "lock expired");
            self.events.resource(
                &lock.resource,
                EventKind::LockForceReleased {
                    agent: lock.holder.clone(),
                    resources: vec![lock.resource.clone()],
                    cause: ReleaseCause::Timeout,
                },
            );
        }
        table.metrics.forced_releases += expired.len() as u64;
        if !expired.is_empty() {
            self.promote(&mut table);
        }
        expired
    }

    /// Agents that are part of a wait-for cycle, sorted.
    pub async fn detect_deadlock(&self) -> Vec<AgentId> {
        let table = self.table.lock().await;
        table.wait_for_graph().deadlocked_agents().into_iter().collect()
    }

    /// Break every wait-for cycle by sacrificing one victim per cycle.
    ///
    /// The victim loses all its locks; its queued requests move to the tail
    /// and its interrupted tasks are queued again behind everyone else.
    pub async fn resolve_deadlocks(&self) -> Result<Vec<DeadlockResolution>> {
        let mut table = self.table.lock().await;
        let mut resolutions = Vec::new();

        let agents: BTreeSet<AgentId> = table
            .pending
            .values()
            .map(|p| p.request.agent_id.clone())
            .chain(table.locks.values().map(|lock| lock.holder.clone()))
            .collect();

        for _ in 0..=agents.len() {
            let Some(cycle) = table.wait_for_graph().cycles().into_iter().next() else {
                return Ok(resolutions);
            };
            let candidates: Vec<VictimCandidate> = cycle
                .iter()
                .map(|agent| table.victim_candidate(agent))
                .collect();
            let Some(victim) = select_victim(&candidates).map(|c| c.agent.clone()) else {
                break;
            };
            warn!(cycle = ?cycle, %victim, "deadlock detected, preempting victim");

            let released = table.release_where(|lock| lock.holder == victim);
            table.requeue_agent(&victim);

            let mut by_task: BTreeMap<TaskId, (Priority, Vec<ResourceId>)> = BTreeMap::new();
            for lock in &released {
                let entry = by_task
                    .entry(lock.task_id.clone())
                    .or_insert((lock.priority, Vec::new()));
                entry.1.push(lock.resource.clone());
            }
            let mut requeued = Vec::new();
            for (task_id, (priority, resources)) in by_task {
                let request =
                    ExecutionRequest::new(victim.clone(), task_id.clone(), resources).with_priority(priority);
                let id = table.next_request_id();
                let (tx, rx) = oneshot::channel();
                table.enqueue(id, request, Some(tx));
                requeued.push(RequestTicket {
                    request_id: id,
                    agent_id: victim.clone(),
                    task_id,
                    rx,
                });
            }

            table.metrics.deadlocks_resolved += 1;
            table.metrics.forced_releases += released.len() as u64;
            self.events.system(EventKind::DeadlockDetected {
                agents: cycle.clone(),
                victim: victim.clone(),
            });
            if !released.is_empty() {
                self.events.agent(
                    &victim,
                    EventKind::LockForceReleased {
                        agent: victim.clone(),
                        resources: released.iter().map(|lock| lock.resource.clone()).collect(),
                        cause: ReleaseCause::Deadlock,
                    },
                );
            }
            self.promote(&mut table);

            resolutions.push(DeadlockResolution {
                cycle,
                victim,
                released,
                requeued,
            });
        }

        let stuck: Vec<AgentId> = table.wait_for_graph().deadlocked_agents().into_iter().collect();
        if stuck.is_empty() {
            return Ok(resolutions);
        }
        self.events.system(EventKind::DeadlockUnresolved {
            agents: stuck.clone(),
        });
        Err(Error::DeadlockDetected { agents: stuck })
    }

    pub async fn locks(&self) -> Vec<ResourceLock> {
        self.table.lock().await.locks.values().cloned().collect()
    }

    pub async fn holder_of(&self, resource: &ResourceId) -> Option<ResourceLock> {
        self.table.lock().await.locks.get(resource).cloned()
    }

    pub async fn held_by(&self, agent: &AgentId) -> Vec<ResourceLock> {
        self.table
            .lock()
            .await
            .locks
            .values()
            .filter(|lock| &lock.holder == agent)
            .cloned()
            .collect()
    }

    /// Queued requests in grant order.
    pub async fn pending_requests(&self) -> Vec<PendingRequest> {
        let table = self.table.lock().await;
        let mut pending: Vec<&Pending> = table.pending.values().collect();
        pending.sort_by_key(|p| p.seq);
        pending
            .into_iter()
            .map(|p| PendingRequest {
                request_id: p.id,
                agent_id: p.request.agent_id.clone(),
                task_id: p.request.task_id.clone(),
                resources: p.request.resources.iter().cloned().collect(),
                priority: p.request.priority,
            })
            .collect()
    }

    pub async fn queue_depths(&self) -> BTreeMap<ResourceId, usize> {
        let table = self.table.lock().await;
        table
            .queues
            .iter()
            .map(|(resource, queue)| (resource.clone(), queue.len()))
            .collect()
    }

    pub async fn metrics(&self) -> CoordinatorMetrics {
        self.table.lock().await.snapshot_metrics()
    }

    /// Reinstate locks from a snapshot. Queued requests are not part of a
    /// snapshot; any that exist are withdrawn.
    pub async fn restore_locks(&self, locks: Vec<ResourceLock>) -> Result<()> {
        let mut seen = BTreeSet::new();
        for lock in &locks {
            if !seen.insert(&lock.resource) {
                return Err(Error::Validation(format!(
                    "resource {} appears in more than one lock",
                    lock.resource
                )));
            }
        }
        let mut table = self.table.lock().await;
        for pending in table.withdraw_where(|_| true) {
            if let Some(notify) = pending.notify {
                let _ = notify.send(Err(Error::RequestCancelled(pending.id)));
            }
        }
        table.locks = locks
            .into_iter()
            .map(|lock| (lock.resource.clone(), lock))
            .collect();
        debug!(locks = table.locks.len(), "locks restored");
        Ok(())
    }

    fn promote(&self, table: &mut LockTable) -> Vec<Grant> {
        let mut grants = Vec::new();
        for (grant, notify) in table.promote(Utc::now()) {
            table.metrics.granted_after_wait += 1;
            table.metrics.total_wait_ms += millis(grant.waited);
            debug!(agent = %grant.agent_id, task = %grant.task_id, request = %grant.request_id, "queued request granted");
            self.events.task(
                &grant.task_id,
                EventKind::LockGranted {
                    agent: grant.agent_id.clone(),
                    task: grant.task_id.clone(),
                    resources: grant.resources.clone(),
                    waited_ms: millis(grant.waited),
                },
            );
            if let Some(notify) = notify {
                if notify.send(Ok(grant.clone())).is_err() {
                    debug!(request = %grant.request_id, "ticket dropped before grant; locks stay with the agent");
                }
            }
            grants.push(grant);
        }
        grants
    }
}

impl LockReleaser for CollaborationCoordinator {
    fn release_agent<'a>(
        &'a self,
        agent: &'a AgentId,
        cause: ReleaseCause,
    ) -> BoxFuture<'a, Vec<ResourceLock>> {
        Box::pin(CollaborationCoordinator::release_agent(self, agent, cause))
    }
}
