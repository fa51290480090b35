//! Outbound event stream.
//!
//! Every component reports state changes through an [`EventSink`]. The sink
//! is a bounded crossbeam channel written with `try_send`: when the consumer
//! falls behind, events are counted as dropped and the engine carries on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::agent::AgentId;
use crate::core::task::{ResourceId, TaskId};
use crate::error::ErrorKind;
use crate::orchestration::coordinator::{DenialReason, ReleaseCause, RequestId};

/// What an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum EventSubject {
    Task(TaskId),
    Agent(AgentId),
    Resource(ResourceId),
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EventKind {
    TaskAdded {
        title: String,
    },
    DependencyAdded {
        from: TaskId,
        to: TaskId,
    },
    DependencyRemoved {
        from: TaskId,
        to: TaskId,
    },
    CycleDetected {
        cycle: Vec<TaskId>,
    },
    TaskExecutable,
    TaskStarted {
        agent: AgentId,
    },
    TaskCompleted {
        agent: Option<AgentId>,
        unblocked: Vec<TaskId>,
    },
    TaskFailed {
        agent: Option<AgentId>,
        error: String,
    },
    TaskRetried,
    TaskPurged,
    LockGranted {
        agent: AgentId,
        task: TaskId,
        resources: Vec<ResourceId>,
        waited_ms: u64,
    },
    LockQueued {
        agent: AgentId,
        task: TaskId,
        request_id: RequestId,
        resources: Vec<ResourceId>,
    },
    LockDenied {
        agent: AgentId,
        task: TaskId,
        reason: DenialReason,
    },
    LockReleased {
        agent: AgentId,
        task: TaskId,
        resources: Vec<ResourceId>,
    },
    LockForceReleased {
        agent: AgentId,
        resources: Vec<ResourceId>,
        cause: ReleaseCause,
    },
    RequestCancelled {
        agent: AgentId,
        request_id: RequestId,
    },
    DeadlockDetected {
        agents: Vec<AgentId>,
        victim: AgentId,
    },
    DeadlockUnresolved {
        agents: Vec<AgentId>,
    },
    WorkerStarted {
        pid: Option<u32>,
    },
    WorkerHealthy,
    WorkerUnhealthy {
        reason: String,
    },
    WorkerRestarting {
        attempt: u32,
        delay_ms: u64,
    },
    WorkerCrashed {
        restarts: u32,
        reason: String,
    },
    WorkerStopped,
    HeartbeatStale {
        silent_for_ms: u64,
    },
    AgentStatusChanged {
        status: String,
    },
    WorkerConnected,
    WorkerDisconnected,
    Failure {
        error_kind: ErrorKind,
        message: String,
    },
}

impl EventKind {
    /// Structural failures the engine cannot recover from by itself.
    pub fn is_fatal(&self) -> bool {
        match self {
            EventKind::WorkerCrashed { .. } | EventKind::DeadlockUnresolved { .. } => true,
            EventKind::Failure { error_kind, .. } => error_kind.is_fatal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub subject: EventSubject,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(subject: EventSubject, kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            subject,
            kind,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

/// Producer side of the event stream. Cheap to clone.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<Sender<Event>>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Bounded stream with room for `capacity` undelivered events.
    pub fn channel(capacity: usize) -> (Self, EventStream) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            EventStream { rx },
        )
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish without ever blocking the caller.
    pub fn emit(&self, subject: EventSubject, kind: EventKind) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(Event::new(subject, kind)) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(kind = ?event.kind, "event stream full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn task(&self, task: &TaskId, kind: EventKind) {
        self.emit(EventSubject::Task(task.clone()), kind);
    }

    pub fn agent(&self, agent: &AgentId, kind: EventKind) {
        self.emit(EventSubject::Agent(agent.clone()), kind);
    }

    pub fn resource(&self, resource: &ResourceId, kind: EventKind) {
        self.emit(EventSubject::Resource(resource.clone()), kind);
    }

    pub fn system(&self, kind: EventKind) {
        self.emit(EventSubject::System, kind);
    }

    /// Events lost because the consumer was full or gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("enabled", &self.tx.is_some())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Consumer side of the event stream.
pub struct EventStream {
    rx: Receiver<Event>,
}

impl EventStream {
    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout`; `None` on timeout or when every sink is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything currently buffered.
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }

    /// Blocking iterator that ends when every sink has been dropped.
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.rx.iter()
    }
}
