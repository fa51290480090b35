//! Protocol messages exchanged between the orchestrator and workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::core::task::{ResourceId, TaskId};
use crate::error::{Error, ErrorKind};
use crate::orchestration::coordinator::{DenialReason, ReleaseCause, RequestId};

/// Newest envelope schema this build understands.
pub const PROTOCOL_VERSION: u16 = 1;

/// Versioned wrapper around every message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub id: Uuid,
    pub sent_at: DateTime<Utc>,
    pub message: Message,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: Uuid::new_v4(),
            sent_at: Utc::now(),
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Message {
    /// Worker handshake; must be the first message on a connection.
    CreateSession {
        agent_id: AgentId,
        #[serde(default)]
        pid: Option<u32>,
    },
    SessionAccepted {
        agent_id: AgentId,
    },
    /// Free-form input forwarded to a worker's prompt.
    SendInput {
        agent_id: AgentId,
        input: String,
    },
    Heartbeat {
        agent_id: AgentId,
        #[serde(default)]
        current_task: Option<TaskId>,
    },
    AssignTask {
        task_id: TaskId,
        title: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        resources: Vec<ResourceId>,
    },
    RequestExecution {
        agent_id: AgentId,
        task_id: TaskId,
        #[serde(default)]
        resources: Vec<ResourceId>,
    },
    ExecutionGranted {
        task_id: TaskId,
        resources: Vec<ResourceId>,
    },
    ExecutionQueued {
        task_id: TaskId,
        request_id: RequestId,
    },
    ExecutionDenied {
        task_id: TaskId,
        reason: DenialReason,
    },
    /// Withdraw a queued `RequestExecution` before it is granted.
    CancelRequest {
        agent_id: AgentId,
        request_id: RequestId,
    },
    RequestCancelled {
        request_id: RequestId,
    },
    TaskCompleted {
        agent_id: AgentId,
        task_id: TaskId,
    },
    TaskFailed {
        agent_id: AgentId,
        task_id: TaskId,
        error: String,
    },
    /// The orchestrator took the worker's locks away; it must stop touching
    /// these resources until they are granted again.
    ForceRelease {
        agent_id: AgentId,
        resources: Vec<ResourceId>,
        cause: ReleaseCause,
    },
    DeadlockDetected {
        agents: Vec<AgentId>,
        victim: AgentId,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Shutdown,
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::CreateSession { .. } => "create_session",
            Message::SessionAccepted { .. } => "session_accepted",
            Message::SendInput { .. } => "send_input",
            Message::Heartbeat { .. } => "heartbeat",
            Message::AssignTask { .. } => "assign_task",
            Message::RequestExecution { .. } => "request_execution",
            Message::ExecutionGranted { .. } => "execution_granted",
            Message::ExecutionQueued { .. } => "execution_queued",
            Message::ExecutionDenied { .. } => "execution_denied",
            Message::CancelRequest { .. } => "cancel_request",
            Message::RequestCancelled { .. } => "request_cancelled",
            Message::TaskCompleted { .. } => "task_completed",
            Message::TaskFailed { .. } => "task_failed",
            Message::ForceRelease { .. } => "force_release",
            Message::DeadlockDetected { .. } => "deadlock_detected",
            Message::Error { .. } => "error",
            Message::Shutdown => "shutdown",
        }
    }

    /// The agent a worker-originated message claims to come from.
    pub fn sender(&self) -> Option<&AgentId> {
        match self {
            Message::CreateSession { agent_id, .. }
            | Message::Heartbeat { agent_id, .. }
            | Message::RequestExecution { agent_id, .. }
            | Message::CancelRequest { agent_id, .. }
            | Message::TaskCompleted { agent_id, .. }
            | Message::TaskFailed { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }

    pub fn from_error(error: &Error) -> Self {
        Message::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}
