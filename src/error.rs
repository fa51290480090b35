use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentId;
use crate::core::task::{ResourceId, TaskId};
use crate::orchestration::coordinator::{DenialReason, RequestId};
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Cyclic dependency: {}", join(cycle, " -> "))]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    TaskExists(TaskId),

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Resource {resource} unavailable: {reason}")]
    ResourceUnavailable {
        resource: ResourceId,
        reason: DenialReason,
    },

    #[error("Agent {agent} does not hold the lock on {resource}")]
    NotLockHolder { agent: AgentId, resource: ResourceId },

    #[error("Execution request {0} was cancelled")]
    RequestCancelled(RequestId),

    #[error("Deadlock detected among agents: {}", join(agents, ", "))]
    DeadlockDetected { agents: Vec<AgentId> },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to start worker {agent}: {reason}")]
    ProcessCreationFailed { agent: AgentId, reason: String },

    #[error("Health check for worker {agent} timed out after {timeout:?}")]
    HealthCheckTimeout { agent: AgentId, timeout: Duration },

    #[error("Worker {agent} exceeded {restarts} restarts within {window:?}")]
    RestartLimitExceeded {
        agent: AgentId,
        restarts: u32,
        window: Duration,
    },

    #[error("Agent pool is full (max: {max})")]
    AgentPoolFull { max: usize },

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Agent already registered: {0}")]
    AgentExists(AgentId),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable failure category carried by wire error messages and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CyclicDependency,
    ResourceUnavailable,
    DeadlockDetected,
    TaskNotFound,
    TransportError,
    ProcessCreationFailed,
    HealthCheckTimeout,
    RestartLimitExceeded,
    AgentNotFound,
    Cancelled,
    Conflict,
    Validation,
    Timeout,
    Io,
    Serialization,
    Internal,
}

impl ErrorKind {
    /// Structural failures that the engine cannot recover from on its own.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::DeadlockDetected | ErrorKind::RestartLimitExceeded
        )
    }

    /// Failures worth retrying with bounded backoff.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::ResourceUnavailable
                | ErrorKind::TransportError
                | ErrorKind::HealthCheckTimeout
                | ErrorKind::Timeout
                | ErrorKind::Io
        )
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::CyclicDependency => "cyclic_dependency",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::DeadlockDetected => "deadlock_detected",
            ErrorKind::TaskNotFound => "task_not_found",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::ProcessCreationFailed => "process_creation_failed",
            ErrorKind::HealthCheckTimeout => "health_check_timeout",
            ErrorKind::RestartLimitExceeded => "restart_limit_exceeded",
            ErrorKind::AgentNotFound => "agent_not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) | Error::TomlParse(_) | Error::TomlSerialize(_) => {
                ErrorKind::Serialization
            }
            Error::NoHomeDir | Error::Validation(_) | Error::InvalidTransition { .. } => {
                ErrorKind::Validation
            }
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::TaskJoin(_) => ErrorKind::Internal,
            Error::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            Error::TaskNotFound(_) => ErrorKind::TaskNotFound,
            Error::TaskExists(_)
            | Error::AgentExists(_)
            | Error::AgentPoolFull { .. }
            | Error::NotLockHolder { .. } => ErrorKind::Conflict,
            Error::ResourceUnavailable { .. } => ErrorKind::ResourceUnavailable,
            Error::RequestCancelled(_) => ErrorKind::Cancelled,
            Error::DeadlockDetected { .. } => ErrorKind::DeadlockDetected,
            Error::Transport(_) => ErrorKind::TransportError,
            Error::ProcessCreationFailed { .. } => ErrorKind::ProcessCreationFailed,
            Error::HealthCheckTimeout { .. } => ErrorKind::HealthCheckTimeout,
            Error::RestartLimitExceeded { .. } => ErrorKind::RestartLimitExceeded,
            Error::AgentNotFound(_) => ErrorKind::AgentNotFound,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

fn join<T: Display>(items: &[T], separator: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(separator)
}
