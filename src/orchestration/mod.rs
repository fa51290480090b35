//! Orchestration layer: resource locking between workers, worker process
//! supervision, and the engine that ties them to the task graph.

pub mod agent_state;
pub mod coordinator;
pub mod deadlock;
pub mod engine;
pub mod health;
pub mod restart;
pub mod supervisor;

pub use agent_state::{AgentState, AgentStateManager, AgentStatus};
pub use coordinator::{
    CollaborationCoordinator, CoordinatorConfig, CoordinatorMetrics, DeadlockResolution,
    DenialReason, ExecutionDecision, ExecutionRequest, Grant, ReleaseCause, RequestId,
    RequestTicket, ResourceLock,
};
pub use engine::{Assignment, DispatchOutcome, MaintenanceReport, Orchestrator, Snapshot};
pub use health::{HealthConfig, HealthMonitor, HealthVerdict, ResourceLimits, UnhealthyReason};
pub use restart::{RestartDecision, RestartPolicy};
pub use supervisor::{
    LockReleaser, SupervisionReport, Supervisor, WorkerProcess, WorkerSpec, WorkerStatus,
};
