//! Core domain models: tasks and the dependency graph.

pub mod critical_path;
pub mod cycles;
pub mod dag;
pub mod plan;
pub mod task;

pub use critical_path::{ScheduleAnalysis, TaskTiming};
pub use dag::{DependencyEdge, DependencyKind, StatusCounts, TaskDAG};
pub use plan::{PlannedTask, TaskPlan};
pub use task::{Priority, ResourceId, Task, TaskId, TaskStatus};
