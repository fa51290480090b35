//! Task data model for the dependency graph.
//!
//! Tasks are the units of work handed to workers. Each task tracks its
//! lifecycle status, the named resources it needs exclusive access to,
//! and the scheduling hints (estimate, priority) used by dispatch and
//! critical-path analysis.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentId;
use crate::util::duration_ms;

string_id!(
    /// Unique identifier for a task within the graph.
    TaskId
);

string_id!(
    /// Name of a lockable resource (a file path, a module, a service).
    ResourceId
);

/// Scheduling priority. Higher values dispatch first and are the last to be
/// chosen as deadlock victims.
pub type Priority = i32;

/// Task status in its lifecycle.
///
/// `Executable` is kept in sync by the graph: a task that has not started is
/// `Executable` exactly when every dependency is `Completed`, and `Pending`
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting on at least one dependency.
    #[default]
    Pending,
    /// All dependencies completed, ready to be dispatched.
    Executable,
    /// Currently executed by a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error; stays failed until explicitly retried.
    Failed { error: String },
}

impl TaskStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Executable => "executable",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
        }
    }

    /// True for `Pending` and `Executable`: the task has not started.
    pub fn is_waiting(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Executable)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            other => f.write_str(other.name()),
        }
    }
}

/// A single task in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Resources locked for the whole run of the task.
    #[serde(default)]
    pub required_resources: BTreeSet<ResourceId>,
    /// Estimate used for critical-path analysis.
    #[serde(default, rename = "estimated_duration_ms", with = "duration_ms")]
    pub estimated_duration: Duration,
    #[serde(default)]
    pub priority: Priority,
    /// Worker currently (or last) executing the task.
    pub agent_id: Option<AgentId>,
    /// Number of times the task has been started.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(id: impl Into<TaskId>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: String::new(),
            status: TaskStatus::Pending,
            required_resources: BTreeSet::new(),
            estimated_duration: Duration::ZERO,
            priority: 0,
            agent_id: None,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_resources<I, R>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ResourceId>,
    {
        self.required_resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimated_duration = estimate;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn has_started(&self) -> bool {
        !self.status.is_waiting()
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub(crate) fn mark_executable(&mut self) {
        self.status = TaskStatus::Executable;
    }

    pub(crate) fn mark_pending(&mut self) {
        self.status = TaskStatus::Pending;
    }

    /// Executable -> Running.
    pub(crate) fn start(&mut self, agent: AgentId) {
        self.status = TaskStatus::Running;
        self.agent_id = Some(agent);
        self.attempts += 1;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
    }

    pub(crate) fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed {
            error: error.into(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Back to not-started so the graph can re-evaluate it.
    pub(crate) fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.agent_id = None;
        self.started_at = None;
        self.completed_at = None;
    }

    /// Wall-clock time between start and completion.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_ordering_is_lexicographic() {
        let mut ids = vec![TaskId::new("c"), TaskId::new("a"), TaskId::new("b")];
        ids.sort();
        assert_eq!(ids, vec![TaskId::new("a"), TaskId::new("b"), TaskId::new("c")]);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
        assert_eq!(TaskId::generate().short().len(), 8);
        assert_eq!(TaskId::new("abc").short(), "abc");
    }

    #[test]
    fn test_blank_ids() {
        assert!(TaskId::new("  ").is_blank());
        assert!(!ResourceId::new("src/lib.rs").is_blank());
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new("t1", "Write parser")
            .with_description("tokenizer and AST")
            .with_resources(["src/parser.rs", "src/ast.rs"])
            .with_estimate(Duration::from_secs(30))
            .with_priority(5);

        assert_eq!(task.id.as_str(), "t1");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.required_resources.len(), 2);
        assert!(task.required_resources.contains(&ResourceId::new("src/ast.rs")));
        assert_eq!(task.priority, 5);
        assert!(!task.has_started());
    }

    #[test]
    fn test_lifecycle() {
        let mut task = Task::new("t1", "Lifecycle");
        task.mark_executable();
        task.start(AgentId::new("w1"));
        assert!(task.is_running());
        assert_eq!(task.attempts, 1);
        assert_eq!(task.agent_id, Some(AgentId::new("w1")));

        task.fail("compile error");
        assert_eq!(task.status.to_string(), "failed: compile error");
        assert!(task.status.is_finished());

        task.reset();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.agent_id.is_none());

        task.mark_executable();
        task.start(AgentId::new("w2"));
        task.complete();
        assert!(task.is_completed());
        assert_eq!(task.attempts, 2);
        assert!(task.duration().is_some());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::Failed {
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"failed","error":"boom"}"#);

        let parsed: TaskStatus = serde_json::from_str(r#"{"state":"executable"}"#).unwrap();
        assert_eq!(parsed, TaskStatus::Executable);
    }

    #[test]
    fn test_task_json_uses_millisecond_estimate() {
        let task = Task::new("t1", "Estimate").with_estimate(Duration::from_millis(1500));
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["estimated_duration_ms"], 1500);
        let back: Task = serde_json::from_value(value).unwrap();
        assert_eq!(back.estimated_duration, Duration::from_millis(1500));
    }
}
