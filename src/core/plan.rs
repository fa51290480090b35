//! Task plans: a declarative list of tasks loaded from TOML or JSON.
//!
//! ```toml
//! [[tasks]]
//! id = "schema"
//! title = "Design the schema"
//! resources = ["db/schema.sql"]
//! estimate_secs = 600
//!
//! [[tasks]]
//! id = "api"
//! title = "Implement the API"
//! depends_on = ["schema"]
//! priority = 2
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::dag::{DependencyKind, TaskDAG};
use crate::core::task::{Priority, Task, TaskId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub estimate_secs: u64,
    #[serde(default)]
    pub priority: Priority,
}

impl PlannedTask {
    fn to_task(&self) -> Task {
        Task::new(self.id.as_str(), &self.title)
            .with_description(&self.description)
            .with_resources(self.resources.iter().map(String::as_str))
            .with_estimate(Duration::from_secs(self.estimate_secs))
            .with_priority(self.priority)
    }
}

impl TaskPlan {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Load a plan, choosing the format from the file extension
    /// (`.json`, anything else is read as TOML).
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading task plan");
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    /// Build a graph: every task first, then every dependency edge.
    ///
    /// Unknown `depends_on` references fail with [`Error::TaskNotFound`] and
    /// a dependency that would close a loop fails with
    /// [`Error::CyclicDependency`].
    pub fn into_dag(self) -> Result<TaskDAG> {
        let mut dag = TaskDAG::new();
        self.apply_to(&mut dag)?;
        Ok(dag)
    }

    /// Add the plan's tasks and edges to an existing graph.
    pub fn apply_to(&self, dag: &mut TaskDAG) -> Result<usize> {
        for planned in &self.tasks {
            if planned.title.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "task {} has an empty title",
                    planned.id
                )));
            }
            dag.add_task(planned.to_task())?;
        }
        for planned in &self.tasks {
            let to = TaskId::new(planned.id.as_str());
            for dependency in &planned.depends_on {
                dag.add_dependency(&TaskId::new(dependency.as_str()), &to, DependencyKind::Data)?;
            }
        }
        debug!(tasks = self.tasks.len(), "task plan applied");
        Ok(self.tasks.len())
    }
}
