//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! Nodes are tasks and an edge `from -> to` means `to` cannot run until
//! `from` has completed. The graph keeps task statuses consistent as it is
//! mutated: a task that has not started is `Executable` exactly when all of
//! its dependencies are `Completed`. Edges that would close a cycle are
//! rejected before insertion, so a graph built through `add_dependency` is
//! acyclic at all times. Graphs rebuilt from a snapshot are not checked
//! until `validate` runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::agent::AgentId;
use crate::core::critical_path::{self, ScheduleAnalysis};
use crate::core::cycles;
use crate::core::task::{ResourceId, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};

/// Why one task must wait for another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DependencyKind {
    /// `to` consumes the output of `from`.
    #[default]
    Data,
    /// Both tasks touch the same resources and must not overlap.
    Resource { resources: Vec<ResourceId> },
    /// Plain ordering constraint with a human-readable reason.
    Ordering { reason: String },
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyKind::Data => write!(f, "data"),
            DependencyKind::Resource { resources } => write!(f, "resources: {}", resources.len()),
            DependencyKind::Ordering { reason } => write!(f, "ordering: {}", reason),
        }
    }
}

/// A dependency edge as it appears in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from: TaskId,
    pub to: TaskId,
    #[serde(default)]
    pub kind: DependencyKind,
}

/// Number of tasks in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub executable: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// The task dependency graph.
pub struct TaskDAG {
    graph: StableDiGraph<Task, DependencyKind>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Rebuild a graph from snapshot parts.
    ///
    /// Task statuses are kept, except that not-started tasks are re-derived
    /// from their dependencies. Edges are inserted without cycle checks; call
    /// [`TaskDAG::validate`] before using the result.
    pub fn restore(tasks: Vec<Task>, edges: Vec<DependencyEdge>) -> Result<Self> {
        let mut dag = Self::new();
        for task in tasks {
            if task.id.is_blank() {
                return Err(Error::Validation("task id must not be empty".into()));
            }
            if dag.task_index.contains_key(&task.id) {
                return Err(Error::TaskExists(task.id));
            }
            let id = task.id.clone();
            let index = dag.graph.add_node(task);
            dag.task_index.insert(id, index);
        }
        for edge in edges {
            let from = dag.index_of(&edge.from)?;
            let to = dag.index_of(&edge.to)?;
            if dag.graph.find_edge(from, to).is_none() {
                dag.graph.add_edge(from, to, edge.kind);
            }
        }
        let indices: Vec<NodeIndex> = dag.graph.node_indices().collect();
        for index in indices {
            dag.refresh_status(index);
        }
        debug!(
            tasks = dag.task_count(),
            dependencies = dag.dependency_count(),
            "restored task graph"
        );
        Ok(dag)
    }

    /// Add a new, not-yet-started task. It is immediately executable since
    /// it has no dependencies yet.
    pub fn add_task(&mut self, mut task: Task) -> Result<()> {
        if task.id.is_blank() {
            return Err(Error::Validation("task id must not be empty".into()));
        }
        if self.task_index.contains_key(&task.id) {
            return Err(Error::TaskExists(task.id));
        }
        if task.has_started() {
            return Err(Error::InvalidTransition {
                task: task.id,
                from: task.status.name(),
                to: TaskStatus::Executable.name(),
            });
        }

        task.mark_executable();
        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id.clone(), index);
        debug!(task = %id, "task added");
        Ok(())
    }

    /// Declare that `to` depends on `from`.
    ///
    /// The edge is rejected with [`Error::CyclicDependency`] when `from` is
    /// already reachable from `to`; the graph is left unchanged. Adding an
    /// existing edge again is a no-op. A task that has already started cannot
    /// gain new dependencies.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId, kind: DependencyKind) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        if from_index == to_index {
            return Err(Error::CyclicDependency {
                cycle: vec![from.clone(), from.clone()],
            });
        }

        if self.graph.find_edge(from_index, to_index).is_some() {
            trace!(%from, %to, "dependency already present");
            return Ok(());
        }

        if let Some(path) = self.path_between(to_index, from_index) {
            // from -> to -> ... -> from
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(from.clone());
            cycle.extend(path);
            warn!(%from, %to, "rejected dependency that would close a cycle");
            return Err(Error::CyclicDependency { cycle });
        }

        let target = &self.graph[to_index];
        if target.has_started() {
            return Err(Error::Validation(format!(
                "task {} is already {} and cannot gain dependencies",
                to,
                target.status.name()
            )));
        }

        self.graph.add_edge(from_index, to_index, kind);
        self.refresh_status(to_index);
        debug!(%from, %to, "dependency added");
        Ok(())
    }

    /// Remove the edge `from -> to`. Returns whether an edge was removed.
    /// `to` may become executable as a result.
    pub fn remove_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<bool> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;

        let Some(edge) = self.graph.find_edge(from_index, to_index) else {
            return Ok(false);
        };
        self.graph.remove_edge(edge);
        self.refresh_status(to_index);
        debug!(%from, %to, "dependency removed");
        Ok(true)
    }

    /// Tasks that have not started and whose dependencies are all completed.
    pub fn get_executable_tasks(&self) -> BTreeSet<TaskId> {
        self.graph
            .node_indices()
            .filter(|&index| {
                self.graph[index].status.is_waiting() && self.dependencies_completed(index)
            })
            .map(|index| self.graph[index].id.clone())
            .collect()
    }

    /// Executable -> Running, assigned to `agent`.
    pub fn start_task(&mut self, id: &TaskId, agent: AgentId) -> Result<()> {
        let index = self.index_of(id)?;
        let task = &mut self.graph[index];
        if task.status != TaskStatus::Executable {
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from: task.status.name(),
                to: TaskStatus::Running.name(),
            });
        }
        debug!(task = %id, %agent, "task started");
        task.start(agent);
        Ok(())
    }

    /// Mark a task completed and return exactly the tasks that became
    /// executable because of it. Completing an already completed task
    /// returns an empty set and changes nothing.
    pub fn complete_task(&mut self, id: &TaskId) -> Result<BTreeSet<TaskId>> {
        let index = self.index_of(id)?;
        if self.graph[index].is_completed() {
            trace!(task = %id, "task already completed");
            return Ok(BTreeSet::new());
        }
        if !self.graph[index].is_running() {
            debug!(task = %id, status = %self.graph[index].status, "completing a task that was not running");
        }
        self.graph[index].complete();

        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        let mut unblocked = BTreeSet::new();
        for dependent in dependents {
            if self.graph[dependent].status == TaskStatus::Pending && self.refresh_status(dependent)
            {
                unblocked.insert(self.graph[dependent].id.clone());
            }
        }
        debug!(task = %id, unblocked = unblocked.len(), "task completed");
        Ok(unblocked)
    }

    /// Record a failure. Only running or executable tasks can fail; the task
    /// stays failed until [`TaskDAG::retry_task`] is called.
    pub fn fail_task(&mut self, id: &TaskId, error: impl Into<String>) -> Result<()> {
        let index = self.index_of(id)?;
        let task = &mut self.graph[index];
        if !matches!(task.status, TaskStatus::Running | TaskStatus::Executable) {
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from: task.status.name(),
                to: "failed",
            });
        }
        task.fail(error);
        warn!(task = %id, status = %task.status, "task failed");
        Ok(())
    }

    /// Failed -> Pending/Executable. Returns whether the task is executable
    /// again right away.
    pub fn retry_task(&mut self, id: &TaskId) -> Result<bool> {
        let index = self.index_of(id)?;
        let task = &mut self.graph[index];
        if !matches!(task.status, TaskStatus::Failed { .. }) {
            return Err(Error::InvalidTransition {
                task: id.clone(),
                from: task.status.name(),
                to: TaskStatus::Pending.name(),
            });
        }
        task.reset();
        self.refresh_status(index);
        let executable = self.graph[index].status == TaskStatus::Executable;
        debug!(task = %id, executable, "task queued for retry");
        Ok(executable)
    }

    /// Remove a task that is not running, together with its edges.
    /// Former dependents are re-evaluated and may become executable.
    pub fn purge_task(&mut self, id: &TaskId) -> Result<Task> {
        let index = self.index_of(id)?;
        if self.graph[index].is_running() {
            return Err(Error::Validation(format!(
                "task {} is running and cannot be purged",
                id
            )));
        }
        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        let task = self
            .graph
            .remove_node(index)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        self.task_index.remove(id);
        for dependent in dependents {
            self.refresh_status(dependent);
        }
        debug!(task = %id, "task purged");
        Ok(task)
    }

    /// Every cycle in the graph, as the path from the first revisited task.
    pub fn detect_cycles(&self) -> Vec<Vec<TaskId>> {
        cycles::find_cycles(&self.adjacency())
    }

    /// Fail with [`Error::CyclicDependency`] if the graph contains a cycle.
    pub fn validate(&self) -> Result<()> {
        match self.detect_cycles().into_iter().next() {
            Some(mut cycle) => {
                if let Some(first) = cycle.first().cloned() {
                    cycle.push(first);
                }
                Err(Error::CyclicDependency { cycle })
            }
            None => Ok(()),
        }
    }

    /// Deterministic topological order (Kahn's algorithm, lowest id first).
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let mut in_degree: BTreeMap<&TaskId, usize> = BTreeMap::new();
        for index in self.graph.node_indices() {
            let degree = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .count();
            in_degree.insert(&self.graph[index].id, degree);
        }

        let mut ready: BTreeSet<&TaskId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.task_count());

        while let Some(id) = ready.pop_first() {
            order.push(id.clone());
            let Some(&index) = self.task_index.get(id) else {
                continue;
            };
            for dependent in self.graph.neighbors_directed(index, Direction::Outgoing) {
                let dependent_id = &self.graph[dependent].id;
                if let Some(degree) = in_degree.get_mut(dependent_id) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent_id);
                    }
                }
            }
        }

        if order.len() < self.task_count() {
            self.validate()?;
        }
        Ok(order)
    }

    /// Forward/backward pass analysis over the estimated durations.
    pub fn analyze_schedule(&self) -> Result<ScheduleAnalysis> {
        let order = self.topological_order()?;
        let durations: BTreeMap<TaskId, std::time::Duration> = self
            .task_iter()
            .map(|task| (task.id.clone(), task.estimated_duration))
            .collect();
        let mut predecessors: BTreeMap<TaskId, Vec<TaskId>> = BTreeMap::new();
        for edge in self.graph.edge_references() {
            predecessors
                .entry(self.graph[edge.target()].id.clone())
                .or_default()
                .push(self.graph[edge.source()].id.clone());
        }
        Ok(critical_path::analyze(
            order,
            &durations,
            &predecessors,
            &self.adjacency(),
        ))
    }

    /// Longest chain of estimated work, ties broken by lowest id.
    pub fn critical_path(&self) -> Result<Vec<TaskId>> {
        Ok(self.analyze_schedule()?.critical_path)
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index.get(id).map(|&index| &self.graph[index])
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&from), Some(&to)) => self.graph.find_edge(from, to).is_some(),
            _ => false,
        }
    }

    /// Tasks `id` depends on, sorted.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbours(id, Direction::Incoming)
    }

    /// Tasks that depend on `id`, sorted.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbours(id, Direction::Outgoing)
    }

    /// All tasks, sorted by id.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.task_iter().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// All edges, sorted by `(from, to)`.
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut edges: Vec<DependencyEdge> = self
            .graph
            .edge_references()
            .map(|edge| DependencyEdge {
                from: self.graph[edge.source()].id.clone(),
                to: self.graph[edge.target()].id.clone(),
                kind: edge.weight().clone(),
            })
            .collect();
        edges.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
        edges
    }

    /// Running tasks currently assigned to `agent`.
    pub fn running_tasks_of(&self, agent: &AgentId) -> Vec<TaskId> {
        let mut running: Vec<TaskId> = self
            .task_iter()
            .filter(|task| task.is_running() && task.agent_id.as_ref() == Some(agent))
            .map(|task| task.id.clone())
            .collect();
        running.sort();
        running
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.task_iter() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Executable => counts.executable += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    pub fn all_complete(&self) -> bool {
        self.task_iter().all(Task::is_completed)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn task_iter(&self) -> impl Iterator<Item = &Task> + '_ {
        self.graph.node_indices().map(move |index| &self.graph[index])
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    fn dependencies_completed(&self, index: NodeIndex) -> bool {
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .all(|dependency| self.graph[dependency].is_completed())
    }

    /// Re-derive Pending/Executable for a not-started task. Returns true
    /// when the task is executable afterwards.
    fn refresh_status(&mut self, index: NodeIndex) -> bool {
        if !self.graph[index].status.is_waiting() {
            return false;
        }
        let ready = self.dependencies_completed(index);
        let task = &mut self.graph[index];
        if ready {
            task.mark_executable();
        } else {
            task.mark_pending();
        }
        ready
    }

    /// Depth-first search for a path `start -> ... -> goal`.
    fn path_between(&self, start: NodeIndex, goal: NodeIndex) -> Option<Vec<TaskId>> {
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut stack = vec![start];
        let mut seen = BTreeSet::from([start]);

        while let Some(node) = stack.pop() {
            if node == goal {
                let mut path = vec![self.graph[node].id.clone()];
                let mut current = node;
                while let Some(&previous) = parent.get(&current) {
                    path.push(self.graph[previous].id.clone());
                    current = previous;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(next) {
                    parent.insert(next, node);
                    stack.push(next);
                }
            }
        }
        None
    }

    fn neighbours(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|neighbour| self.graph[neighbour].id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Outgoing adjacency keyed and sorted by id.
    fn adjacency(&self) -> BTreeMap<TaskId, Vec<TaskId>> {
        self.graph
            .node_indices()
            .map(|index| {
                let id = self.graph[index].id.clone();
                let mut next: Vec<TaskId> = self
                    .graph
                    .neighbors_directed(index, Direction::Outgoing)
                    .map(|n| self.graph[n].id.clone())
                    .collect();
                next.sort();
                (id, next)
            })
            .collect()
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("task_count", &self.task_count())
            .field("dependency_count", &self.dependency_count())
            .finish()
    }
}
