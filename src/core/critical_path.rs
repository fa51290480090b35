//! Critical-path analysis.
//!
//! A forward pass over a topological order computes earliest start/finish
//! times, a backward pass computes latest start/finish times, and tasks with
//! zero slack form the critical path. When several zero-slack paths exist the
//! walk always steps to the lowest `TaskId`, starting from the lowest-id
//! zero-slack source.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::core::task::TaskId;

/// Scheduling window of a single task relative to the start of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskTiming {
    pub earliest_start: Duration,
    pub earliest_finish: Duration,
    pub latest_start: Duration,
    pub latest_finish: Duration,
}

impl TaskTiming {
    /// How long the task can slip without delaying the whole plan.
    pub fn slack(&self) -> Duration {
        self.latest_start.saturating_sub(self.earliest_start)
    }

    pub fn is_critical(&self) -> bool {
        self.slack().is_zero()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleAnalysis {
    /// Topological order the passes ran over.
    pub order: Vec<TaskId>,
    pub timings: BTreeMap<TaskId, TaskTiming>,
    pub critical_path: Vec<TaskId>,
    /// Length of the longest path, i.e. the minimum makespan.
    pub total_duration: Duration,
}

impl ScheduleAnalysis {
    pub fn timing(&self, id: &TaskId) -> Option<&TaskTiming> {
        self.timings.get(id)
    }

    /// True if the task is on the reported critical path.
    pub fn on_critical_path(&self, id: &TaskId) -> bool {
        self.critical_path.contains(id)
    }
}

/// Run both passes. `order` must be a topological order of every task in
/// `durations`; neighbour lists are expected in ascending id order.
pub(crate) fn analyze(
    order: Vec<TaskId>,
    durations: &BTreeMap<TaskId, Duration>,
    predecessors: &BTreeMap<TaskId, Vec<TaskId>>,
    successors: &BTreeMap<TaskId, Vec<TaskId>>,
) -> ScheduleAnalysis {
    let duration_of = |id: &TaskId| durations.get(id).copied().unwrap_or_default();
    let no_neighbours: Vec<TaskId> = Vec::new();

    let mut earliest_finish: BTreeMap<&TaskId, Duration> = BTreeMap::new();
    let mut earliest_start: BTreeMap<&TaskId, Duration> = BTreeMap::new();
    for id in &order {
        let start = predecessors
            .get(id)
            .unwrap_or(&no_neighbours)
            .iter()
            .filter_map(|p| earliest_finish.get(p).copied())
            .max()
            .unwrap_or_default();
        earliest_start.insert(id, start);
        earliest_finish.insert(id, start + duration_of(id));
    }

    let total_duration = earliest_finish.values().copied().max().unwrap_or_default();

    let mut latest_start: BTreeMap<&TaskId, Duration> = BTreeMap::new();
    let mut latest_finish: BTreeMap<&TaskId, Duration> = BTreeMap::new();
    for id in order.iter().rev() {
        let finish = successors
            .get(id)
            .unwrap_or(&no_neighbours)
            .iter()
            .filter_map(|s| latest_start.get(s).copied())
            .min()
            .unwrap_or(total_duration);
        latest_finish.insert(id, finish);
        latest_start.insert(id, finish.saturating_sub(duration_of(id)));
    }

    let timings: BTreeMap<TaskId, TaskTiming> = order
        .iter()
        .map(|id| {
            let timing = TaskTiming {
                earliest_start: earliest_start.get(id).copied().unwrap_or_default(),
                earliest_finish: earliest_finish.get(id).copied().unwrap_or_default(),
                latest_start: latest_start.get(id).copied().unwrap_or_default(),
                latest_finish: latest_finish.get(id).copied().unwrap_or_default(),
            };
            (id.clone(), timing)
        })
        .collect();

    let critical_path = walk_critical_path(&timings, predecessors, successors);

    ScheduleAnalysis {
        order,
        timings,
        critical_path,
        total_duration,
    }
}

fn walk_critical_path(
    timings: &BTreeMap<TaskId, TaskTiming>,
    predecessors: &BTreeMap<TaskId, Vec<TaskId>>,
    successors: &BTreeMap<TaskId, Vec<TaskId>>,
) -> Vec<TaskId> {
    // BTreeMap iteration gives the lowest-id source first.
    let start = timings.iter().find(|(id, timing)| {
        timing.is_critical() && predecessors.get(*id).map_or(true, Vec::is_empty)
    });

    let Some((first, _)) = start else {
        return Vec::new();
    };

    let mut path = vec![first.clone()];
    let mut current = first;
    loop {
        let Some(current_timing) = timings.get(current) else {
            break;
        };
        let next = successors.get(current).and_then(|next| {
            next.iter().find(|candidate| {
                timings.get(*candidate).is_some_and(|t| {
                    t.is_critical() && t.earliest_start == current_timing.earliest_finish
                })
            })
        });
        match next {
            Some(id) => {
                path.push(id.clone());
                current = id;
            }
            None => break,
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        durations: BTreeMap<TaskId, Duration>,
        predecessors: BTreeMap<TaskId, Vec<TaskId>>,
        successors: BTreeMap<TaskId, Vec<TaskId>>,
    }

    impl Fixture {
        fn new(tasks: &[(&str, u64)], edges: &[(&str, &str)]) -> Self {
            let mut fixture = Fixture {
                durations: BTreeMap::new(),
                predecessors: BTreeMap::new(),
                successors: BTreeMap::new(),
            };
            for (id, secs) in tasks {
                fixture
                    .durations
                    .insert(TaskId::new(*id), Duration::from_secs(*secs));
            }
            for (from, to) in edges {
                fixture
                    .successors
                    .entry(TaskId::new(*from))
                    .or_default()
                    .push(TaskId::new(*to));
                fixture
                    .predecessors
                    .entry(TaskId::new(*to))
                    .or_default()
                    .push(TaskId::new(*from));
            }
            for list in fixture.successors.values_mut() {
                list.sort();
            }
            fixture
        }

        fn run(&self, order: &[&str]) -> ScheduleAnalysis {
            analyze(
                order.iter().map(|id| TaskId::new(*id)).collect(),
                &self.durations,
                &self.predecessors,
                &self.successors,
            )
        }
    }

    fn ids(ids: &[&str]) -> Vec<TaskId> {
        ids.iter().map(|id| TaskId::new(*id)).collect()
    }

    #[test]
    fn test_empty_plan() {
        let analysis = Fixture::new(&[], &[]).run(&[]);
        assert!(analysis.critical_path.is_empty());
        assert_eq!(analysis.total_duration, Duration::ZERO);
    }

    #[test]
    fn test_longest_branch_is_critical() {
        // a(2) -> b(5) -> d(1), a -> c(1) -> d
        let fixture = Fixture::new(
            &[("a", 2), ("b", 5), ("c", 1), ("d", 1)],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let analysis = fixture.run(&["a", "b", "c", "d"]);

        assert_eq!(analysis.critical_path, ids(&["a", "b", "d"]));
        assert_eq!(analysis.total_duration, Duration::from_secs(8));

        let c = analysis.timing(&TaskId::new("c")).unwrap();
        assert_eq!(c.earliest_start, Duration::from_secs(2));
        assert_eq!(c.latest_start, Duration::from_secs(6));
        assert_eq!(c.slack(), Duration::from_secs(4));
        assert!(!analysis.on_critical_path(&TaskId::new("c")));
    }

    #[test]
    fn test_ties_break_to_lowest_id() {
        // Two equally long branches from a: via "c" and via "b".
        let fixture = Fixture::new(
            &[("a", 1), ("b", 3), ("c", 3), ("d", 1)],
            &[("a", "c"), ("a", "b"), ("b", "d"), ("c", "d")],
        );
        let analysis = fixture.run(&["a", "b", "c", "d"]);
        assert_eq!(analysis.critical_path, ids(&["a", "b", "d"]));
    }

    #[test]
    fn test_independent_tasks_pick_lowest_longest() {
        let fixture = Fixture::new(&[("x", 4), ("y", 4), ("z", 1)], &[]);
        let analysis = fixture.run(&["x", "y", "z"]);
        assert_eq!(analysis.critical_path, ids(&["x"]));
        assert_eq!(analysis.total_duration, Duration::from_secs(4));
        assert!(!analysis.timing(&TaskId::new("z")).unwrap().is_critical());
    }

    #[test]
    fn test_zero_estimates_follow_lowest_chain() {
        let fixture = Fixture::new(&[("a", 0), ("b", 0), ("c", 0)], &[("a", "c"), ("b", "c")]);
        let analysis = fixture.run(&["a", "b", "c"]);
        assert_eq!(analysis.critical_path, ids(&["a", "c"]));
    }
}
