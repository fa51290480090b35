//! Task graph integration and property tests.

use std::collections::BTreeSet;

use proptest::prelude::*;

use conductor::core::dag::{DependencyKind, TaskDAG};
use conductor::core::plan::TaskPlan;
use conductor::core::task::TaskStatus;
use conductor::Error;

use crate::fixtures::{aid, fan_out_dag, task, tid};

/// Test: fan-out scenario
/// Given A -> {B, C}
/// When A runs and completes
/// Then exactly B and C become executable, and completing A again is a no-op
#[test]
fn test_fan_out_unblocks_both_dependents() {
    let mut dag = fan_out_dag();
    assert_eq!(dag.get_executable_tasks(), BTreeSet::from([tid("A")]));

    dag.start_task(&tid("A"), aid("w1")).unwrap();
    assert!(dag.get_executable_tasks().is_empty());

    let unblocked = dag.complete_task(&tid("A")).unwrap();
    assert_eq!(unblocked, BTreeSet::from([tid("B"), tid("C")]));
    assert_eq!(dag.get_executable_tasks(), unblocked);

    assert!(dag.complete_task(&tid("A")).unwrap().is_empty());
    assert_eq!(dag.get_executable_tasks(), unblocked);
}

/// Test: closing a cycle is rejected without side effects
#[test]
fn test_cycle_rejected_and_graph_unchanged() {
    let mut dag = fan_out_dag();
    let err = dag
        .add_dependency(&tid("B"), &tid("A"), DependencyKind::Data)
        .unwrap_err();
    match err {
        Error::CyclicDependency { cycle } => {
            assert_eq!(cycle.first(), Some(&tid("B")));
            assert_eq!(cycle.last(), Some(&tid("B")));
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert_eq!(dag.dependency_count(), 2);
    assert!(dag.detect_cycles().is_empty());
}

/// Test: a failed task blocks dependents until retried
#[test]
fn test_failure_blocks_until_retry() {
    let mut dag = fan_out_dag();
    dag.start_task(&tid("A"), aid("w1")).unwrap();
    dag.fail_task(&tid("A"), "compiler crashed").unwrap();
    assert!(matches!(
        dag.get_task(&tid("A")).unwrap().status,
        TaskStatus::Failed { .. }
    ));
    assert!(dag.get_executable_tasks().is_empty());

    assert!(dag.retry_task(&tid("A")).unwrap());
    dag.start_task(&tid("A"), aid("w2")).unwrap();
    assert_eq!(dag.complete_task(&tid("A")).unwrap().len(), 2);
    assert_eq!(dag.get_task(&tid("A")).unwrap().attempts, 2);
}

/// Test: plans resolve dependencies and report bad references
#[test]
fn test_plan_loading() {
    let plan = TaskPlan::from_toml_str(
        r#"
        [[tasks]]
        id = "schema"
        title = "Design the schema"
        resources = ["db/schema.sql"]
        estimate_secs = 600

        [[tasks]]
        id = "api"
        title = "Implement the API"
        depends_on = ["schema"]
        estimate_secs = 1200

        [[tasks]]
        id = "docs"
        title = "Write docs"
        estimate_secs = 60
        "#,
    )
    .unwrap();
    let dag = plan.into_dag().unwrap();
    assert_eq!(
        dag.get_executable_tasks(),
        BTreeSet::from([tid("docs"), tid("schema")])
    );
    assert_eq!(dag.critical_path().unwrap(), vec![tid("schema"), tid("api")]);

    let dangling = TaskPlan::from_toml_str(
        r#"
        [[tasks]]
        id = "api"
        title = "Implement the API"
        depends_on = ["missing"]
        "#,
    )
    .unwrap();
    assert!(matches!(dangling.into_dag(), Err(Error::TaskNotFound(_))));

    let cyclic = TaskPlan::from_json_str(
        r#"{"tasks": [
            {"id": "a", "title": "a", "depends_on": ["b"]},
            {"id": "b", "title": "b", "depends_on": ["a"]}
        ]}"#,
    )
    .unwrap();
    assert!(matches!(
        cyclic.into_dag(),
        Err(Error::CyclicDependency { .. })
    ));
}

fn build(n: usize, edges: &[(usize, usize)]) -> (TaskDAG, Vec<(usize, usize)>) {
    let mut dag = TaskDAG::new();
    for i in 0..n {
        dag.add_task(task(&format!("t{i:02}"), &[])).unwrap();
    }
    let mut accepted = Vec::new();
    for &(from, to) in edges {
        let (from, to) = (from % n, to % n);
        let result = dag.add_dependency(
            &tid(&format!("t{from:02}")),
            &tid(&format!("t{to:02}")),
            DependencyKind::Data,
        );
        match result {
            Ok(()) => accepted.push((from, to)),
            Err(Error::CyclicDependency { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    (dag, accepted)
}

/// Tasks whose dependencies are all completed and that have not started.
fn expected_executable(dag: &TaskDAG) -> BTreeSet<conductor::core::task::TaskId> {
    dag.tasks()
        .into_iter()
        .filter(|t| !t.has_started() && !matches!(t.status, TaskStatus::Failed { .. }))
        .filter(|t| {
            dag.dependencies(&t.id)
                .iter()
                .all(|d| dag.get_task(d).is_some_and(|d| d.is_completed()))
        })
        .map(|t| t.id.clone())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever edges are attempted, the graph stays acyclic and a
    /// topological order covers every task.
    #[test]
    fn prop_graph_stays_acyclic(
        n in 1usize..12,
        edges in prop::collection::vec((0usize..12, 0usize..12), 0..40),
    ) {
        let (dag, accepted) = build(n, &edges);
        prop_assert!(dag.detect_cycles().is_empty());
        prop_assert!(dag.validate().is_ok());

        let order = dag.topological_order().unwrap();
        prop_assert_eq!(order.len(), n);
        let position = |i: usize| order.iter().position(|t| *t == tid(&format!("t{i:02}")));
        for (from, to) in accepted {
            prop_assert!(position(from) < position(to));
        }
    }

    /// Completing tasks in any dependency-respecting order keeps the
    /// executable set equal to "not started, all dependencies completed", and
    /// completing twice never unblocks anything.
    #[test]
    fn prop_executable_set_and_idempotent_completion(
        n in 1usize..10,
        edges in prop::collection::vec((0usize..10, 0usize..10), 0..30),
        picks in prop::collection::vec(any::<prop::sample::Index>(), 0..20),
    ) {
        let (mut dag, _) = build(n, &edges);
        prop_assert_eq!(dag.get_executable_tasks(), expected_executable(&dag));

        for pick in picks {
            let executable: Vec<_> = dag.get_executable_tasks().into_iter().collect();
            if executable.is_empty() {
                break;
            }
            let chosen = executable[pick.index(executable.len())].clone();
            dag.start_task(&chosen, aid("w")).unwrap();
            let before = dag.get_executable_tasks();
            let unblocked = dag.complete_task(&chosen).unwrap();

            prop_assert!(unblocked.is_disjoint(&before));
            prop_assert_eq!(dag.get_executable_tasks(), expected_executable(&dag));
            prop_assert!(dag.complete_task(&chosen).unwrap().is_empty());
        }
    }
}
