//! Supervised worker processes under the orchestrator.

use std::sync::Arc;

use conductor::core::task::TaskStatus;
use conductor::events::{EventKind, EventSink};
use conductor::orchestration::{AgentStatus, DispatchOutcome, Orchestrator, WorkerStatus};

use crate::fixtures::{aid, eventually, task, test_config, tid};

/// Test: restart boundedness
/// Given a worker command that exits immediately and a limit of 2 restarts
/// When the worker is supervised
/// Then it is restarted exactly twice, then declared crashed, and the task it
/// held is failed with its locks released
#[tokio::test]
async fn test_crashing_worker_is_restarted_a_bounded_number_of_times() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.worker.command = Some("false".into());
    let (sink, events) = EventSink::channel(4096);
    let orchestrator = Orchestrator::new(Arc::new(config), sink).unwrap();

    orchestrator.add_task(task("t", &["repo"])).await.unwrap();
    orchestrator.register_agent(&aid("w1")).await;
    orchestrator.spawn_worker(&aid("w1")).await.unwrap();

    let assignments = orchestrator.dispatch().await.unwrap();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].outcome, DispatchOutcome::Started);

    let crashed = eventually(|| {
        let orchestrator = orchestrator.clone();
        async move {
            matches!(
                orchestrator.agents().get(&aid("w1")).await.map(|s| s.status),
                Some(AgentStatus::Crashed { .. })
            )
        }
    })
    .await;
    assert!(crashed, "worker was never declared crashed");

    let worker = orchestrator.supervisor().get(&aid("w1")).await.unwrap();
    assert!(matches!(worker.status, WorkerStatus::Crashed { .. }));
    assert_eq!(worker.restart_count, 2);

    let events = events.drain();
    let restarts = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::WorkerRestarting { .. }))
        .count();
    let crashes = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::WorkerCrashed { .. }))
        .count();
    assert_eq!(restarts, 2);
    assert_eq!(crashes, 1);

    let task = orchestrator.task(&tid("t")).await.unwrap();
    assert!(matches!(task.status, TaskStatus::Failed { .. }));
    assert!(orchestrator.coordinator().locks().await.is_empty());

    // A crashed worker gets no new work.
    orchestrator.retry_task(&tid("t")).await.unwrap();
    assert!(orchestrator.dispatch().await.unwrap().is_empty());
}
