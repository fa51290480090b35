//! The orchestrator end to end over a local socket.

use std::collections::BTreeSet;
use std::time::Duration;

use conductor::core::dag::DependencyKind;
use conductor::core::task::{ResourceId, TaskId, TaskStatus};
use conductor::error::ErrorKind;
use conductor::transport::{Connection, Message, DEFAULT_MAX_FRAME_LEN};

use crate::fixtures::{aid, eventually, task, tid, TestServer, TestWorker};

async fn wait_connected(server: &TestServer, count: usize) {
    let orchestrator = server.orchestrator.clone();
    assert!(
        eventually(|| {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.status().await.connected == count }
        })
        .await,
        "expected {count} connected workers"
    );
}

/// Complete every assignment until the orchestrator shuts down.
async fn work_until_shutdown(mut worker: TestWorker) -> Vec<TaskId> {
    let mut done = Vec::new();
    while let Some(message) = worker.try_recv().await {
        match message {
            Message::AssignTask { task_id, .. } => {
                worker.complete(&task_id).await;
                done.push(task_id);
            }
            Message::Shutdown => break,
            _ => {}
        }
    }
    done
}

/// Test: full run
/// Given A -> {B, C} where B and C share a resource, and two workers
/// When the workers complete whatever they are assigned
/// Then every task completes exactly once and no lock is left behind
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plan_runs_to_completion() {
    let server = TestServer::start().await;
    let orchestrator = server.orchestrator.clone();
    orchestrator.add_task(task("A", &[])).await.unwrap();
    orchestrator.add_task(task("B", &["repo"])).await.unwrap();
    orchestrator.add_task(task("C", &["repo"])).await.unwrap();
    for dependent in ["B", "C"] {
        orchestrator
            .add_dependency(&tid("A"), &tid(dependent), DependencyKind::Data)
            .await
            .unwrap();
    }

    let w1 = tokio::spawn(work_until_shutdown(server.connect("w1").await));
    let w2 = tokio::spawn(work_until_shutdown(server.connect("w2").await));

    let finished = eventually(|| {
        let orchestrator = orchestrator.clone();
        async move { orchestrator.all_complete().await }
    })
    .await;
    assert!(finished, "plan did not complete");

    let status = orchestrator.status().await;
    assert_eq!(status.tasks.completed, 3);
    assert!(orchestrator.coordinator().locks().await.is_empty());

    server.shutdown().await;
    let mut done = w1.await.unwrap();
    done.extend(w2.await.unwrap());
    assert_eq!(done.len(), 3);
    assert_eq!(
        done.into_iter().collect::<BTreeSet<_>>(),
        BTreeSet::from([tid("A"), tid("B"), tid("C")])
    );
}

/// Test: disconnect mid-task
/// Given a worker that drops its connection while running a task
/// When the disconnect is noticed
/// Then the task fails, its locks are released, and after a retry another
/// worker picks it up
#[tokio::test]
async fn test_disconnect_fails_running_task() {
    let server = TestServer::start().await;
    let orchestrator = server.orchestrator.clone();

    let mut w1 = server.connect("w1").await;
    wait_connected(&server, 1).await;
    orchestrator.add_task(task("A", &["r"])).await.unwrap();
    assert_eq!(w1.next_assignment().await, tid("A"));
    drop(w1);

    let failed = eventually(|| {
        let orchestrator = orchestrator.clone();
        async move {
            matches!(
                orchestrator.task(&tid("A")).await.map(|t| t.status),
                Some(TaskStatus::Failed { .. })
            )
        }
    })
    .await;
    assert!(failed, "task was not failed after disconnect");
    assert!(orchestrator.coordinator().locks().await.is_empty());

    orchestrator.retry_task(&tid("A")).await.unwrap();
    let mut w2 = server.connect("w2").await;
    assert_eq!(w2.next_assignment().await, tid("A"));
    w2.complete(&tid("A")).await;
    assert!(
        eventually(|| {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.all_complete().await }
        })
        .await
    );
    server.shutdown().await;
}

/// Test: input relay between workers
#[tokio::test]
async fn test_send_input_is_relayed() {
    let server = TestServer::start().await;
    let w1 = server.connect("w1").await;
    let mut w2 = server.connect("w2").await;
    wait_connected(&server, 2).await;

    w1.send(Message::SendInput {
        agent_id: aid("w2"),
        input: "rebase onto main".into(),
    })
    .await;
    let relayed = w2
        .recv_matching(|m| matches!(m, Message::SendInput { .. }))
        .await;
    assert_eq!(
        relayed,
        Message::SendInput {
            agent_id: aid("w2"),
            input: "rebase onto main".into(),
        }
    );
    server.shutdown().await;
}

/// Test: workers must identify themselves first
#[tokio::test]
async fn test_handshake_required() {
    let server = TestServer::start().await;
    let mut connection = Connection::connect(&server.socket, DEFAULT_MAX_FRAME_LEN)
        .await
        .unwrap();
    connection
        .send(Message::Heartbeat {
            agent_id: aid("w1"),
            current_task: None,
        })
        .await
        .unwrap();

    let reply = connection.recv().await.unwrap().unwrap();
    assert!(matches!(reply.message, Message::Error { .. }));
    assert!(connection.recv().await.unwrap().is_none());
    assert_eq!(server.orchestrator.status().await.connected, 0);
    server.shutdown().await;
}

/// Test: a worker may not speak for another agent
#[tokio::test]
async fn test_spoofed_message_rejected() {
    let server = TestServer::start().await;
    let mut w1 = server.connect("w1").await;
    wait_connected(&server, 1).await;

    w1.send(Message::TaskCompleted {
        agent_id: aid("w2"),
        task_id: tid("A"),
    })
    .await;
    let reply = w1
        .recv_matching(|m| matches!(m, Message::Error { .. }))
        .await;
    match reply {
        Message::Error { message, .. } => assert!(message.contains("claims")),
        _ => unreachable!(),
    }
    server.shutdown().await;
}

/// Test: reconnect
/// Given a worker that opened a second session
/// When its first, superseded connection closes
/// Then the worker stays connected, keeps its task and can finish it
#[tokio::test]
async fn test_superseded_connection_close_keeps_worker() {
    let server = TestServer::start().await;
    let orchestrator = server.orchestrator.clone();
    let first = server.connect("w1").await;
    wait_connected(&server, 1).await;
    let mut second = server.connect("w1").await;

    // The reply to a request on the new connection arrives there once the
    // engine has switched over.
    second
        .send(Message::SendInput {
            agent_id: aid("nobody"),
            input: String::new(),
        })
        .await;
    second
        .recv_matching(|m| matches!(m, Message::Error { .. }))
        .await;

    orchestrator.add_task(task("A", &["r"])).await.unwrap();
    assert_eq!(second.next_assignment().await, tid("A"));

    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(orchestrator.status().await.connected, 1);
    assert!(orchestrator.task(&tid("A")).await.unwrap().is_running());
    assert_eq!(orchestrator.coordinator().locks().await.len(), 1);

    second.complete(&tid("A")).await;
    assert!(
        eventually(|| {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.all_complete().await }
        })
        .await
    );
    server.shutdown().await;
}

/// Test: withdrawing a queued lock request
/// Given w2 queued behind w1 for a resource
/// When w2 cancels its request (and w1 tries to cancel it first)
/// Then only w2 may withdraw it, and the resource is not handed to w2 later
#[tokio::test]
async fn test_queued_request_can_be_cancelled() {
    let server = TestServer::start().await;
    let orchestrator = server.orchestrator.clone();

    let mut w1 = server.connect("w1").await;
    wait_connected(&server, 1).await;
    orchestrator.add_task(task("A", &["repo"])).await.unwrap();
    assert_eq!(w1.next_assignment().await, tid("A"));

    let mut w2 = server.connect("w2").await;
    wait_connected(&server, 2).await;
    orchestrator.add_task(task("B", &[])).await.unwrap();
    assert_eq!(w2.next_assignment().await, tid("B"));

    w2.send(Message::RequestExecution {
        agent_id: aid("w2"),
        task_id: tid("B"),
        resources: vec![ResourceId::new("repo")],
    })
    .await;
    let request_id = match w2
        .recv_matching(|m| matches!(m, Message::ExecutionQueued { .. }))
        .await
    {
        Message::ExecutionQueued { request_id, .. } => request_id,
        _ => unreachable!(),
    };

    w1.send(Message::CancelRequest {
        agent_id: aid("w1"),
        request_id,
    })
    .await;
    let reply = w1
        .recv_matching(|m| matches!(m, Message::Error { .. }))
        .await;
    assert!(matches!(
        reply,
        Message::Error {
            kind: ErrorKind::Validation,
            ..
        }
    ));
    assert_eq!(orchestrator.coordinator().pending_requests().await.len(), 1);

    w2.send(Message::CancelRequest {
        agent_id: aid("w2"),
        request_id,
    })
    .await;
    assert_eq!(
        w2.recv_matching(|m| matches!(m, Message::RequestCancelled { .. }))
            .await,
        Message::RequestCancelled { request_id }
    );
    assert!(orchestrator.coordinator().pending_requests().await.is_empty());

    w1.complete(&tid("A")).await;
    assert!(
        eventually(|| {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.coordinator().locks().await.is_empty() }
        })
        .await
    );
    w2.complete(&tid("B")).await;
    assert!(
        eventually(|| {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.all_complete().await }
        })
        .await
    );
    server.shutdown().await;
}
