//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Building tasks and small predefined graphs
//! - A configuration with fast timers and a socket inside a temp directory
//! - An orchestrator serving on that socket
//! - A scripted worker speaking the wire protocol

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use conductor::agent::AgentId;
use conductor::backoff::BackoffStrategy;
use conductor::config::Config;
use conductor::core::dag::{DependencyKind, TaskDAG};
use conductor::core::task::{Task, TaskId};
use conductor::events::{EventSink, EventStream};
use conductor::orchestration::{Orchestrator, RestartPolicy};
use conductor::transport::{Connection, FrameReader, FrameSender, Message, TransportListener};

/// How long helpers wait for something to happen before failing the test.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn task(id: &str, resources: &[&str]) -> Task {
    Task::new(id, &format!("{} title", id)).with_resources(resources.iter().copied())
}

pub fn tid(id: &str) -> TaskId {
    TaskId::new(id)
}

pub fn aid(id: &str) -> AgentId {
    AgentId::new(id)
}

/// A -> {B, C}
///
/// ```text
///     B
///    /
///   A
///    \
///     C
/// ```
pub fn fan_out_dag() -> TaskDAG {
    let mut dag = TaskDAG::new();
    for id in ["A", "B", "C"] {
        dag.add_task(task(id, &[])).unwrap();
    }
    dag.add_dependency(&tid("A"), &tid("B"), DependencyKind::Data)
        .unwrap();
    dag.add_dependency(&tid("A"), &tid("C"), DependencyKind::Data)
        .unwrap();
    dag
}

/// Configuration with short timers and a socket inside `dir`.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.socket_path = Some(dir.join("conductor.sock").to_string_lossy().into_owned());
    config.coordinator.deadlock_check_interval = Duration::from_millis(50);
    config.coordinator.lock_stale_after = None;
    config.health.check_interval = Duration::from_millis(50);
    config.restart = RestartPolicy::new(
        2,
        Duration::from_secs(60),
        BackoffStrategy::fixed(Duration::from_millis(20)),
    );
    config
}

/// Poll `check` until it returns true or [`WAIT`] elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// An orchestrator running its accept loop on a temp socket.
pub struct TestServer {
    pub dir: TempDir,
    pub socket: PathBuf,
    pub orchestrator: Arc<Orchestrator>,
    pub events: EventStream,
    cancel: CancellationToken,
    handle: Option<JoinHandle<conductor::Result<()>>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = test_config(dir.path());
        adjust(&mut config);
        let config = Arc::new(config);

        let (sink, events) = EventSink::channel(4096);
        let orchestrator = Orchestrator::new(config.clone(), sink).unwrap();
        let socket = config.socket_path().unwrap();
        let listener = TransportListener::bind(&socket, config.transport.max_frame_len).unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(orchestrator.clone().run(listener, cancel.clone()));
        Self {
            dir,
            socket,
            orchestrator,
            events,
            cancel,
            handle: Some(handle),
        }
    }

    pub async fn connect(&self, agent: &str) -> TestWorker {
        TestWorker::connect(&self.socket, agent).await
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A worker driven by the test over the real wire protocol.
pub struct TestWorker {
    pub agent: AgentId,
    reader: FrameReader,
    sender: FrameSender,
}

impl TestWorker {
    /// Connect and complete the `CreateSession` handshake.
    pub async fn connect(socket: &Path, agent: &str) -> Self {
        let connection = Connection::connect(socket, conductor::transport::DEFAULT_MAX_FRAME_LEN)
            .await
            .expect("Failed to connect");
        let (reader, sender) = connection.split();
        let mut worker = Self {
            agent: aid(agent),
            reader,
            sender,
        };
        worker
            .send(Message::CreateSession {
                agent_id: worker.agent.clone(),
                pid: Some(std::process::id()),
            })
            .await;
        match worker.recv().await {
            Message::SessionAccepted { agent_id } => assert_eq!(agent_id, worker.agent),
            other => panic!("expected session_accepted, got {:?}", other),
        }
        worker
    }

    pub async fn send(&self, message: Message) {
        self.sender.send(message).await.expect("Failed to send");
    }

    /// Next message, failing the test after [`WAIT`].
    pub async fn recv(&mut self) -> Message {
        match tokio::time::timeout(WAIT, self.reader.recv()).await {
            Ok(Ok(Some(envelope))) => envelope.message,
            Ok(Ok(None)) => panic!("{}: connection closed", self.agent),
            Ok(Err(e)) => panic!("{}: transport error: {}", self.agent, e),
            Err(_) => panic!("{}: no message within {:?}", self.agent, WAIT),
        }
    }

    /// Next message, or `None` when the connection closed or nothing
    /// arrived within [`WAIT`].
    pub async fn try_recv(&mut self) -> Option<Message> {
        match tokio::time::timeout(WAIT, self.reader.recv()).await {
            Ok(Ok(Some(envelope))) => Some(envelope.message),
            _ => None,
        }
    }

    /// Skip messages until one matches.
    pub async fn recv_matching(&mut self, matches: impl Fn(&Message) -> bool) -> Message {
        loop {
            let message = self.recv().await;
            if matches(&message) {
                return message;
            }
        }
    }

    /// Wait for the next assignment and return its task id.
    pub async fn next_assignment(&mut self) -> TaskId {
        match self
            .recv_matching(|m| matches!(m, Message::AssignTask { .. }))
            .await
        {
            Message::AssignTask { task_id, .. } => task_id,
            _ => unreachable!(),
        }
    }

    pub async fn complete(&self, task: &TaskId) {
        self.send(Message::TaskCompleted {
            agent_id: self.agent.clone(),
            task_id: task.clone(),
        })
        .await;
    }

    pub async fn heartbeat(&self) {
        self.send(Message::Heartbeat {
            agent_id: self.agent.clone(),
            current_task: None,
        })
        .await;
    }
}
