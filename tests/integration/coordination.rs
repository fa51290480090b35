//! Lock coordination between concurrent agents.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use conductor::agent::AgentId;
use conductor::core::task::{ResourceId, TaskId};
use conductor::events::EventSink;
use conductor::orchestration::{
    CollaborationCoordinator, CoordinatorConfig, ExecutionDecision, ExecutionRequest,
    RequestTicket,
};

use crate::fixtures::{aid, tid};

fn coordinator() -> Arc<CollaborationCoordinator> {
    let config = CoordinatorConfig {
        lock_stale_after: None,
        ..CoordinatorConfig::default()
    };
    Arc::new(CollaborationCoordinator::new(config, EventSink::disabled()))
}

fn res(id: &str) -> ResourceId {
    ResourceId::new(id)
}

fn queued(decision: ExecutionDecision) -> RequestTicket {
    match decision {
        ExecutionDecision::Queued(ticket) => ticket,
        other => panic!("expected queued, got {:?}", other),
    }
}

/// Test: FIFO hand-off
/// Given one holder and three queued requests for the same resource
/// When the holder and each successor release in turn
/// Then the resource passes to the waiters in arrival order
#[tokio::test]
async fn test_fifo_hand_off() {
    let coordinator = coordinator();
    let decision = coordinator
        .request_execution(ExecutionRequest::new(aid("w0"), tid("t0"), [res("repo")]))
        .await
        .unwrap();
    assert!(decision.is_granted());

    let mut tickets = Vec::new();
    for i in 1..=3 {
        let request = ExecutionRequest::new(
            aid(&format!("w{i}")),
            tid(&format!("t{i}")),
            [res("repo")],
        )
        .with_priority(10 - i);
        tickets.push(queued(coordinator.request_execution(request).await.unwrap()));
    }

    for i in 0..3 {
        let grants = coordinator
            .notify_completion(&aid(&format!("w{i}")), &tid(&format!("t{i}")), &[])
            .await
            .unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].agent_id, aid(&format!("w{}", i + 1)));
        assert_eq!(
            coordinator.holder_of(&res("repo")).await.unwrap().holder,
            aid(&format!("w{}", i + 1))
        );
    }

    for (i, ticket) in tickets.into_iter().enumerate() {
        let grant = ticket.granted().await.unwrap();
        assert_eq!(grant.task_id, tid(&format!("t{}", i + 1)));
    }
}

/// Test: mutual exclusion under concurrency
/// Given eight agents repeatedly locking overlapping resource sets
/// When they run concurrently
/// Then no resource ever has two holders at once and every round finishes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_exclusion_under_concurrency() {
    const AGENTS: usize = 8;
    const ROUNDS: usize = 15;
    let resources = ["r0", "r1", "r2", "r3"];

    let coordinator = coordinator();
    let holders: Arc<StdMutex<HashMap<ResourceId, String>>> = Arc::default();
    let mut handles = Vec::new();

    for a in 0..AGENTS {
        let coordinator = coordinator.clone();
        let holders = holders.clone();
        handles.push(tokio::spawn(async move {
            let agent = aid(&format!("agent-{a}"));
            for round in 0..ROUNDS {
                let wanted: Vec<ResourceId> = resources
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| (a + round + i) % 3 != 0)
                    .map(|(_, r)| res(r))
                    .collect();
                let task = TaskId::new(format!("{agent}-{round}"));
                let request = ExecutionRequest::new(agent.clone(), task.clone(), wanted.clone());
                let grant = match coordinator.request_execution(request).await.unwrap() {
                    ExecutionDecision::Granted(grant) => grant,
                    ExecutionDecision::Queued(ticket) => coordinator
                        .wait_for(ticket, Some(Duration::from_secs(10)))
                        .await
                        .unwrap(),
                    ExecutionDecision::Denied(reason) => panic!("denied: {reason}"),
                };
                assert_eq!(grant.resources.len(), wanted.len());

                {
                    let mut held = holders.lock().unwrap();
                    for resource in &wanted {
                        if let Some(other) = held.insert(resource.clone(), agent.to_string()) {
                            panic!("{resource} held by {other} and {agent}");
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                {
                    let mut held = holders.lock().unwrap();
                    for resource in &wanted {
                        held.remove(resource);
                    }
                }
                coordinator
                    .notify_completion(&agent, &task, &[])
                    .await
                    .unwrap();
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert!(coordinator.locks().await.is_empty());
    assert!(coordinator.pending_requests().await.is_empty());
    let metrics = coordinator.metrics().await;
    assert_eq!(metrics.requests, (AGENTS * ROUNDS) as u64);
    assert_eq!(metrics.denied, 0);
}

/// Test: deadlock liveness
/// Given two agents each holding what the other waits for
/// When deadlocks are resolved
/// Then one victim is preempted and both agents eventually finish all work
#[tokio::test]
async fn test_deadlock_resolution_keeps_everyone_moving() {
    let coordinator = coordinator();
    for (agent, task, resource) in [("a", "a1", "r1"), ("b", "b1", "r2")] {
        assert!(coordinator
            .request_execution(ExecutionRequest::new(aid(agent), tid(task), [res(resource)]))
            .await
            .unwrap()
            .is_granted());
    }
    let a_wait = queued(
        coordinator
            .request_execution(ExecutionRequest::new(aid("a"), tid("a2"), [res("r2")]))
            .await
            .unwrap(),
    );
    let b_wait = queued(
        coordinator
            .request_execution(ExecutionRequest::new(aid("b"), tid("b2"), [res("r1")]))
            .await
            .unwrap(),
    );
    assert_eq!(coordinator.detect_deadlock().await, vec![aid("a"), aid("b")]);

    let mut resolutions = coordinator.resolve_deadlocks().await.unwrap();
    assert_eq!(resolutions.len(), 1);
    let resolution = resolutions.remove(0);
    let victim = resolution.victim.clone();
    assert_eq!(resolution.released.len(), 1);
    assert_eq!(resolution.requeued.len(), 1);
    assert!(coordinator.detect_deadlock().await.is_empty());

    let (survivor, survivor_tasks, survivor_wait, victim_wait) = if victim == aid("a") {
        (aid("b"), ["b1", "b2"], b_wait, a_wait)
    } else {
        (aid("a"), ["a1", "a2"], a_wait, b_wait)
    };

    // The survivor gets the preempted resource and finishes.
    coordinator
        .wait_for(survivor_wait, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    for task in survivor_tasks {
        coordinator
            .notify_completion(&survivor, &tid(task), &[])
            .await
            .unwrap();
    }

    // Then the victim gets both its interrupted task and its request back.
    let mut victim_tasks = Vec::new();
    for ticket in resolution.requeued.into_iter().chain([victim_wait]) {
        let grant = coordinator
            .wait_for(ticket, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        victim_tasks.push(grant.task_id);
    }
    for task in &victim_tasks {
        coordinator
            .notify_completion(&victim, task, &[])
            .await
            .unwrap();
    }

    assert!(coordinator.locks().await.is_empty());
    assert_eq!(coordinator.metrics().await.deadlocks_resolved, 1);
}

/// One agent of a wait-for ring: it holds its own resource and waits for
/// its neighbour's.
struct RingMember {
    agent: AgentId,
    holding: TaskId,
    waiting: TaskId,
    ticket: RequestTicket,
}

async fn build_ring(
    coordinator: &CollaborationCoordinator,
    prefix: &str,
    size: usize,
) -> Vec<RingMember> {
    let resource = |i: usize| res(&format!("{prefix}-r{}", i % size));
    for i in 0..size {
        assert!(coordinator
            .request_execution(ExecutionRequest::new(
                aid(&format!("{prefix}{i}")),
                tid(&format!("{prefix}{i}-hold")),
                [resource(i)],
            ))
            .await
            .unwrap()
            .is_granted());
    }
    let mut members = Vec::new();
    for i in 0..size {
        let agent = aid(&format!("{prefix}{i}"));
        let waiting = tid(&format!("{prefix}{i}-next"));
        let ticket = queued(
            coordinator
                .request_execution(ExecutionRequest::new(agent.clone(), waiting.clone(), [resource(i + 1)]))
                .await
                .unwrap(),
        );
        members.push(RingMember {
            agent,
            holding: tid(&format!("{prefix}{i}-hold")),
            waiting,
            ticket,
        });
    }
    members
}

/// Let every agent finish: each waits for its grant and then releases
/// everything it still holds. Victims hold nothing until their requeued
/// requests come back.
async fn drive_to_completion(
    coordinator: Arc<CollaborationCoordinator>,
    members: Vec<RingMember>,
    victims: &BTreeSet<AgentId>,
    requeued: Vec<RequestTicket>,
) {
    let mut handles = Vec::new();
    for member in members {
        let coordinator = coordinator.clone();
        let preempted = victims.contains(&member.agent);
        handles.push(tokio::spawn(async move {
            coordinator
                .wait_for(member.ticket, Some(Duration::from_secs(5)))
                .await
                .unwrap();
            coordinator
                .notify_completion(&member.agent, &member.waiting, &[])
                .await
                .unwrap();
            if !preempted {
                coordinator
                    .notify_completion(&member.agent, &member.holding, &[])
                    .await
                    .unwrap();
            }
        }));
    }
    for ticket in requeued {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            let agent = ticket.agent_id.clone();
            let grant = coordinator
                .wait_for(ticket, Some(Duration::from_secs(5)))
                .await
                .unwrap();
            coordinator
                .notify_completion(&agent, &grant.task_id, &[])
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

/// Test: deadlock liveness for a longer cycle
/// Given three agents waiting on each other in a ring
/// When deadlocks are resolved
/// Then exactly one victim is preempted and every request is eventually granted
#[tokio::test]
async fn test_three_agent_deadlock_resolved() {
    let coordinator = coordinator();
    let members = build_ring(&coordinator, "a", 3).await;
    assert_eq!(
        coordinator.detect_deadlock().await,
        vec![aid("a0"), aid("a1"), aid("a2")]
    );

    let resolutions = coordinator.resolve_deadlocks().await.unwrap();
    assert_eq!(resolutions.len(), 1);
    assert_eq!(resolutions[0].cycle.len(), 3);
    assert!(resolutions[0].cycle.contains(&resolutions[0].victim));
    assert!(coordinator.detect_deadlock().await.is_empty());

    let mut victims = BTreeSet::new();
    let mut requeued = Vec::new();
    for resolution in resolutions {
        victims.insert(resolution.victim);
        requeued.extend(resolution.requeued);
    }
    assert_eq!(requeued.len(), 1);

    drive_to_completion(coordinator.clone(), members, &victims, requeued).await;
    assert!(coordinator.locks().await.is_empty());
    assert!(coordinator.pending_requests().await.is_empty());
    assert_eq!(coordinator.metrics().await.deadlocks_resolved, 1);
}

/// Test: independent deadlocks
/// Given two disjoint wait-for rings of three and two agents
/// When deadlocks are resolved
/// Then each ring loses exactly one victim and everyone finishes
#[tokio::test]
async fn test_disjoint_deadlocks_get_one_victim_each() {
    let coordinator = coordinator();
    let mut members = build_ring(&coordinator, "x", 3).await;
    members.extend(build_ring(&coordinator, "y", 2).await);
    assert_eq!(coordinator.detect_deadlock().await.len(), 5);

    let resolutions = coordinator.resolve_deadlocks().await.unwrap();
    assert_eq!(resolutions.len(), 2);
    assert!(coordinator.detect_deadlock().await.is_empty());

    let mut victims = BTreeSet::new();
    let mut requeued = Vec::new();
    for resolution in resolutions {
        let ring = resolution.victim.as_str()[..1].to_string();
        assert!(resolution
            .cycle
            .iter()
            .all(|agent| agent.as_str().starts_with(&ring)));
        victims.insert(resolution.victim);
        requeued.extend(resolution.requeued);
    }
    let rings: BTreeSet<&str> = victims.iter().map(|v| &v.as_str()[..1]).collect();
    assert_eq!(rings, BTreeSet::from(["x", "y"]));

    drive_to_completion(coordinator.clone(), members, &victims, requeued).await;
    assert!(coordinator.locks().await.is_empty());
    assert!(coordinator.pending_requests().await.is_empty());
    assert_eq!(coordinator.metrics().await.deadlocks_resolved, 2);
}
