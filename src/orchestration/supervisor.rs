//! Process supervisor: one OS process per worker.
//!
//! Lifecycle of a supervised worker:
//!
//! ```text
//! Starting -> Running -> Unhealthy -> Restarting -> Starting ...
//!                     \-> Stopping -> Stopped
//! Unhealthy with the restart budget spent -> Crashed
//! ```
//!
//! A worker is Running once its first heartbeat arrives. Health checks run
//! on a fixed interval in one monitor task per worker. Before a worker is
//! restarted or given up on, every lock it holds is released through the
//! [`LockReleaser`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentId, WorkerCommand};
use crate::events::{EventKind, EventSink};
use crate::orchestration::coordinator::{ReleaseCause, ResourceLock};
use crate::orchestration::health::{
    HealthMonitor, HealthProbe, HealthVerdict, LimitTracker, ResourceUsage, UnhealthyReason,
};
use crate::orchestration::restart::{RestartDecision, RestartPolicy, RestartTracker};
use crate::util::millis;
use crate::{Error, Result};

/// Grace period between SIGTERM and SIGKILL when stopping a worker.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Consecutive timed-out usage samples before a worker counts as unhealthy.
const MAX_CHECK_TIMEOUTS: u32 = 3;

/// Environment variable carrying the worker's identity.
pub const AGENT_ID_ENV: &str = "CONDUCTOR_AGENT_ID";

/// Environment variable carrying the orchestrator socket path.
pub const SOCKET_ENV: &str = "CONDUCTOR_SOCKET";

/// Releases a worker's locks before the supervisor touches its process.
pub trait LockReleaser: Send + Sync {
    fn release_agent<'a>(
        &'a self,
        agent: &'a AgentId,
        cause: ReleaseCause,
    ) -> BoxFuture<'a, Vec<ResourceLock>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum WorkerStatus {
    Starting,
    Running,
    Unhealthy { reason: UnhealthyReason },
    Restarting { attempt: u32 },
    Stopping,
    Stopped,
    Crashed { reason: String },
}

impl WorkerStatus {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Unhealthy { .. } => "unhealthy",
            WorkerStatus::Restarting { .. } => "restarting",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Crashed { .. } => "crashed",
        }
    }

    /// Stopped or crashed; the supervisor no longer looks after it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerStatus::Stopped | WorkerStatus::Crashed { .. })
    }

    fn is_supervised(&self) -> bool {
        !self.is_terminal() && *self != WorkerStatus::Stopping
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Unhealthy { reason } => write!(f, "unhealthy ({})", reason),
            WorkerStatus::Restarting { attempt } => write!(f, "restarting (attempt {})", attempt),
            WorkerStatus::Crashed { reason } => write!(f, "crashed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// How to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub agent_id: AgentId,
    pub command: WorkerCommand,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub socket_path: Option<PathBuf>,
}

impl WorkerSpec {
    pub fn new(agent_id: AgentId, command: WorkerCommand) -> Self {
        Self {
            agent_id,
            command,
            working_dir: None,
            env: BTreeMap::new(),
            socket_path: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }
}

/// Point-in-time view of a supervised worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProcess {
    pub agent_id: AgentId,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub usage: Option<ResourceUsage>,
    pub started_at: DateTime<Utc>,
}

/// What one supervision round did to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisionReport {
    Healthy {
        agent: AgentId,
    },
    Restarted {
        agent: AgentId,
        attempt: u32,
        reason: UnhealthyReason,
    },
    Crashed {
        agent: AgentId,
        reason: String,
    },
    /// The worker is stopping or already terminal.
    Inactive {
        agent: AgentId,
    },
}

impl SupervisionReport {
    pub fn agent(&self) -> &AgentId {
        match self {
            SupervisionReport::Healthy { agent }
            | SupervisionReport::Restarted { agent, .. }
            | SupervisionReport::Crashed { agent, .. }
            | SupervisionReport::Inactive { agent } => agent,
        }
    }

    fn ends_supervision(&self) -> bool {
        matches!(
            self,
            SupervisionReport::Crashed { .. } | SupervisionReport::Inactive { .. }
        )
    }
}

struct ManagedWorker {
    spec: WorkerSpec,
    child: Option<Child>,
    pid: Option<u32>,
    status: WorkerStatus,
    last_beat: Instant,
    last_heartbeat_at: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    restarts: RestartTracker,
    limits: LimitTracker,
    usage: Option<ResourceUsage>,
    check_timeouts: u32,
    cancel: CancellationToken,
}

impl ManagedWorker {
    fn view(&self) -> WorkerProcess {
        WorkerProcess {
            agent_id: self.spec.agent_id.clone(),
            pid: self.pid,
            status: self.status.clone(),
            last_heartbeat: self.last_heartbeat_at,
            restart_count: self.restarts.total(),
            usage: self.usage.clone(),
            started_at: self.started_at,
        }
    }

    fn attach(&mut self, child: Child) {
        self.pid = child.id();
        self.child = Some(child);
        self.status = WorkerStatus::Starting;
        self.last_beat = Instant::now();
        self.started_at = Utc::now();
        self.limits.reset();
        self.check_timeouts = 0;
        self.usage = None;
    }

    /// `Some(code)` if the process has exited (or was never running).
    fn exit_status(&mut self) -> Option<Option<i32>> {
        match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(status.code()),
                Ok(None) => None,
                Err(e) => {
                    warn!(agent = %self.spec.agent_id, error = %e, "failed to poll worker process");
                    None
                }
            },
            None => Some(None),
        }
    }

    async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!(agent = %self.spec.agent_id, error = %e, "kill on exited worker");
            }
        }
        self.pid = None;
    }
}

pub struct Supervisor {
    workers: RwLock<HashMap<AgentId, Arc<Mutex<ManagedWorker>>>>,
    max_workers: usize,
    monitor: HealthMonitor,
    policy: RestartPolicy,
    releaser: Option<Arc<dyn LockReleaser>>,
    events: EventSink,
    stop_grace: Duration,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        max_workers: usize,
        monitor: HealthMonitor,
        policy: RestartPolicy,
        events: EventSink,
    ) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            max_workers,
            monitor,
            policy,
            releaser: None,
            events,
            stop_grace: DEFAULT_STOP_GRACE,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_releaser(mut self, releaser: Arc<dyn LockReleaser>) -> Self {
        self.releaser = Some(releaser);
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Launch a worker process. Fails when the agent already has a live
    /// worker or the pool is at capacity.
    pub async fn start(&self, spec: WorkerSpec) -> Result<WorkerProcess> {
        let mut workers = self.workers.write().await;

        let mut active = 0;
        for (agent, worker) in workers.iter() {
            let worker = worker.lock().await;
            if worker.status.is_terminal() {
                continue;
            }
            if agent == &spec.agent_id {
                return Err(Error::AgentExists(spec.agent_id.clone()));
            }
            active += 1;
        }
        if active >= self.max_workers {
            return Err(Error::AgentPoolFull {
                max: self.max_workers,
            });
        }

        let child = spawn_process(&spec)?;
        let pid = child.id();
        let agent = spec.agent_id.clone();
        let mut worker = ManagedWorker {
            spec,
            child: None,
            pid: None,
            status: WorkerStatus::Starting,
            last_beat: Instant::now(),
            last_heartbeat_at: None,
            started_at: Utc::now(),
            restarts: RestartTracker::new(),
            limits: LimitTracker::default(),
            usage: None,
            check_timeouts: 0,
            cancel: self.cancel.child_token(),
        };
        worker.attach(child);
        let view = worker.view();
        workers.insert(agent.clone(), Arc::new(Mutex::new(worker)));

        info!(%agent, ?pid, "worker started");
        self.events.agent(&agent, EventKind::WorkerStarted { pid });
        Ok(view)
    }

    pub async fn record_heartbeat(&self, agent: &AgentId) -> Result<()> {
        let worker = self.worker(agent).await?;
        let mut worker = worker.lock().await;
        worker.last_beat = Instant::now();
        worker.last_heartbeat_at = Some(Utc::now());
        if worker.status == WorkerStatus::Starting {
            worker.status = WorkerStatus::Running;
            debug!(%agent, "worker running");
            self.events.agent(agent, EventKind::WorkerHealthy);
        }
        Ok(())
    }

    /// Run one health check. `None` when the worker is no longer
    /// supervised.
    pub async fn check(&self, agent: &AgentId) -> Result<Option<HealthVerdict>> {
        let worker = self.worker(agent).await?;

        let (exit, pid) = {
            let mut worker = worker.lock().await;
            if !worker.status.is_supervised() {
                return Ok(None);
            }
            (worker.exit_status(), worker.pid)
        };

        // Sample without holding the worker lock.
        let mut timed_out = false;
        let usage = match (exit, pid) {
            (None, Some(pid)) => match self.monitor.sample(agent, pid).await {
                Ok(usage) => usage,
                Err(Error::HealthCheckTimeout { timeout, .. }) => {
                    warn!(%agent, timeout_ms = millis(timeout), "usage sample timed out");
                    timed_out = true;
                    None
                }
                Err(e) => return Err(e),
            },
            _ => None,
        };

        let mut worker = worker.lock().await;
        if !worker.status.is_supervised() {
            return Ok(None);
        }
        if usage.is_some() {
            worker.usage = usage.clone();
        }
        worker.check_timeouts = if timed_out {
            worker.check_timeouts + 1
        } else {
            0
        };

        let probe = HealthProbe {
            exit,
            last_heartbeat: worker.last_beat,
            usage,
        };
        let mut verdict = self.monitor.assess(&probe, &mut worker.limits, Instant::now());
        if verdict.is_healthy() && worker.check_timeouts >= MAX_CHECK_TIMEOUTS {
            verdict = HealthVerdict::Unhealthy(UnhealthyReason::CheckTimedOut {
                timeout_ms: millis(self.monitor.config().check_timeout),
            });
        }

        if let HealthVerdict::Unhealthy(reason) = &verdict {
            warn!(%agent, %reason, "worker unhealthy");
            worker.status = WorkerStatus::Unhealthy {
                reason: reason.clone(),
            };
            self.events.agent(
                agent,
                EventKind::WorkerUnhealthy {
                    reason: reason.to_string(),
                },
            );
        }
        Ok(Some(verdict))
    }

    /// Check a worker and restart it (or give up on it) if unhealthy.
    pub async fn check_and_recover(&self, agent: &AgentId) -> Result<SupervisionReport> {
        match self.check(agent).await? {
            None => Ok(SupervisionReport::Inactive {
                agent: agent.clone(),
            }),
            Some(HealthVerdict::Healthy) => Ok(SupervisionReport::Healthy {
                agent: agent.clone(),
            }),
            Some(HealthVerdict::Unhealthy(reason)) => match self.recover(agent, reason).await {
                Err(Error::RestartLimitExceeded { .. }) => {
                    let reason = self
                        .get(agent)
                        .await
                        .and_then(|w| match w.status {
                            WorkerStatus::Crashed { reason } => Some(reason),
                            _ => None,
                        })
                        .unwrap_or_default();
                    Ok(SupervisionReport::Crashed {
                        agent: agent.clone(),
                        reason,
                    })
                }
                other => other,
            },
        }
    }

    /// Restart an unhealthy worker under the restart policy. Locks are
    /// released first. Returns [`Error::RestartLimitExceeded`] once the
    /// worker is given up on.
    pub async fn recover(&self, agent: &AgentId, reason: UnhealthyReason) -> Result<SupervisionReport> {
        let worker = self.worker(agent).await?;

        let decision = {
            let mut worker = worker.lock().await;
            if !worker.status.is_supervised() {
                return Ok(SupervisionReport::Inactive {
                    agent: agent.clone(),
                });
            }
            worker.restarts.decide(&self.policy, Instant::now())
        };

        let cause = match decision {
            RestartDecision::Restart { .. } => ReleaseCause::Restart,
            RestartDecision::GiveUp { .. } => ReleaseCause::Failed,
        };
        if let Some(releaser) = &self.releaser {
            let released = releaser.release_agent(agent, cause).await;
            if !released.is_empty() {
                info!(%agent, count = released.len(), "released locks before recovery");
            }
        }

        match decision {
            RestartDecision::GiveUp { restarts } => {
                let mut worker = worker.lock().await;
                worker.kill().await;
                worker.cancel.cancel();
                let message = format!("{} after {} restarts", reason, restarts);
                worker.status = WorkerStatus::Crashed {
                    reason: message.clone(),
                };
                error!(%agent, restarts, "worker crashed, restart limit exceeded");
                self.events.agent(
                    agent,
                    EventKind::WorkerCrashed {
                        restarts,
                        reason: message,
                    },
                );
                Err(Error::RestartLimitExceeded {
                    agent: agent.clone(),
                    restarts,
                    window: self.policy.window,
                })
            }
            RestartDecision::Restart { attempt, delay } => {
                {
                    let mut worker = worker.lock().await;
                    worker.kill().await;
                    worker.restarts.record(Instant::now());
                    worker.status = WorkerStatus::Restarting { attempt };
                }
                info!(%agent, attempt, delay_ms = millis(delay), "restarting worker");
                self.events.agent(
                    agent,
                    EventKind::WorkerRestarting {
                        attempt,
                        delay_ms: millis(delay),
                    },
                );

                tokio::time::sleep(delay).await;

                let mut worker = worker.lock().await;
                if !worker.status.is_supervised() {
                    return Ok(SupervisionReport::Inactive {
                        agent: agent.clone(),
                    });
                }
                match spawn_process(&worker.spec) {
                    Ok(child) => {
                        worker.attach(child);
                        self.events
                            .agent(agent, EventKind::WorkerStarted { pid: worker.pid });
                        Ok(SupervisionReport::Restarted {
                            agent: agent.clone(),
                            attempt,
                            reason,
                        })
                    }
                    Err(e) => {
                        warn!(%agent, error = %e, "restart failed");
                        worker.status = WorkerStatus::Unhealthy {
                            reason: UnhealthyReason::SpawnFailed {
                                error: e.to_string(),
                            },
                        };
                        Err(e)
                    }
                }
            }
        }
    }

    /// Stop a worker: SIGTERM, then kill after the grace period.
    pub async fn stop(&self, agent: &AgentId) -> Result<()> {
        let worker = self.worker(agent).await?;
        {
            let mut worker = worker.lock().await;
            if worker.status.is_terminal() {
                return Ok(());
            }
            worker.cancel.cancel();
            worker.status = WorkerStatus::Stopping;
        }

        if let Some(releaser) = &self.releaser {
            releaser.release_agent(agent, ReleaseCause::Stopped).await;
        }

        let mut worker = worker.lock().await;
        if let Some(mut child) = worker.child.take() {
            terminate(agent, &mut child, self.stop_grace).await;
        }
        worker.pid = None;
        worker.status = WorkerStatus::Stopped;
        info!(%agent, "worker stopped");
        self.events.agent(agent, EventKind::WorkerStopped);
        Ok(())
    }

    pub async fn stop_all(&self) {
        let agents: Vec<AgentId> = self.workers.read().await.keys().cloned().collect();
        for agent in agents {
            if let Err(e) = self.stop(&agent).await {
                warn!(%agent, error = %e, "failed to stop worker");
            }
        }
        self.cancel.cancel();
    }

    /// Stop (if needed) and forget a worker.
    pub async fn remove(&self, agent: &AgentId) -> Result<WorkerProcess> {
        self.stop(agent).await?;
        let worker = self
            .workers
            .write()
            .await
            .remove(agent)
            .ok_or_else(|| Error::AgentNotFound(agent.clone()))?;
        let view = worker.lock().await.view();
        Ok(view)
    }

    pub async fn get(&self, agent: &AgentId) -> Option<WorkerProcess> {
        let worker = self.workers.read().await.get(agent).cloned()?;
        let view = worker.lock().await.view();
        Some(view)
    }

    /// Views of all workers, sorted by agent.
    pub async fn snapshot(&self) -> Vec<WorkerProcess> {
        let workers: Vec<Arc<Mutex<ManagedWorker>>> =
            self.workers.read().await.values().cloned().collect();
        let mut views = Vec::with_capacity(workers.len());
        for worker in workers {
            views.push(worker.lock().await.view());
        }
        views.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        views
    }

    pub async fn active_count(&self) -> usize {
        self.snapshot()
            .await
            .iter()
            .filter(|w| !w.status.is_terminal())
            .count()
    }

    /// Spawn the monitor task of one worker. It checks on the configured
    /// interval and reports every round that was not plainly healthy. The
    /// task ends when the worker stops or crashes.
    pub async fn supervise(
        self: &Arc<Self>,
        agent: &AgentId,
        reports: mpsc::UnboundedSender<SupervisionReport>,
    ) -> Result<()> {
        let cancel = self.worker(agent).await?.lock().await.cancel.clone();
        let supervisor = Arc::clone(self);
        let agent = agent.clone();
        let period = self.monitor.config().check_interval;

        debug!(%agent, period_ms = millis(period), "supervising worker");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(%agent, "monitor cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        match supervisor.check_and_recover(&agent).await {
                            Ok(SupervisionReport::Healthy { .. }) => {}
                            Ok(report) => {
                                let done = report.ends_supervision();
                                if reports.send(report).is_err() {
                                    debug!(%agent, "report channel closed");
                                    break;
                                }
                                if done {
                                    break;
                                }
                            }
                            Err(e) if e.is_transient() => {
                                warn!(%agent, error = %e, "supervision round failed, retrying next round");
                            }
                            Err(e) => {
                                error!(%agent, error = %e, "supervision failed, monitor stopped");
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn worker(&self, agent: &AgentId) -> Result<Arc<Mutex<ManagedWorker>>> {
        self.workers
            .read()
            .await
            .get(agent)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(agent.clone()))
    }
}

fn spawn_process(spec: &WorkerSpec) -> Result<Child> {
    let binary = spec.command.resolve(&spec.agent_id)?;
    let mut cmd = Command::new(binary);
    cmd.args(spec.command.args())
        .env(AGENT_ID_ENV, spec.agent_id.as_str())
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(socket) = &spec.socket_path {
        cmd.env(SOCKET_ENV, socket);
    }
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }
    cmd.spawn().map_err(|e| Error::ProcessCreationFailed {
        agent: spec.agent_id.clone(),
        reason: e.to_string(),
    })
}

async fn terminate(agent: &AgentId, child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(%agent, error = %e, "SIGTERM failed");
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(%agent, grace_ms = millis(grace), "worker ignored SIGTERM, killing");
        if let Err(e) = child.kill().await {
            warn!(%agent, error = %e, "failed to kill worker");
        }
    }
}
