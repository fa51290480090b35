//! Health checks for supervised workers.
//!
//! The `HealthMonitor` decides whether a worker is healthy from three
//! observations, checked in this order:
//! - the OS process has exited,
//! - no heartbeat arrived within the stale threshold,
//! - CPU or memory stayed above the configured limits for the whole
//!   sustained period.
//!
//! Usage numbers come from a [`UsageSampler`]. The default samples through
//! `sysinfo`; sampling runs on the blocking pool and is bounded by the
//! check timeout.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tokio::time::Instant;
use tracing::trace;

use crate::agent::AgentId;
use crate::util::{blocking_with_timeout, duration_ms, millis};
use crate::{Error, Result};

/// Default interval between two health checks of one worker.
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 5_000;

/// Default time without a heartbeat before a worker counts as stale.
pub const DEFAULT_STALE_HEARTBEAT_MS: u64 = 60_000;

/// Default upper bound on a single usage sample.
pub const DEFAULT_CHECK_TIMEOUT_MS: u64 = 2_000;

/// Default period a limit must be exceeded before it counts.
pub const DEFAULT_SUSTAINED_MS: u64 = 30_000;

/// CPU and memory ceilings for one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Percent of one core; values above 100 allow several cores.
    pub max_cpu_percent: Option<f32>,
    pub max_memory_mb: Option<u64>,
    #[serde(rename = "sustained_ms", with = "duration_ms")]
    pub sustained_for: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: None,
            max_memory_mb: None,
            sustained_for: Duration::from_millis(DEFAULT_SUSTAINED_MS),
        }
    }
}

impl ResourceLimits {
    pub fn is_unbounded(&self) -> bool {
        self.max_cpu_percent.is_none() && self.max_memory_mb.is_none()
    }

    pub fn exceeded_by(&self, usage: &ResourceUsage) -> bool {
        let cpu = self
            .max_cpu_percent
            .is_some_and(|max| usage.cpu_percent > max);
        let memory = self.max_memory_mb.is_some_and(|max| usage.memory_mb > max);
        cpu || memory
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(rename = "check_interval_ms", with = "duration_ms")]
    pub check_interval: Duration,
    #[serde(rename = "stale_heartbeat_ms", with = "duration_ms")]
    pub stale_heartbeat_after: Duration,
    #[serde(rename = "check_timeout_ms", with = "duration_ms")]
    pub check_timeout: Duration,
    pub limits: ResourceLimits,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(DEFAULT_CHECK_INTERVAL_MS),
            stale_heartbeat_after: Duration::from_millis(DEFAULT_STALE_HEARTBEAT_MS),
            check_timeout: Duration::from_millis(DEFAULT_CHECK_TIMEOUT_MS),
            limits: ResourceLimits::default(),
        }
    }
}

impl HealthConfig {
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_stale_heartbeat(mut self, threshold: Duration) -> Self {
        self.stale_heartbeat_after = threshold;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// One usage sample of a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_mb: u64,
    pub sampled_at: DateTime<Utc>,
}

/// Reads CPU and memory usage of a process.
pub trait UsageSampler: Send + Sync {
    /// `None` when the process is gone or cannot be inspected.
    fn sample(&self, pid: u32) -> Option<ResourceUsage>;
}

/// `sysinfo`-backed sampler. CPU percentages need two refreshes to be
/// meaningful, so the first sample of a process reports 0%.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageSampler for SysinfoSampler {
    fn sample(&self, pid: u32) -> Option<ResourceUsage> {
        let mut system = self.system.lock().ok()?;
        let pid = Pid::from_u32(pid);
        if !system.refresh_process(pid) {
            return None;
        }
        let process = system.process(pid)?;
        Some(ResourceUsage {
            cpu_percent: process.cpu_usage(),
            memory_mb: process.memory() / (1024 * 1024),
            sampled_at: Utc::now(),
        })
    }
}

/// Why a worker failed its health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum UnhealthyReason {
    Exited { code: Option<i32> },
    StaleHeartbeat { silent_for_ms: u64 },
    ResourceLimit { cpu_percent: f32, memory_mb: u64 },
    CheckTimedOut { timeout_ms: u64 },
    SpawnFailed { error: String },
}

impl std::fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnhealthyReason::Exited { code: Some(code) } => write!(f, "exited with code {}", code),
            UnhealthyReason::Exited { code: None } => write!(f, "terminated by signal"),
            UnhealthyReason::StaleHeartbeat { silent_for_ms } => {
                write!(f, "no heartbeat for {}ms", silent_for_ms)
            }
            UnhealthyReason::ResourceLimit {
                cpu_percent,
                memory_mb,
            } => write!(
                f,
                "over resource limits (cpu {:.1}%, memory {}MB)",
                cpu_percent, memory_mb
            ),
            UnhealthyReason::CheckTimedOut { timeout_ms } => {
                write!(f, "health check timed out after {}ms", timeout_ms)
            }
            UnhealthyReason::SpawnFailed { error } => write!(f, "restart failed: {}", error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthVerdict {
    Healthy,
    Unhealthy(UnhealthyReason),
}

impl HealthVerdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthVerdict::Healthy)
    }
}

/// Tracks how long a worker has been continuously over its limits.
#[derive(Debug, Clone, Default)]
pub struct LimitTracker {
    over_since: Option<Instant>,
}

impl LimitTracker {
    /// Record one observation; true once the limit has been exceeded for at
    /// least `sustained_for` without interruption.
    pub fn observe(&mut self, exceeded: bool, now: Instant, sustained_for: Duration) -> bool {
        if !exceeded {
            self.over_since = None;
            return false;
        }
        let since = *self.over_since.get_or_insert(now);
        now.saturating_duration_since(since) >= sustained_for
    }

    pub fn reset(&mut self) {
        self.over_since = None;
    }
}

/// Everything the monitor looks at for one check.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    /// `Some(code)` once the process has exited.
    pub exit: Option<Option<i32>>,
    pub last_heartbeat: Instant,
    pub usage: Option<ResourceUsage>,
}

pub struct HealthMonitor {
    config: HealthConfig,
    sampler: Arc<dyn UsageSampler>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self::with_sampler(config, Arc::new(SysinfoSampler::new()))
    }

    pub fn with_sampler(config: HealthConfig, sampler: Arc<dyn UsageSampler>) -> Self {
        Self { config, sampler }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Sample usage off the async runtime, bounded by the check timeout.
    pub async fn sample(&self, agent: &AgentId, pid: u32) -> Result<Option<ResourceUsage>> {
        let sampler = Arc::clone(&self.sampler);
        let timeout = self.config.check_timeout;
        blocking_with_timeout(timeout, move || Ok(sampler.sample(pid)))
            .await
            .map_err(|e| match e {
                Error::Timeout(_) => Error::HealthCheckTimeout {
                    agent: agent.clone(),
                    timeout,
                },
                other => other,
            })
    }

    /// How long the worker has been silent, if that exceeds the threshold.
    pub fn heartbeat_stale(&self, last_heartbeat: Instant, now: Instant) -> Option<Duration> {
        let silent_for = now.saturating_duration_since(last_heartbeat);
        (silent_for > self.config.stale_heartbeat_after).then_some(silent_for)
    }

    pub fn assess(&self, probe: &HealthProbe, limits: &mut LimitTracker, now: Instant) -> HealthVerdict {
        if let Some(code) = probe.exit {
            return HealthVerdict::Unhealthy(UnhealthyReason::Exited { code });
        }

        if let Some(silent_for) = self.heartbeat_stale(probe.last_heartbeat, now) {
            return HealthVerdict::Unhealthy(UnhealthyReason::StaleHeartbeat {
                silent_for_ms: millis(silent_for),
            });
        }

        if let Some(usage) = &probe.usage {
            let exceeded = self.config.limits.exceeded_by(usage);
            if limits.observe(exceeded, now, self.config.limits.sustained_for) {
                return HealthVerdict::Unhealthy(UnhealthyReason::ResourceLimit {
                    cpu_percent: usage.cpu_percent,
                    memory_mb: usage.memory_mb,
                });
            }
        }

        trace!("health check passed");
        HealthVerdict::Healthy
    }
}
