//! Restart policy for supervised workers.
//!
//! A worker may be restarted at most `max_restarts` times within a rolling
//! `window`. Each restart waits for the delay given by the policy's
//! [`BackoffStrategy`]; once the budget is spent the worker is given up on.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backoff::BackoffStrategy;
use crate::util::duration_ms;

/// Default number of restarts allowed inside one window.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Default length of the rolling restart window.
pub const DEFAULT_RESTART_WINDOW_SECS: u64 = 600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    #[serde(rename = "window_ms", with = "duration_ms")]
    pub window: Duration,
    pub backoff: BackoffStrategy,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
            window: Duration::from_secs(DEFAULT_RESTART_WINDOW_SECS),
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RestartPolicy {
    pub fn new(max_restarts: u32, window: Duration, backoff: BackoffStrategy) -> Self {
        Self {
            max_restarts,
            window,
            backoff,
        }
    }

    /// A policy that never restarts.
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            ..Self::default()
        }
    }
}

/// Outcome of asking the tracker whether a failed worker may come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after `delay`; `attempt` counts restarts inside the window.
    Restart { attempt: u32, delay: Duration },
    /// The window budget is exhausted.
    GiveUp { restarts: u32 },
}

/// Rolling-window restart history of one worker.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use conductor::backoff::BackoffStrategy;
/// use conductor::orchestration::restart::{RestartDecision, RestartPolicy, RestartTracker};
/// use tokio::time::Instant;
///
/// let policy = RestartPolicy::new(1, Duration::from_secs(60), BackoffStrategy::fixed(Duration::from_secs(1)));
/// let mut tracker = RestartTracker::new();
/// let now = Instant::now();
///
/// assert!(matches!(tracker.decide(&policy, now), RestartDecision::Restart { attempt: 1, .. }));
/// tracker.record(now);
/// assert_eq!(tracker.decide(&policy, now), RestartDecision::GiveUp { restarts: 1 });
/// ```
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    history: VecDeque<Instant>,
    total: u32,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restarts recorded within `window` of `now`; older entries are pruned.
    pub fn restarts_within(&mut self, window: Duration, now: Instant) -> u32 {
        while let Some(&oldest) = self.history.front() {
            if now.saturating_duration_since(oldest) > window {
                self.history.pop_front();
            } else {
                break;
            }
        }
        self.history.len() as u32
    }

    pub fn decide(&mut self, policy: &RestartPolicy, now: Instant) -> RestartDecision {
        let recent = self.restarts_within(policy.window, now);
        if recent >= policy.max_restarts {
            return RestartDecision::GiveUp { restarts: recent };
        }
        let attempt = recent + 1;
        RestartDecision::Restart {
            attempt,
            delay: policy.backoff.delay_for(attempt),
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.history.push_back(now);
        self.total += 1;
    }

    /// Restarts over the whole lifetime of the worker.
    pub fn total(&self) -> u32 {
        self.total
    }
}
