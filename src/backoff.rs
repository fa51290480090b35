//! Backoff strategies expressed as data.
//!
//! Shared by the worker restart policy and transport connect retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::duration_ms;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed {
        #[serde(rename = "delay_ms", with = "duration_ms")]
        delay: Duration,
    },
    Linear {
        #[serde(rename = "initial_ms", with = "duration_ms")]
        initial: Duration,
        #[serde(rename = "step_ms", with = "duration_ms")]
        step: Duration,
        #[serde(rename = "max_ms", with = "duration_ms")]
        max: Duration,
    },
    Exponential {
        #[serde(rename = "initial_ms", with = "duration_ms")]
        initial: Duration,
        factor: u32,
        #[serde(rename = "max_ms", with = "duration_ms")]
        max: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            initial: Duration::from_millis(500),
            factor: 2,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    pub fn fixed(delay: Duration) -> Self {
        BackoffStrategy::Fixed { delay }
    }

    pub fn linear(initial: Duration, step: Duration, max: Duration) -> Self {
        BackoffStrategy::Linear { initial, step, max }
    }

    pub fn exponential(initial: Duration, factor: u32, max: Duration) -> Self {
        BackoffStrategy::Exponential {
            initial,
            factor,
            max,
        }
    }

    /// Delay before the given attempt. Attempts are numbered from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1);
        match *self {
            BackoffStrategy::Fixed { delay } => delay,
            BackoffStrategy::Linear { initial, step, max } => {
                initial.saturating_add(step.saturating_mul(steps)).min(max)
            }
            BackoffStrategy::Exponential {
                initial,
                factor,
                max,
            } => match factor.checked_pow(steps) {
                Some(multiplier) => initial.saturating_mul(multiplier).min(max),
                None => max,
            },
        }
    }

    /// Upper bound on any single delay this strategy produces.
    pub fn ceiling(&self) -> Duration {
        match *self {
            BackoffStrategy::Fixed { delay } => delay,
            BackoffStrategy::Linear { max, .. } | BackoffStrategy::Exponential { max, .. } => max,
        }
    }
}
