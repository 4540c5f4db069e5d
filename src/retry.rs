//! Retry Policy
//!
//! Decides whether a failed attempt may run again and how long to wait
//! first. Delays are computed per retry index (0 for the first retry)
//! and then stretched by a random jitter factor.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::TaskError;

/// Predicate deciding whether a failure may be retried.
pub type RetryCondition = Arc<dyn Fn(&TaskError) -> bool + Send + Sync>;

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDelay {
    /// Retry immediately
    None,
    /// Same delay before every retry
    Constant(Duration),
    /// One entry per retry; the last entry repeats
    Schedule(Vec<Duration>),
    /// `factor * 2^retry_index`, optionally capped
    Exponential {
        factor: Duration,
        max: Option<Duration>,
    },
}

impl RetryDelay {
    /// Base delay before the retry at `retry_index`, without jitter.
    pub fn base_delay(&self, retry_index: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Constant(d) => *d,
            Self::Schedule(delays) => {
                let idx = (retry_index as usize).min(delays.len().saturating_sub(1));
                delays.get(idx).copied().unwrap_or(Duration::ZERO)
            }
            Self::Exponential { factor, max } => {
                let multiplier = 2u32.checked_pow(retry_index).unwrap_or(u32::MAX);
                let delay = factor.checked_mul(multiplier).unwrap_or(Duration::MAX);
                match max {
                    Some(max) => delay.min(*max),
                    None => delay,
                }
            }
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::None
    }
}

/// Retry budget, delay schedule and retry condition for a definition.
#[derive(Clone, Default)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: RetryDelay,
    /// Delay is drawn uniformly from `[d, d * (1 + jitter_factor)]`
    pub jitter_factor: f64,
    pub condition: Option<RetryCondition>,
}

impl RetryPolicy {
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: RetryDelay) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.max(0.0);
        self
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&TaskError) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Returns true if a retry should follow the given failure.
    ///
    /// `attempts` is the number of attempts already made.
    pub fn should_retry(&self, failure: &TaskError, attempts: u32) -> bool {
        if !failure.kind.is_retryable() || attempts > self.retries {
            return false;
        }
        match &self.condition {
            Some(condition) => condition(failure),
            None => true,
        }
    }

    /// Returns true if retries wait before running again.
    pub fn has_delay(&self) -> bool {
        !matches!(self.delay, RetryDelay::None)
    }

    /// Delay before the retry at `retry_index`, with jitter applied.
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        apply_jitter(self.delay.base_delay(retry_index), self.jitter_factor)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retries", &self.retries)
            .field("delay", &self.delay)
            .field("jitter_factor", &self.jitter_factor)
            .field("condition", &self.condition.is_some())
            .finish()
    }
}

/// Stretches `delay` by a random factor in `[1, 1 + jitter_factor]`.
pub fn apply_jitter(delay: Duration, jitter_factor: f64) -> Duration {
    if !jitter_factor.is_finite() || jitter_factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    let stretch: f64 = rand::thread_rng().gen_range(0.0..=jitter_factor);
    Duration::try_from_secs_f64(delay.as_secs_f64() * (1.0 + stretch)).unwrap_or(Duration::MAX)
}
