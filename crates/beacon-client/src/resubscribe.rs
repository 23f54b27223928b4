//! Resubscribe strategies for ended watch streams
//!
//! When the store ends a discovery watch, the default is to stay stopped and
//! leave recovery to the caller. A `ResubscribePolicy` lets a caller opt into
//! automatic re-listing and re-watching instead.

use std::time::Duration;

/// Decides whether and when a stopped discovery subscribes again.
pub trait ResubscribePolicy: Send + Sync + 'static {
    /// Delay before resubscribe attempt `attempt` (0-based), or `None` to give up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Never resubscribe; the discovery view stays stale until recreated.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverResubscribe;

impl ResubscribePolicy for NeverResubscribe {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Retry at a constant interval
#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    pub delay: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }
}

impl ResubscribePolicy for FixedDelay {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt >= max => None,
            _ => Some(self.delay),
        }
    }
}

/// Retry with a delay multiplied on every attempt, capped at `max`
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2,
            max_attempts: None,
        }
    }
}

impl ResubscribePolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts
            && attempt >= max
        {
            return None;
        }
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}
