//! Reconnection scheduling after fatal registration failures

use crate::config::TimerConfig;
use std::time::Duration;

/// Backoff parameters for reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures after which reconnecting stops
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_timers(&TimerConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_timers(timers: &TimerConfig) -> Self {
        Self {
            initial_delay: Duration::from_secs(timers.reconnect_initial_secs),
            max_delay: Duration::from_secs(timers.reconnect_max_secs),
            max_attempts: timers.reconnect_max_attempts,
        }
    }

    /// Delay before the retry that follows failure number `failure` (1-based)
    pub fn delay_for(&self, failure: u32) -> Duration {
        let exponent = failure.saturating_sub(1).min(16);
        let delay = self.initial_delay.saturating_mul(1u32 << exponent);
        std::cmp::min(delay, self.max_delay)
    }
}

/// What to do about a fatal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Arm the reconnect timer
    Schedule { attempt: u32, delay: Duration },
    /// A reconnect is already armed; nothing to do
    AlreadyPending,
    /// Give up until the user starts again
    Exhausted,
}

/// Counts consecutive fatal failures and keeps at most one reconnect pending
#[derive(Debug, Clone)]
pub struct ReconnectScheduler {
    policy: ReconnectPolicy,
    failures: u32,
    pending: bool,
}

impl ReconnectScheduler {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            pending: false,
        }
    }

    pub fn on_failure(&mut self) -> ReconnectDecision {
        if self.pending {
            return ReconnectDecision::AlreadyPending;
        }

        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts {
            return ReconnectDecision::Exhausted;
        }

        self.pending = true;
        ReconnectDecision::Schedule {
            attempt: self.failures,
            delay: self.policy.delay_for(self.failures),
        }
    }

    /// The reconnect timer fired or was cleared by a new start
    pub fn clear_pending(&mut self) {
        self.pending = false;
    }

    /// Forget past failures, after a 2xx or a user initiated start
    pub fn reset(&mut self) {
        self.failures = 0;
        self.pending = false;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
