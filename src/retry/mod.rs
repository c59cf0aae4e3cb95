mod policy;

pub use policy::ReconnectPolicy;

use std::time::Duration;

/// Running backoff state for one reconnecting connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current = policy.base_delay;
        Self {
            policy,
            current,
            failures: 0,
        }
    }

    /// Delay to wait before the next attempt, jitter included.
    ///
    /// Advances the schedule, so consecutive calls without a `reset` grow
    /// until `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.with_jitter(self.current);
        self.current = self.policy.grow(self.current);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Back to the base delay. Called on every successful open.
    pub fn reset(&mut self) {
        self.current = self.policy.base_delay;
        self.failures = 0;
    }

    /// Un-jittered delay the next call to `next_delay` starts from.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive attempts since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}
