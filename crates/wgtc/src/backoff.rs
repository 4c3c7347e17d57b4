use crate::config::ReconnectPolicy;
use rand::Rng;
use std::time::Duration;

/// Reconnect delays: `initial * factor^attempt`, capped at `max`, with
/// ±25% jitter.
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff that starts at `policy.initial`.
    #[must_use]
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Un-jittered delay for `attempt` (0-based).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(64) as i32;
        let scaled = self.policy.initial.as_secs_f64() * self.policy.factor.powi(exp);
        if scaled.is_finite() && scaled < self.policy.max.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.policy.max
        }
    }

    /// Delay to wait before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        base.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Back to the initial delay, after a session that got established.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
