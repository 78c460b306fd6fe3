use std::time::Duration;

use crate::config::ClientConfig;

/// Capped doubling backoff for the sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_delay_ms),
            max: Duration::from_millis(max_delay_ms.max(base_delay_ms)),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.retry_base_delay_ms, config.retry_max_delay_ms)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `attempt` (zero based).
    ///
    /// A server `retry_after_ms` hint wins when it asks for a longer wait,
    /// but never past the cap.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after_ms: Option<u64>) -> Duration {
        let doubled = self.base.saturating_mul(1 << attempt.min(16));
        let hinted = Duration::from_millis(retry_after_ms.unwrap_or(0));
        doubled.max(hinted).min(self.max)
    }

    pub fn backoff(self) -> Backoff {
        Backoff {
            policy: self,
            attempt: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// Failure streak tracked across consecutive sync attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Failures since the last success.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record one failure and return how long to wait before retrying.
    pub fn next_delay(&mut self, retry_after_ms: Option<u64>) -> Duration {
        let delay = self.policy.delay_for_attempt(self.attempt, retry_after_ms);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
