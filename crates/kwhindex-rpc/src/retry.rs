//! Backoff policies.
//!
//! Two shapes are used: exponential backoff for transport failures inside the
//! HTTP client, and linear backoff (200 ms, 400 ms, 600 ms) for block and
//! receipt lookups that come back null while the node catches up.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `initial * multiplier^(attempt-1)`, capped at `max_backoff`.
    Exponential { multiplier: f64 },
    /// `initial * attempt`, capped at `max_backoff`.
    Linear,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Number of delayed retries allowed.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff: Backoff::Exponential { multiplier: 2.0 },
        }
    }
}

impl RetryConfig {
    /// Linear policy: `attempts` tries, waiting `step * attempt` after each miss.
    pub fn linear(step: Duration, attempts: u32) -> Self {
        Self {
            max_retries: attempts,
            initial_backoff: step,
            max_backoff: step * attempts.max(1),
            backoff: Backoff::Linear,
        }
    }

    /// Lookup policy for null blocks and receipts: 3 attempts, 200 ms steps.
    pub fn lookup() -> Self {
        Self::linear(Duration::from_millis(200), 3)
    }
}

/// Stateless policy computing the delay for a given attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay after the `attempt`-th failure (1-based), or `None` once
    /// `max_retries` is exhausted.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let initial = self.config.initial_backoff;
        let delay = match self.config.backoff {
            Backoff::Linear => initial.saturating_mul(attempt),
            Backoff::Exponential { multiplier } => {
                let ms = initial.as_millis() as f64 * multiplier.powi(attempt as i32 - 1);
                Duration::from_millis(ms.min(u64::MAX as f64) as u64)
            }
        };
        Some(delay.min(self.config.max_backoff))
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_policy_is_linear() {
        let p = RetryPolicy::new(RetryConfig::lookup());
        assert_eq!(p.next_delay(1), Some(Duration::from_millis(200)));
        assert_eq!(p.next_delay(2), Some(Duration::from_millis(400)));
        assert_eq!(p.next_delay(3), Some(Duration::from_millis(600)));
        assert_eq!(p.next_delay(4), None);
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let p = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            backoff: Backoff::Exponential { multiplier: 2.0 },
        });
        assert_eq!(p.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(p.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(p.next_delay(3), Some(Duration::from_millis(400)));
        assert_eq!(p.next_delay(4), Some(Duration::from_millis(500)));
    }

    #[test]
    fn zero_attempt_has_no_delay() {
        let p = RetryPolicy::new(RetryConfig::default());
        assert!(p.next_delay(0).is_none());
    }
}
