//! Redelivery backoff for failed dispatches.

use std::time::Duration;

/// Exponential backoff between redeliveries of a failing record.
///
/// `delay(attempt) = initial_delay * multiplier^(attempt - 1)`, capped at
/// `max_delay`. Attempts are counted from 1.
///
/// # Default Values
///
/// - `initial_delay`: 100ms
/// - `multiplier`: 2.0
/// - `max_delay`: 10 seconds
#[derive(Debug, Clone, PartialEq)]
pub struct RedeliveryPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Growth factor per further failure.
    pub multiplier: f64,
    /// Upper bound on any delay.
    pub max_delay: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RedeliveryPolicy {
    /// Creates a new policy builder starting from the defaults.
    #[must_use]
    pub fn builder() -> RedeliveryPolicyBuilder {
        RedeliveryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// A policy that redelivers immediately. Useful in tests.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Calculates the delay before redelivering after the given failed attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;

        if !delay_ms.is_finite() || delay_ms >= max_ms {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms.max(0.0) as u64)
        }
    }
}

/// Builder for [`RedeliveryPolicy`].
#[derive(Debug, Clone)]
pub struct RedeliveryPolicyBuilder {
    policy: RedeliveryPolicy,
}

impl RedeliveryPolicyBuilder {
    /// Set the delay after the first failure.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Set the cap.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Build the [`RedeliveryPolicy`].
    #[must_use]
    pub fn build(self) -> RedeliveryPolicy {
        self.policy
    }
}
