use std::time::Duration;

use rand::Rng;

use crate::config::RedeliveryPolicy;

/// Jitter spread applied around the computed delay.
const JITTER: f64 = 0.15;

impl RedeliveryPolicy {
    /// Whether another attempt is allowed after `redeliveries` retries.
    #[must_use]
    pub fn should_redeliver(&self, redeliveries: u32) -> bool {
        redeliveries < self.max_redeliveries
    }

    /// Delay before redelivery number `redelivery` (1-based).
    ///
    /// `min(initial * multiplier^(redelivery - 1), max)`, then scaled by a
    /// random factor in `[0.85, 1.15]` when jitter is on, still capped at
    /// the maximum.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for(&self, redelivery: u32) -> Duration {
        let exponent = redelivery.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max = self.max_delay_ms as f64;
        let base = (self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent)).min(max);
        let delay = if self.use_jitter {
            let factor = rand::rng().random_range((1.0 - JITTER)..=(1.0 + JITTER));
            (base * factor).min(max)
        } else {
            base
        };
        if delay.is_finite() && delay > 0.0 {
            Duration::from_millis(delay as u64)
        } else {
            Duration::ZERO
        }
    }
}
