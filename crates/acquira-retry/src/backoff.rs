use std::time::Duration;

use rand::Rng;

use acquira_core::constants::{
    RETRY_INITIAL_DELAY_MS, RETRY_JITTER_MAX, RETRY_JITTER_MIN, RETRY_MAX_ATTEMPTS,
    RETRY_MAX_DELAY_MS, RETRY_MULTIPLIER,
};

/// Exponential backoff: `delay(n) = min(initial * multiplier^(n-1), max)`,
/// optionally stretched by a uniform jitter factor.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: RETRY_INITIAL_DELAY_MS,
            multiplier: RETRY_MULTIPLIER,
            max_delay_ms: RETRY_MAX_DELAY_MS,
            max_attempts: RETRY_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic delay before attempt `n` (1-based; n = 1 is the first
    /// retry after the initial failure).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exp as i32);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// `delay(n)` multiplied by a uniform factor in [0.8, 1.2].
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt).as_millis() as f64;
        let factor = rand::thread_rng().gen_range(RETRY_JITTER_MIN..=RETRY_JITTER_MAX);
        Duration::from_millis((base * factor) as u64)
    }

    pub fn attempts_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_are_monotonic_and_capped() {
        let policy = BackoffPolicy::default();
        let mut prev = Duration::ZERO;
        for n in 1..=12 {
            let d = policy.delay(n);
            assert!(d >= prev, "delay({n}) must not shrink");
            assert!(d <= Duration::from_millis(policy.max_delay_ms));
            prev = d;
        }
    }

    #[test]
    fn default_schedule_matches_contract() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(6), Duration::from_secs(32));
        assert_eq!(policy.delay(7), Duration::from_secs(60)); // capped
        assert_eq!(policy.delay(40), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_inside_the_band() {
        let policy = BackoffPolicy::default();
        for _ in 0..200 {
            let jittered = policy.delay_with_jitter(3).as_millis() as f64;
            let base = policy.delay(3).as_millis() as f64;
            assert!(jittered >= base * 0.8 - 1.0);
            assert!(jittered <= base * 1.2 + 1.0);
        }
    }

    #[test]
    fn exhaustion_after_max_attempts() {
        let policy = BackoffPolicy::default();
        assert!(!policy.attempts_exhausted(4));
        assert!(policy.attempts_exhausted(5));
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(policy.max_delay_ms));
    }
}
