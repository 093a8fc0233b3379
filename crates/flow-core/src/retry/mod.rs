//! Retry calculator: pure functions, no persistence.

use flow_db::models::BackoffStrategy;
use serde::Serialize;

/// Retry policy attached to a task (or step definition defaults).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub strategy: BackoffStrategy,
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 5 * 60 * 1000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// `attempt < policy.max_attempts`.
pub fn should_retry(policy: &RetryPolicy, attempt: i32) -> bool {
    attempt < policy.max_attempts
}

/// Compute the delay before the next attempt, clamped to
/// `[0, policy.max_delay_ms]`. `attempt` is 1-based (the attempt that just
/// failed).
pub fn delay(policy: &RetryPolicy, attempt: i32) -> i64 {
    let raw = match policy.strategy {
        BackoffStrategy::Fixed => policy.base_delay_ms as f64,
        BackoffStrategy::Linear => policy.base_delay_ms as f64 * attempt as f64,
        BackoffStrategy::Exponential => {
            policy.base_delay_ms as f64 * policy.multiplier.powi(attempt - 1)
        }
    };

    let jittered = if policy.jitter {
        apply_jitter(raw)
    } else {
        raw
    };

    jittered.clamp(0.0, policy.max_delay_ms as f64) as i64
}

fn apply_jitter(d: f64) -> f64 {
    use rand::Rng;
    let factor = rand::rng().random_range(0.5..=1.5);
    d * factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            strategy,
            base_delay_ms: 100,
            max_delay_ms: 1_000_000,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let p = policy(BackoffStrategy::Fixed);
        assert!(should_retry(&p, 0));
        assert!(should_retry(&p, 4));
        assert!(!should_retry(&p, 5));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let p = policy(BackoffStrategy::Fixed);
        assert_eq!(delay(&p, 1), 100);
        assert_eq!(delay(&p, 4), 100);
    }

    #[test]
    fn linear_delay_scales_with_attempt() {
        let p = policy(BackoffStrategy::Linear);
        assert_eq!(delay(&p, 1), 100);
        assert_eq!(delay(&p, 3), 300);
    }

    #[test]
    fn exponential_delay_doubles_per_attempt() {
        let p = policy(BackoffStrategy::Exponential);
        assert_eq!(delay(&p, 1), 100);
        assert_eq!(delay(&p, 2), 200);
        assert_eq!(delay(&p, 3), 400);
    }

    #[test]
    fn delay_is_monotonically_increasing_without_jitter() {
        for strategy in [BackoffStrategy::Linear, BackoffStrategy::Exponential] {
            let p = policy(strategy);
            let mut prev = delay(&p, 1);
            for attempt in 2..=5 {
                let next = delay(&p, attempt);
                assert!(next >= prev, "{strategy:?}: delay should not decrease");
                prev = next;
            }
        }
    }

    #[test]
    fn delay_is_clamped_to_max() {
        let mut p = policy(BackoffStrategy::Exponential);
        p.max_delay_ms = 150;
        assert_eq!(delay(&p, 5), 150);
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half_times_base() {
        let mut p = policy(BackoffStrategy::Fixed);
        p.jitter = true;
        for _ in 0..200 {
            let d = delay(&p, 1) as f64;
            assert!(d >= 50.0 && d <= 150.0, "jittered delay {d} out of range");
        }
    }
}
