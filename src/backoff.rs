// src/backoff.rs
use serde::{Deserialize, Serialize};

/// Backoff strategies for job retries, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Fixed { delay: u64 },
    /// `delay * 2^(attempt-1)`, capped.
    Exponential { delay: u64, cap: u64 },
    Linear { increment: u64, cap: u64 },
}

impl BackoffStrategy {
    /// Delay before the given retry attempt (1-based: the first retry is
    /// attempt 1).
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Exponential { delay, cap } => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                delay.saturating_mul(factor).min(*cap)
            }
            BackoffStrategy::Linear { increment, cap } => {
                increment.saturating_mul(attempt as u64).min(*cap)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            delay: 1_000,
            cap: 300_000,
        }
    }
}

/// Convenience type alias
pub type Backoff = BackoffStrategy;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_is_constant() {
        let b = BackoffStrategy::Fixed { delay: 250 };
        assert_eq!(b.delay_for(1), 250);
        assert_eq!(b.delay_for(7), 250);
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let b = BackoffStrategy::Exponential {
            delay: 100,
            cap: 1_000,
        };
        assert_eq!(b.delay_for(1), 100);
        assert_eq!(b.delay_for(2), 200);
        assert_eq!(b.delay_for(3), 400);
        assert_eq!(b.delay_for(10), 1_000);
    }

    #[test]
    fn linear_grows_by_increment() {
        let b = BackoffStrategy::Linear {
            increment: 100,
            cap: 350,
        };
        assert_eq!(b.delay_for(1), 100);
        assert_eq!(b.delay_for(3), 300);
        assert_eq!(b.delay_for(4), 350);
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let b = BackoffStrategy::Exponential {
            delay: 100,
            cap: 1_000,
        };
        assert_eq!(b.delay_for(0), 100);
    }
}
