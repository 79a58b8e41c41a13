//! Retry policy: exponential backoff with optional jitter
//!
//! The delay for retry `n` (0-indexed, counting retries after the first
//! attempt) is `min(base_delay * exponential_base^n, max_delay)`. Jitter is
//! off by default so the formula holds exactly; enabling it spreads
//! synchronized retries to avoid thundering herds against a recovering
//! upstream.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::CallError;

/// Lock-free xorshift64 PRNG for jitter randomness
///
/// Uses atomic compare-exchange for thread-safe operation without locks.
struct Xorshift64 {
    state: AtomicU64,
}

impl Xorshift64 {
    /// Create with seed from system time
    fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x853c49e6748fea9b);
        // Ensure non-zero seed
        let seed = if seed == 0 { 0x853c49e6748fea9b } else { seed };
        Self {
            state: AtomicU64::new(seed),
        }
    }

    /// Generate next random u64 using the xorshift64 algorithm
    fn next(&self) -> u64 {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let mut x = old;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            if self
                .state
                .compare_exchange_weak(old, x, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return x;
            }
        }
    }

    /// Generate random f64 in range [0.0, 1.0)
    fn next_f64(&self) -> f64 {
        (self.next() as f64) / (u64::MAX as f64)
    }
}

static JITTER_RNG: LazyLock<Xorshift64> = LazyLock::new(Xorshift64::new);

/// Generate random jitter value in range [0.0, 1.0)
fn rand_jitter() -> f64 {
    JITTER_RNG.next_f64()
}

/// Configuration for the retry policy
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on the backoff delay
    pub max_delay: Duration,
    /// Growth factor per retry (must be > 1)
    pub exponential_base: f64,
    /// Jitter factor (0.0-1.0) - randomizes delay by +/- this fraction.
    /// Zero keeps the backoff sequence exact.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    /// Validate invariants; called by the client builder
    pub fn validate(&self) -> Result<(), CallError> {
        if self.base_delay.is_zero() {
            return Err(CallError::Config("retry base_delay must be > 0".into()));
        }
        if self.max_delay.is_zero() {
            return Err(CallError::Config("retry max_delay must be > 0".into()));
        }
        if self.exponential_base <= 1.0 {
            return Err(CallError::Config(
                "retry exponential_base must be > 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(CallError::Config(
                "retry jitter_factor must be in 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }

    /// Calculate the delay before retry `retry` (0-indexed)
    ///
    /// Pure and deterministic when `jitter_factor` is zero.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.delay_with_jitter(retry, rand_jitter())
    }

    /// Calculate delay with an explicit jitter sample (for testing)
    ///
    /// `jitter` is in [0.0, 1.0]; 0.5 is the midpoint (no offset).
    pub fn delay_with_jitter(&self, retry: u32, jitter: f64) -> Duration {
        // Microseconds for precision with small delays
        let base_us =
            self.base_delay.as_micros() as f64 * self.exponential_base.powi(retry as i32);
        let base_us = base_us.min(self.max_delay.as_micros() as f64);

        // Map jitter [0.0, 1.0] to an offset of +/- jitter_factor * delay
        let jitter_offset = (jitter * 2.0 - 1.0) * base_us * self.jitter_factor;
        let final_us = (base_us + jitter_offset).max(0.0);

        Duration::from_micros(final_us as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence_doubles_and_caps() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter_factor: 0.0,
            max_retries: 10,
        };

        let expected = [2u64, 4, 8, 16, 32, 60, 60, 60];
        for (retry, secs) in expected.iter().enumerate() {
            assert_eq!(
                config.delay_for_retry(retry as u32),
                Duration::from_secs(*secs),
                "retry {retry}"
            );
        }
    }

    #[test]
    fn test_first_retry_uses_base_delay() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(config.delay_for_retry(0), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_range() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
            jitter_factor: 0.25,
            max_retries: 3,
        };

        // base 100ms, jitter range +/- 25ms
        assert_eq!(
            config.delay_with_jitter(0, 0.0),
            Duration::from_millis(75)
        );
        assert_eq!(
            config.delay_with_jitter(0, 1.0),
            Duration::from_millis(125)
        );
        assert_eq!(
            config.delay_with_jitter(0, 0.5),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let flat = RetryConfig {
            exponential_base: 1.0,
            ..Default::default()
        };
        assert!(flat.validate().is_err());

        let zero_base = RetryConfig {
            base_delay: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_base.validate().is_err());

        let wild_jitter = RetryConfig {
            jitter_factor: 1.5,
            ..Default::default()
        };
        assert!(wild_jitter.validate().is_err());

        assert!(RetryConfig::default().validate().is_ok());
    }

    #[test]
    fn test_xorshift_produces_distinct_values() {
        let rng = Xorshift64::new();
        let values: Vec<u64> = (0..100).map(|_| rng.next()).collect();
        let unique = values.iter().collect::<std::collections::HashSet<_>>().len();
        assert!(unique > 90, "expected >90 unique values, got {unique}");
    }

    #[test]
    fn test_jitter_samples_in_range() {
        for _ in 0..1000 {
            let v = rand_jitter();
            assert!((0.0..1.0).contains(&v), "jitter {v} out of range");
        }
    }
}
