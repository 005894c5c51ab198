//! Conflict retry policy and the retrying transaction runner.

use crate::error::{DispatchError, DispatchResult};
use crate::metrics::StoreMetrics;
use crate::store::{Store, Transaction};
use conveyor_config::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Retry strategy enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryStrategy {
    /// No retry.
    None,
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff with optional jitter.
    Exponential,
}

/// Retry policy for transient store conflicts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry strategy.
    pub strategy: RetryStrategy,

    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Add random jitter to delays.
    pub jitter: bool,

    /// Jitter factor (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5)
    }
}

impl RetryPolicy {
    /// Creates a policy that makes a single attempt.
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::None,
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: false,
            jitter_factor: 0.0,
        }
    }

    /// Creates a fixed delay retry policy.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            max_attempts,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter: false,
            jitter_factor: 0.0,
        }
    }

    /// Creates an exponential backoff retry policy.
    ///
    /// Conflicts clear quickly, so the base delay is short: 10ms doubling
    /// up to one second.
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_attempts,
            initial_delay_ms: 10,
            max_delay_ms: 1000,
            multiplier: 2.0,
            jitter: true,
            jitter_factor: 0.2,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self.jitter_factor = 0.0;
        self
    }

    /// Returns true if another attempt is allowed after `attempts` failed ones.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.strategy != RetryStrategy::None && attempts < self.max_attempts
    }

    /// Delay to wait after the given number of failed attempts.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.strategy == RetryStrategy::None {
            return Duration::ZERO;
        }

        let base_delay = match self.strategy {
            RetryStrategy::None => 0,
            RetryStrategy::Fixed => self.initial_delay_ms,
            RetryStrategy::Exponential => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                (self.initial_delay_ms as f64 * self.multiplier.powi(exp)) as u64
            }
        };

        let capped_delay = base_delay.min(self.max_delay_ms);

        let final_delay = if self.jitter && self.jitter_factor > 0.0 {
            let jitter_range = (capped_delay as f64 * self.jitter_factor) as u64;
            let jitter = rand_jitter(jitter_range);
            capped_delay
                .saturating_add(jitter)
                .saturating_sub(jitter_range / 2)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::exponential(config.max_attempts)
            .with_initial_delay(Duration::from_millis(config.initial_delay_ms))
            .with_max_delay(Duration::from_millis(config.max_delay_ms))
    }
}

/// Pseudo-random jitter from the clock, enough to spread colliding writers.
fn rand_jitter(range: u64) -> u64 {
    use std::time::SystemTime;

    if range == 0 {
        return 0;
    }

    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    let a: u64 = 6_364_136_223_846_793_005;
    let c: u64 = 1_442_695_040_888_963_407;

    u64::from(seed).wrapping_mul(a).wrapping_add(c) % range
}

/// Runs `work` in a fresh transaction and commits it, retrying the whole
/// unit on write conflicts until the policy is exhausted.
///
/// `work` may run several times, so it must not have side effects outside
/// the transaction it is given.
pub fn transact<T, F>(store: &dyn Store, policy: &RetryPolicy, mut work: F) -> DispatchResult<T>
where
    F: FnMut(&mut dyn Transaction) -> DispatchResult<T>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let mut tx = store.begin();
        let outcome = match work(tx.as_mut()) {
            Ok(value) => tx.commit().map(|()| value).map_err(DispatchError::from),
            Err(e) => {
                tx.abort();
                Err(e)
            }
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                StoreMetrics::conflict();
                if !policy.should_retry(attempts) {
                    warn!(attempts = attempts, error = %e, "Transaction retries exhausted");
                    return Err(DispatchError::ConflictRetriesExhausted { attempts });
                }
                let delay = policy.delay_for_attempt(attempts);
                debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Retrying conflicted transaction");
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}
