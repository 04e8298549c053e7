//! Bounded retry with exponential backoff for file transfers
//!
//! Every attempt is handed to the caller-supplied closure, which is expected to
//! set up its own deadline and resources so attempts stay independent. When all
//! attempts are used up (or the failure cannot be cured by retrying) the last
//! error is wrapped in a `Resource` error annotated with the attempt count.
//!
//! # Example
//!
//! ```no_run
//! use goss::retry::{RetryConfig, RetryState};
//! use std::time::Duration;
//!
//! let config = RetryConfig::new(3, Duration::from_millis(500), Duration::from_secs(30));
//! let mut state = RetryState::new();
//!
//! if state.should_retry(&config) {
//!     let delay = state.calculate_delay(&config);
//!     state.record_retry();
//! }
//! ```

use crate::error::{ErrorKind, GossError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry configuration for transfers
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay cap to prevent excessive waiting
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Create a new retry configuration
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Total attempts including the first (values below 1 act as 1)
    /// * `base_delay` - Delay before the first retry
    /// * `max_delay` - Upper bound for any single delay
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Retry state tracking for one operation
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Current attempt number (starts at 1 for first attempt)
    pub attempt: u32,
    /// Number of retries performed (0 for first attempt)
    pub retry_count: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 1,
            retry_count: 0,
        }
    }

    /// `true` while another attempt is allowed after the current one
    pub fn should_retry(&self, config: &RetryConfig) -> bool {
        self.attempt < config.max_attempts.max(1)
    }

    /// Backoff before the next attempt
    ///
    /// Formula: delay = base_delay * 2^(retry_count), capped at max_delay.
    pub fn calculate_delay(&self, config: &RetryConfig) -> Duration {
        let base_ms = config.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let exponential_ms = base_ms.saturating_mul(2u64.saturating_pow(self.retry_count));
        let max_ms = config.max_delay.as_millis().min(u64::MAX as u128) as u64;
        let capped_ms = exponential_ms.min(max_ms);

        debug!(
            "Calculated backoff delay: {}ms (attempt {}, retry {})",
            capped_ms, self.attempt, self.retry_count
        );

        Duration::from_millis(capped_ms)
    }

    /// Record a retry attempt, incrementing counters
    pub fn record_retry(&mut self) {
        self.retry_count += 1;
        self.attempt += 1;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Failures that another attempt cannot fix
pub fn is_retryable(err: &GossError) -> bool {
    !matches!(err.kind, ErrorKind::Validation | ErrorKind::Permission)
}

/// Run `attempt_fn` until it succeeds or the attempts are used up
///
/// The closure receives the 1-based attempt number. On final failure the
/// returned error is `Resource`, says `"<operation> failed (attempt i/n)"`,
/// carries an `attempts` detail and wraps the last attempt's error.
pub async fn run_with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    target: &str,
    mut attempt_fn: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut state = RetryState::new();

    loop {
        let err = match attempt_fn(state.attempt).await {
            Ok(value) => {
                if state.attempt > 1 {
                    debug!(
                        "{} on {} succeeded on attempt {}/{}",
                        operation, target, state.attempt, max_attempts
                    );
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        let retryable = is_retryable(&err);
        if !retryable || !state.should_retry(config) {
            return Err(GossError::resource(
                operation,
                target,
                format!("{} failed (attempt {}/{})", operation, state.attempt, max_attempts),
            )
            .with_detail("attempts", state.attempt)
            .with_detail("retryable", retryable)
            .with_source(err));
        }

        let delay = state.calculate_delay(config);
        warn!(
            "{} on {} failed (attempt {}/{}), retrying in {}ms: {}",
            operation,
            target,
            state.attempt,
            max_attempts,
            delay.as_millis(),
            err
        );
        tokio::time::sleep(delay).await;
        state.record_retry();
    }
}
