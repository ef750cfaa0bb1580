//! Retry strategies and backoff policies for storage uploads.
//!
//! The cloud storage target retries uploads with exponential backoff; each
//! attempt must respect the remaining operation deadline, so the executor
//! here is deadline-aware: it refuses to start an attempt once the
//! deadline has passed and never sleeps past it.
//!
//! # Example
//!
//! ```
//! use pmxpack_retry::{RetryStrategyConfig, RetryStrategyType, calculate_delay};
//! use std::time::Duration;
//!
//! let config = RetryStrategyConfig {
//!     strategy: RetryStrategyType::Exponential,
//!     max_attempts: 3,
//!     base_delay: Duration::from_secs(1),
//!     max_delay: Duration::from_secs(30),
//!     jitter: 0.0,
//! };
//! assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
//! assert_eq!(calculate_delay(&config, 2), Duration::from_secs(2));
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries
    Immediate,
    /// Delay doubles each attempt (default)
    #[default]
    Exponential,
    /// Delay increases linearly each attempt
    Linear,
    /// Same delay every attempt
    Constant,
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    /// Strategy type for calculating delay between retries.
    #[serde(default)]
    pub strategy: RetryStrategyType,
    /// Maximum number of attempts (including the first).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for backoff calculations.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Maximum delay cap for backoff.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor for randomized delays (0.0 = no jitter, 1.0 = full jitter).
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: 0.0,
        }
    }
}

/// Calculate the delay before the next attempt.
///
/// `attempt` is the 1-indexed number of the attempt that just failed.
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Apply jitter to a delay value.
/// Jitter factor of 0.5 means delay * (0.5 to 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::RngExt;

    let jitter_range = 2.0 * jitter;
    let mut rng = rand::rng();
    let random_value: f64 = rng.random();
    let random_factor = 1.0 - jitter + (random_value * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// Deadline-aware retry executor.
pub struct RetryExecutor {
    config: RetryStrategyConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryStrategyConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds or attempts are exhausted.
    ///
    /// The operation receives the current attempt number (starting at 1).
    pub fn run<T, E, F>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt >= self.config.max_attempts {
                        return Err(e);
                    }
                    std::thread::sleep(calculate_delay(&self.config, attempt));
                    attempt += 1;
                }
            }
        }
    }

    /// Run `operation` with retries bounded by a wall-clock deadline.
    ///
    /// No attempt starts after `deadline`, and backoff sleeps are clamped
    /// to the remaining budget. The operation receives the attempt number
    /// and the time remaining until the deadline.
    pub fn run_with_deadline<T, E, F>(&self, deadline: Instant, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32, Duration) -> Result<T, E>,
    {
        let mut attempt = 1;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match operation(attempt, remaining) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt >= self.config.max_attempts {
                        return Err(e);
                    }
                    let delay = calculate_delay(&self.config, attempt);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() || delay >= remaining {
                        return Err(e);
                    }
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
