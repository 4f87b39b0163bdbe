//! Retry strategies and backoff policies for the slave fetch protocol.
//!
//! The tarball pull retries a configurable number of times with a constant
//! delay by default; exponential and linear backoff are available for
//! deployments that prefer them.
//!
//! # Example
//!
//! ```
//! use scm_retry::{RetryConfig, calculate_delay};
//! use std::time::Duration;
//!
//! let config = RetryConfig::default();
//! assert_eq!(config.max_attempts, 3);
//! assert_eq!(calculate_delay(&config, 2), Duration::from_secs(1));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// No delay between retries - retry immediately
    Immediate,
    /// Constant delay: same delay every attempt (default)
    #[default]
    Constant,
    /// Linear backoff: delay increases linearly each attempt
    Linear,
    /// Exponential backoff: delay doubles each attempt
    Exponential,
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Strategy type for calculating delay between retries.
    #[serde(default)]
    pub strategy: RetryStrategy,
    /// Maximum number of attempts (including the first one).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Maximum delay cap for the growing strategies.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Constant,
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryConfig {
    /// Constant-delay configuration from the two settings knobs.
    pub fn constant(max_attempts: u32, delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Constant,
            max_attempts,
            base_delay: delay,
            max_delay: delay,
        }
    }
}

/// Calculate the delay before the next attempt.
///
/// `attempt` is 1-indexed: the delay returned for attempt *n* is the time
/// to wait after attempt *n* failed.
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let delay = match config.strategy {
        RetryStrategy::Immediate => Duration::ZERO,
        RetryStrategy::Constant => config.base_delay,
        RetryStrategy::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategy::Exponential => {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(31));
            config.base_delay.saturating_mul(factor)
        }
    };
    delay.min(config.max_delay)
}
