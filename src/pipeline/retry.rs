//! Bounded backoff for retryable registry failures
//!
//! Only errors the caller classifies as retryable are retried; everything else
//! is returned on the first attempt.

use crate::core::error::{ConfigError, RailError, RailResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
  /// No delay between retries
  Immediate,
  /// Delay doubles each attempt
  #[default]
  Exponential,
  /// Delay grows linearly each attempt
  Linear,
  /// Same delay every attempt
  Constant,
}

/// `[retry]` section of rail.toml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
  #[serde(default)]
  pub strategy: RetryStrategy,
  /// Total attempts, including the first one
  #[serde(default = "default_max_attempts")]
  pub max_attempts: u32,
  #[serde(default = "default_base_delay", with = "humantime_serde")]
  pub base_delay: Duration,
  #[serde(default = "default_max_delay", with = "humantime_serde")]
  pub max_delay: Duration,
  /// 0.0 = no jitter, 1.0 = full jitter
  #[serde(default = "default_jitter")]
  pub jitter: f64,
}

fn default_max_attempts() -> u32 {
  4
}

fn default_base_delay() -> Duration {
  Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
  Duration::from_secs(60)
}

fn default_jitter() -> f64 {
  0.3
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      strategy: RetryStrategy::default(),
      max_attempts: default_max_attempts(),
      base_delay: default_base_delay(),
      max_delay: default_max_delay(),
      jitter: default_jitter(),
    }
  }
}

impl RetryConfig {
  /// No waiting between attempts (tests, dry runs)
  pub fn immediate(max_attempts: u32) -> Self {
    Self {
      strategy: RetryStrategy::Immediate,
      max_attempts,
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
      jitter: 0.0,
    }
  }

  pub fn validate(&self) -> RailResult<()> {
    if self.max_attempts == 0 {
      return Err(RailError::Config(ConfigError::InvalidField {
        field: "retry.max_attempts".to_string(),
        reason: "must be at least 1".to_string(),
      }));
    }
    if !(0.0..=1.0).contains(&self.jitter) {
      return Err(RailError::Config(ConfigError::InvalidField {
        field: "retry.jitter".to_string(),
        reason: "must be between 0.0 and 1.0".to_string(),
      }));
    }
    Ok(())
  }
}

/// Delay before the retry following `attempt` (1-indexed)
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
  let delay = match config.strategy {
    RetryStrategy::Immediate => Duration::ZERO,
    RetryStrategy::Exponential => {
      let pow = attempt.saturating_sub(1).min(16);
      config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
    }
    RetryStrategy::Linear => config.base_delay.saturating_mul(attempt),
    RetryStrategy::Constant => config.base_delay,
  };

  let capped = delay.min(config.max_delay);

  if config.jitter > 0.0 {
    apply_jitter(capped, config.jitter)
  } else {
    capped
  }
}

/// Jitter factor of 0.5 means delay * (0.5 to 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
  let random_value: f64 = rand::thread_rng().r#gen();
  let random_factor = 1.0 - jitter + (random_value * 2.0 * jitter);
  let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
  Duration::from_millis(millis)
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts. The operation receives the attempt number.
pub fn retry_with_backoff<T, E, F, R>(config: &RetryConfig, mut operation: F, is_retryable: R) -> Result<T, E>
where
  F: FnMut(u32) -> Result<T, E>,
  R: Fn(&E) -> bool,
{
  let mut attempt = 1;

  loop {
    match operation(attempt) {
      Ok(value) => return Ok(value),
      Err(err) => {
        if attempt >= config.max_attempts || !is_retryable(&err) {
          return Err(err);
        }

        let delay = calculate_delay(config, attempt);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after transient failure");
        std::thread::sleep(delay);
        attempt += 1;
      }
    }
  }
}
