//! Exponential retry backoff with jitter.

use chrono::Duration;
use rand::Rng;

use crate::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
  base: Duration,
  factor: u32,
  max: Duration,
  jitter: f64,
  max_retries: u32,
}

impl Backoff {
  pub fn new(base: Duration, factor: u32, max: Duration, jitter: f64, max_retries: u32) -> Self {
    Self {
      base,
      factor,
      max,
      jitter,
      max_retries,
    }
  }

  pub fn from_config(config: &RetryConfig) -> Self {
    Self::new(
      Duration::seconds(config.base_delay_secs as i64),
      config.factor,
      Duration::seconds(config.max_delay_secs as i64),
      config.jitter,
      config.max_retries,
    )
  }

  pub fn max_retries(&self) -> u32 {
    self.max_retries
  }

  /// Delay before the next attempt after `retry_count` failures, without jitter.
  pub fn delay(&self, retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(31);
    let multiplier = (self.factor as i64).saturating_pow(exponent);
    let millis = self.base.num_milliseconds().saturating_mul(multiplier);
    Duration::milliseconds(millis.min(self.max.num_milliseconds()))
  }

  /// Delay with jitter applied; `sample` is in [-1, 1].
  pub fn delay_with_sample(&self, retry_count: u32, sample: f64) -> Duration {
    let base = self.delay(retry_count).num_milliseconds() as f64;
    let jittered = base * (1.0 + self.jitter * sample.clamp(-1.0, 1.0));
    Duration::milliseconds(jittered.round() as i64)
  }

  /// Jittered delay before the next attempt after `retry_count` failures.
  pub fn next_delay(&self, retry_count: u32) -> Duration {
    let sample = rand::rng().random_range(-1.0..=1.0);
    self.delay_with_sample(retry_count, sample)
  }

  /// Whether a record with `retry_count` failures has used up its budget.
  pub fn is_exhausted(&self, retry_count: u32) -> bool {
    retry_count > self.max_retries
  }
}

impl Default for Backoff {
  fn default() -> Self {
    Self::from_config(&RetryConfig::default())
  }
}
