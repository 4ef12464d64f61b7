//! Exponential backoff for session re-establishment.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Backoff parameters used between connection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the second attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Give up after this many failed attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomised away (0.0 disables jitter).
    pub jitter_fraction: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            max_attempts: None,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

impl ReconnectConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(StoreError::Config(format!(
                "reconnect.initial_delay_ms ({}) > reconnect.max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(StoreError::Config(
                "reconnect.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(StoreError::Config(
                "reconnect.jitter_fraction must be within [0, 1]".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(StoreError::Config(
                "reconnect.max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Attempt counter and delay calculator for one reconnect cycle.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    /// Starts a fresh cycle.
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Failed attempts so far in this cycle.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Clears the cycle after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Records a failed attempt.
    pub fn record_failure(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// True once the configured attempt budget is spent.
    pub fn exhausted(&self) -> bool {
        self.config
            .max_attempts
            .map_or(false, |max| self.attempt >= max)
    }

    /// Delay before the next attempt, without jitter.
    pub fn base_delay(&self) -> Duration {
        let exponent = self.attempt.saturating_sub(1).min(63) as i32;
        let computed =
            self.config.initial_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let capped = computed.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before the next attempt. Jitter only ever shortens the delay,
    /// by up to `jitter_fraction` of it.
    pub fn next_delay(&self) -> Duration {
        let base = self.base_delay().as_millis() as u64;
        let range = (base as f64 * self.config.jitter_fraction) as u64;
        let jitter = if range > 0 {
            rand::thread_rng().gen_range(0..=range)
        } else {
            0
        };
        Duration::from_millis(base.saturating_sub(jitter).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            max_attempts: Some(5),
            backoff_multiplier: 2.0,
            jitter_fraction: 0.0,
        }
    }

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay_ms, 100);
        assert_eq!(config.max_delay_ms, 30_000);
        assert!(config.max_attempts.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let mut backoff = Backoff::new(no_jitter());
        backoff.record_failure();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        backoff.record_failure();
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        backoff.record_failure();
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        backoff.record_failure();
        backoff.record_failure();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let config = ReconnectConfig {
            jitter_fraction: 0.5,
            ..no_jitter()
        };
        let mut backoff = Backoff::new(config);
        backoff.record_failure();
        backoff.record_failure();
        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(200));
            assert!(delay >= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_bounded_attempts() {
        let mut backoff = Backoff::new(no_jitter());
        for _ in 0..4 {
            backoff.record_failure();
            assert!(!backoff.exhausted());
        }
        backoff.record_failure();
        assert!(backoff.exhausted());
        assert_eq!(backoff.attempts(), 5);

        backoff.reset();
        assert!(!backoff.exhausted());
        assert_eq!(backoff.attempts(), 0);
    }

    #[test]
    fn test_unbounded_never_exhausts() {
        let mut backoff = Backoff::new(ReconnectConfig::default());
        for _ in 0..1_000 {
            backoff.record_failure();
        }
        assert!(!backoff.exhausted());
        assert_eq!(backoff.base_delay(), Duration::from_millis(30_000));
    }

    #[test]
    fn test_validate() {
        let bad = ReconnectConfig {
            initial_delay_ms: 10_000,
            max_delay_ms: 10,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = ReconnectConfig {
            jitter_fraction: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = ReconnectConfig {
            max_attempts: Some(0),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
