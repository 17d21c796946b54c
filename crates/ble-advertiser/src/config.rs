//! Advertiser configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdvertiserError, Result};

/// Default number of advertisements the controller can run at once
pub const DEFAULT_MAX_CONCURRENT_ADVERTISEMENTS: usize = 2;

/// Default length of one advertising timeslot
pub const DEFAULT_TIMESLOT_DURATION: Duration = Duration::from_secs(10);

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the slot manager and its tokio collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertiserConfig {
    /// Number of advertising slots
    pub max_concurrent_advertisements: usize,
    /// How long a request may hold a slot before it is rotated out
    pub timeslot_duration_ms: u64,
    /// Minimum spacing between consecutive hardware commands
    pub min_command_interval_ms: u64,
    /// Backoff applied when hardware register/unregister fails
    pub retry: RetryConfig,
}

/// Exponential backoff for hardware retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
}

impl Default for AdvertiserConfig {
    fn default() -> Self {
        Self {
            max_concurrent_advertisements: DEFAULT_MAX_CONCURRENT_ADVERTISEMENTS,
            timeslot_duration_ms: DEFAULT_TIMESLOT_DURATION.as_millis() as u64,
            min_command_interval_ms: 0,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            backoff_factor: 2.0,
        }
    }
}

impl AdvertiserConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of advertising slots
    pub fn with_max_concurrent_advertisements(mut self, slots: usize) -> Self {
        self.max_concurrent_advertisements = slots;
        self
    }

    /// Set the rotation timeslot length
    pub fn with_timeslot_duration(mut self, duration: Duration) -> Self {
        self.timeslot_duration_ms = duration.as_millis() as u64;
        self
    }

    /// Set the minimum spacing between hardware commands
    pub fn with_min_command_interval(mut self, interval: Duration) -> Self {
        self.min_command_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the hardware retry backoff
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeslot_duration(&self) -> Duration {
        Duration::from_millis(self.timeslot_duration_ms)
    }

    pub fn min_command_interval(&self) -> Duration {
        Duration::from_millis(self.min_command_interval_ms)
    }

    /// Reject configurations the advertiser cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_advertisements == 0 {
            return Err(AdvertiserError::InvalidConfiguration {
                reason: "max_concurrent_advertisements must be at least 1".to_string(),
            });
        }
        if self.timeslot_duration_ms == 0 {
            return Err(AdvertiserError::InvalidConfiguration {
                reason: "timeslot_duration_ms must be non-zero".to_string(),
            });
        }
        self.retry.validate()
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Delay before retry number `attempt` (0-indexed), capped at `max_backoff`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.backoff_factor.powi(exponent);

        if !millis.is_finite() || millis < 0.0 || millis > self.max_backoff_ms as f64 {
            self.max_backoff()
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.backoff_factor < 1.0 || !self.backoff_factor.is_finite() {
            return Err(AdvertiserError::InvalidConfiguration {
                reason: format!(
                    "retry.backoff_factor must be a finite value >= 1.0, got {}",
                    self.backoff_factor
                ),
            });
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(AdvertiserError::InvalidConfiguration {
                reason: "retry.initial_backoff_ms exceeds retry.max_backoff_ms".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AdvertiserConfig::default();
        assert_eq!(config.max_concurrent_advertisements, 2);
        assert_eq!(config.timeslot_duration(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_slots_rejected() {
        let config = AdvertiserConfig::new().with_max_concurrent_advertisements(0);
        assert!(matches!(
            config.validate(),
            Err(AdvertiserError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_bad_backoff_rejected() {
        let config = AdvertiserConfig::new().with_retry(RetryConfig {
            backoff_factor: 0.5,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_factor: 2.0,
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(800));
        assert_eq!(retry.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(retry.delay_for(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        use serde::de::value::{Error, MapDeserializer};

        let entries = vec![("max_concurrent_advertisements", 4u64)];
        let config =
            AdvertiserConfig::deserialize(MapDeserializer::<_, Error>::new(entries.into_iter()))
                .unwrap();

        assert_eq!(config.max_concurrent_advertisements, 4);
        assert_eq!(config.timeslot_duration(), DEFAULT_TIMESLOT_DURATION);
        assert_eq!(config.retry, RetryConfig::default());
    }
}
