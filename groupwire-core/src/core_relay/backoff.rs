//! Reconnect scheduling
//!
//! Pure delay computation: the policy never sleeps or spawns anything, the
//! connection manager does.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with a cap and symmetric jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound of the un-jittered delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor per attempt
    pub multiplier: f64,

    /// Fraction of the delay added or removed at random (0.2 = ±20%)
    pub jitter: f64,

    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay for a 0-based attempt number
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay before `attempt` (0-based), jittered with `rng`
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        if self.jitter <= 0.0 || base == 0.0 {
            return Duration::from_secs_f64(base);
        }

        let factor = rng.random_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((base * (1.0 + factor)).max(0.0))
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("reconnect initial_delay must be greater than 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("reconnect max_delay must not be below initial_delay".to_string());
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err("reconnect multiplier must be at least 1.0".to_string());
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err("reconnect jitter must be in [0, 1)".to_string());
        }
        Ok(())
    }
}
