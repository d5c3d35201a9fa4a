//! Scheduler configuration

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::SchedulerError;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Bucket capacity: the largest burst of back-to-back executions
    #[serde(rename = "max-tokens", default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sustained execution rate in tasks per second (may be fractional)
    #[serde(rename = "refill-rate-per-sec", default = "default_refill_rate_per_sec")]
    pub refill_rate_per_sec: f64,

    /// Start with a full bucket rather than an empty one
    #[serde(rename = "start-full", default = "default_start_full")]
    pub start_full: bool,
}

fn default_max_tokens() -> u32 {
    10
}

fn default_refill_rate_per_sec() -> f64 {
    10.0
}

fn default_start_full() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            refill_rate_per_sec: default_refill_rate_per_sec(),
            start_full: default_start_full(),
        }
    }
}

impl SchedulerConfig {
    /// Config allowing `max_tokens` bursts refilled at `refill_rate_per_sec`
    pub fn with_rate(max_tokens: u32, refill_rate_per_sec: f64) -> Self {
        Self {
            max_tokens,
            refill_rate_per_sec,
            ..Default::default()
        }
    }

    /// "N per second" limiter: capacity and rate both N
    pub fn per_second(n: u32) -> Self {
        Self::with_rate(n, n as f64)
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        debug!(?self, "SchedulerConfig::validate: called");
        if self.max_tokens == 0 {
            return Err(SchedulerError::InvalidConfig("max-tokens must be at least 1".to_string()));
        }
        if !self.refill_rate_per_sec.is_finite() || self.refill_rate_per_sec <= 0.0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "refill-rate-per-sec must be a positive number, got {}",
                self.refill_rate_per_sec
            )));
        }
        Ok(())
    }
}
