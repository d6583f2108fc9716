//! Retry and reconnection policy
//!
//! Exponential backoff with optional jitter. The same curve drives signaling
//! reconnects (finite attempts, then `ConnectionLost`) and the best-effort room
//! status sync.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnection policy configuration
///
/// Controls how reconnection attempts are made when the signaling channel drops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    /// Maximum number of reconnection attempts (default: 5, 0 disables reconnecting)
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds (default: 1000ms)
    pub backoff_initial_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 30000ms)
    pub backoff_max_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff (default: true)
    pub jitter_enabled: bool,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl ReconnectionPolicy {
    /// Policy for the fire-and-forget room status updates
    pub fn status_sync() -> Self {
        Self {
            max_retries: 3,
            backoff_initial_ms: 500,
            backoff_max_ms: 5000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }

    /// Policy that never retries
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate backoff duration for a given attempt number
    ///
    /// # Arguments
    /// * `attempt` - Current attempt number (0-indexed)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let backoff_ms =
            (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(attempt as i32);

        let backoff_ms = backoff_ms.min(self.backoff_max_ms as f64);

        // Jitter adds 0-25% of the backoff
        let final_ms = if self.jitter_enabled {
            backoff_ms + rand_jitter(backoff_ms * 0.25)
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Check if more retries are allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Validate policy parameters
    pub fn validate(&self, name: &str) -> crate::Result<()> {
        use crate::Error;

        if self.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "{}.backoff_multiplier must be >= 1.0, got {}",
                name, self.backoff_multiplier
            )));
        }

        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(Error::InvalidConfig(format!(
                "{}.backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
                name, self.backoff_initial_ms, self.backoff_max_ms
            )));
        }

        Ok(())
    }
}

/// Simple pseudo-random jitter using time-based seed
fn rand_jitter(max: f64) -> f64 {
    let seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as f64;
    (seed % 1000.0) / 1000.0 * max
}
