//! Retry backoff calculation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay unit multiplied by the backoff factor.
const DEFAULT_BASE_DELAY_MS: u64 = 250;

/// Cap on the backoff factor. With the default base this is 150 seconds.
const DEFAULT_MAX_MULTIPLIER: u64 = 600;

/// Exponential backoff: `base_delay_ms * min(max_multiplier, 2^failure_count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_multiplier: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_multiplier: DEFAULT_MAX_MULTIPLIER,
        }
    }
}

impl BackoffPolicy {
    /// Delay before re-admitting a job that has failed `failure_count` times.
    pub fn delay_for(&self, failure_count: u32) -> Duration {
        let factor = 1u64
            .checked_shl(failure_count)
            .unwrap_or(u64::MAX)
            .min(self.max_multiplier);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// The longest delay this policy produces.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(self.max_multiplier))
    }
}
