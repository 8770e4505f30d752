//! Dispatcher configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{BackoffPolicy, JobKind};

/// Default cap on retries waiting in the delay queue.
const DEFAULT_MAX_PENDING_RETRIES: usize = 10_000;

/// Default time a job has to report its outcome.
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 600;

/// Tunables for a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Delay between a recoverable failure and the next attempt.
    pub backoff: BackoffPolicy,
    /// Retries held in memory at once. Beyond this, retries wait for the
    /// next resume.
    pub max_pending_retries: usize,
    /// Seconds a job may run without reporting before it counts as a
    /// recoverable failure.
    ///
    /// Jobs run one at a time, so a job that never reports holds back every
    /// later admission, of any kind, for up to this long.
    pub job_timeout_secs: u64,
    /// Per-kind overrides of [`JobKind::max_failure_count`].
    pub max_failure_counts: HashMap<JobKind, u32>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_pending_retries: DEFAULT_MAX_PENDING_RETRIES,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            max_failure_counts: HashMap::new(),
        }
    }
}

impl DispatcherConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Retry ceiling for newly submitted jobs of `kind`.
    pub fn max_failure_count(&self, kind: JobKind) -> u32 {
        self.max_failure_counts
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.max_failure_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.max_pending_retries, 10_000);
        assert_eq!(config.job_timeout(), Duration::from_secs(600));
        assert_eq!(config.max_failure_count(JobKind::MessageSend), 10);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: DispatcherConfig = serde_json::from_value(json!({
            "backoff": { "base_delay_ms": 100 },
            "max_failure_counts": { "message_send": 3 }
        }))
        .unwrap();

        assert_eq!(config.backoff.base_delay_ms, 100);
        assert_eq!(config.backoff.max_multiplier, 600);
        assert_eq!(config.max_failure_count(JobKind::MessageSend), 3);
        assert_eq!(config.max_failure_count(JobKind::MessageReceive), 10);
        assert_eq!(config.job_timeout_secs, 600);
    }
}
