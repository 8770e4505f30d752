//! Stand-in job handler used by the command-line runner.
//!
//! The real attachment, message and push work belongs to the client
//! application. This handler sleeps for a while and reports whatever
//! outcome the payload asks for, which is enough to exercise retries,
//! permanent failures and resume from the command line.

use std::time::Duration;

use async_trait::async_trait;
use courier_jobs::{JobContext, JobHandler, JobOutcome, JobReporter};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FailMode {
    Recoverable,
    Permanent,
}

/// Knobs read from a job's payload. Other payload fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SimulatedPayload {
    /// How the job should fail, if at all.
    fail: Option<FailMode>,
    /// Attempts that fail before the job starts succeeding.
    /// Unset means every attempt fails.
    fail_times: Option<u32>,
    /// Simulated work duration.
    work_ms: u64,
}

impl SimulatedPayload {
    fn parse(payload: &Value) -> Result<Self, serde_json::Error> {
        if payload.is_null() {
            return Ok(Self::default());
        }
        Self::deserialize(payload)
    }

    fn outcome(&self, failure_count: u32) -> JobOutcome {
        let Some(mode) = self.fail else {
            return JobOutcome::Succeeded;
        };
        if self.fail_times.is_some_and(|n| failure_count >= n) {
            return JobOutcome::Succeeded;
        }

        let attempt = failure_count + 1;
        match mode {
            FailMode::Recoverable => {
                JobOutcome::Failed(format!("simulated failure on attempt {attempt}"))
            }
            FailMode::Permanent => {
                JobOutcome::FailedPermanently(format!("simulated permanent failure on attempt {attempt}"))
            }
        }
    }
}

/// Handler registered for every job kind by the CLI.
pub struct SimulatedHandler;

#[async_trait]
impl JobHandler for SimulatedHandler {
    async fn execute(&self, job: JobContext, reporter: JobReporter) {
        let payload = match SimulatedPayload::parse(&job.payload) {
            Ok(payload) => payload,
            Err(e) => {
                reporter.failed_permanently(format!("invalid payload: {e}"));
                return;
            }
        };

        debug!(id = %job.id, kind = %job.kind, work_ms = payload.work_ms, "simulating job");
        if payload.work_ms > 0 {
            tokio::time::sleep(Duration::from_millis(payload.work_ms)).await;
        }

        let outcome = payload.outcome(job.failure_count);
        if outcome == JobOutcome::Succeeded {
            info!(id = %job.id, kind = %job.kind, "job done");
        }
        reporter.report(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_empty_payload_succeeds() {
        for payload in [json!({}), Value::Null, json!({"to": "alice", "body": "hi"})] {
            let parsed = SimulatedPayload::parse(&payload).unwrap();
            assert_eq!(parsed.outcome(0), JobOutcome::Succeeded);
        }
    }

    #[test]
    fn test_recoverable_until_fail_times() {
        let parsed =
            SimulatedPayload::parse(&json!({"fail": "recoverable", "fail_times": 2})).unwrap();
        assert!(matches!(parsed.outcome(0), JobOutcome::Failed(_)));
        assert!(matches!(parsed.outcome(1), JobOutcome::Failed(_)));
        assert_eq!(parsed.outcome(2), JobOutcome::Succeeded);
    }

    #[test]
    fn test_always_fails_without_fail_times() {
        let parsed = SimulatedPayload::parse(&json!({"fail": "permanent"})).unwrap();
        assert_eq!(
            parsed.outcome(7),
            JobOutcome::FailedPermanently("simulated permanent failure on attempt 8".to_string())
        );
    }

    #[test]
    fn test_invalid_payload_is_rejected() {
        assert!(SimulatedPayload::parse(&json!({"fail": "sometimes"})).is_err());
        assert!(SimulatedPayload::parse(&json!("not an object")).is_err());
        assert!(SimulatedPayload::parse(&json!({"work_ms": -1})).is_err());
    }
}
