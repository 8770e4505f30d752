//! Job execution contract and the outcome-reporting protocol.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{DispatchError, JobId, JobKind, JobRecord};

/// The single outcome a job reports for one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job's work is done.
    Succeeded,
    /// The attempt failed but may succeed later.
    Failed(String),
    /// The job can never succeed; do not retry.
    FailedPermanently(String),
}

impl JobOutcome {
    pub(crate) fn unreported() -> Self {
        Self::Failed("job finished without reporting an outcome".to_string())
    }

    pub(crate) fn panicked() -> Self {
        Self::Failed("job panicked during execution".to_string())
    }
}

/// What a handler sees of the job it is running.
///
/// A snapshot: the dispatcher keeps the record itself, so bookkeeping
/// fields cannot be changed from inside a job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: Value,
    /// Failed attempts before this one.
    pub failure_count: u32,
}

impl From<&JobRecord> for JobContext {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            payload: record.payload.clone(),
            failure_count: record.failure_count,
        }
    }
}

/// One-shot handle a job uses to report its outcome.
///
/// Each method consumes the reporter, so a job cannot report twice. A
/// reporter dropped without reporting counts as a recoverable failure.
#[derive(Debug)]
pub struct JobReporter {
    id: JobId,
    tx: oneshot::Sender<JobOutcome>,
}

impl JobReporter {
    pub(crate) fn channel(id: JobId) -> (Self, oneshot::Receiver<JobOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { id, tx }, rx)
    }

    /// Id of the job this reporter belongs to.
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn succeeded(self) {
        self.report(JobOutcome::Succeeded);
    }

    /// Report a recoverable failure; the job will be retried with backoff
    /// until it reaches its failure ceiling.
    pub fn failed(self, error: impl fmt::Display) {
        self.report(JobOutcome::Failed(error.to_string()));
    }

    /// Report a failure that must not be retried.
    pub fn failed_permanently(self, error: impl fmt::Display) {
        self.report(JobOutcome::FailedPermanently(error.to_string()));
    }

    pub fn report(self, outcome: JobOutcome) {
        let Self { id, tx } = self;
        if tx.send(outcome).is_err() {
            debug!(id = %id, "dispatcher stopped waiting for this job's outcome");
        }
    }
}

/// Execution logic for one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Perform the job's side effects and report exactly one outcome.
    ///
    /// The reporter may be moved into a spawned task; the dispatcher waits
    /// for the report, not for this future.
    async fn execute(&self, job: JobContext, reporter: JobReporter);
}

/// Handlers for every job kind, assembled by the application.
#[derive(Clone, Default)]
pub struct JobHandlers {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl fmt::Debug for JobHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("JobHandlers").field("kinds", &kinds).finish()
    }
}

impl JobHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`, replacing any previous one.
    pub fn register(mut self, kind: JobKind, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Use one handler for every kind.
    pub fn all(handler: Arc<dyn JobHandler>) -> Self {
        Self {
            handlers: JobKind::ALL
                .into_iter()
                .map(|kind| (kind, Arc::clone(&handler)))
                .collect(),
        }
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Fail if any kind in [`JobKind::ALL`] has no handler.
    pub(crate) fn ensure_complete(&self) -> Result<(), DispatchError> {
        match JobKind::ALL
            .into_iter()
            .find(|kind| !self.handlers.contains_key(kind))
        {
            Some(kind) => Err(DispatchError::MissingHandler(kind)),
            None => Ok(()),
        }
    }
}

/// Bookkeeping side of the outcome protocol.
///
/// The dispatcher implements this and routes each reported
/// [`JobOutcome`] to exactly one of these methods.
#[async_trait]
pub trait JobDelegate: Send + Sync {
    /// Terminal success.
    async fn handle_job_succeeded(&self, record: JobRecord) -> Result<(), DispatchError>;

    /// Recoverable failure: count it, persist, then retry or give up.
    async fn handle_job_failed(&self, record: JobRecord, error: String)
    -> Result<(), DispatchError>;

    /// Permanent failure: count it, persist, and give up immediately.
    async fn handle_job_failed_permanently(
        &self,
        record: JobRecord,
        error: String,
    ) -> Result<(), DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn execute(&self, _job: JobContext, reporter: JobReporter) {
            reporter.succeeded();
        }
    }

    #[tokio::test]
    async fn test_reporter_delivers_one_outcome() {
        let (reporter, rx) = JobReporter::channel(JobId::new(1, 0));
        reporter.failed("connection reset");
        assert_eq!(
            rx.await.unwrap(),
            JobOutcome::Failed("connection reset".to_string())
        );
    }

    #[tokio::test]
    async fn test_dropped_reporter_closes_channel() {
        let (reporter, rx) = JobReporter::channel(JobId::new(1, 0));
        drop(reporter);
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_report_after_receiver_dropped_is_harmless() {
        let (reporter, rx) = JobReporter::channel(JobId::new(1, 0));
        drop(rx);
        reporter.succeeded();
    }

    #[test]
    fn test_incomplete_registry_is_rejected() {
        let handlers = JobHandlers::new().register(JobKind::MessageSend, Noop);
        assert!(matches!(
            handlers.ensure_complete(),
            Err(DispatchError::MissingHandler(JobKind::AttachmentDownload))
        ));

        let handlers = JobHandlers::all(Arc::new(Noop));
        assert!(handlers.ensure_complete().is_ok());
    }

    #[test]
    fn test_context_snapshot() {
        let mut record =
            JobRecord::new(JobId::new(5, 1), JobKind::MessageReceive, json!({"n": 1}));
        record.failure_count = 2;
        let context = JobContext::from(&record);
        assert_eq!(context.id, record.id);
        assert_eq!(context.failure_count, 2);
        assert_eq!(context.payload, json!({"n": 1}));
    }
}
