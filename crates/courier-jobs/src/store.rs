//! Persistence port consumed by the dispatcher.

use async_trait::async_trait;

use crate::{JobKind, JobRecord, StoreError};

/// Durable storage for job records.
///
/// The dispatcher never serializes records itself; it only calls these
/// operations. Implementations are responsible for their own concurrency
/// safety, since the dispatcher does not serialize calls into the store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Durably upsert the full state of `record`.
    ///
    /// Called before a job is first admitted and after every failure.
    async fn persist_job(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// All `Pending` records of `kind`, in any order.
    async fn get_all_pending_jobs(&self, kind: JobKind) -> Result<Vec<JobRecord>, StoreError>;

    /// Terminal success; removes the record from the pending set.
    async fn mark_job_as_succeeded(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Terminal failure; removes the record from the pending set.
    async fn mark_job_as_failed(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Whether the job was canceled since it was last persisted.
    ///
    /// Checked right before a scheduled retry is re-admitted.
    async fn is_job_canceled(&self, record: &JobRecord) -> Result<bool, StoreError>;
}
