//! In-memory job store.
//!
//! Useful for tests and for embedding the dispatcher where durability is
//! provided elsewhere. Every port call is appended to a call log so callers
//! can assert on exactly which persistence operations happened.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{JobId, JobKind, JobRecord, JobStatus, JobStore, StoreError};

/// A persistence port call observed by [`MemoryJobStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreCall {
    Persist(JobId),
    GetPending(JobKind),
    MarkSucceeded(JobId),
    MarkFailed(JobId),
    IsCanceled(JobId),
}

/// Job store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: DashMap<JobId, JobRecord>,
    calls: Mutex<Vec<StoreCall>>,
    unavailable: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing record, bypassing the call log.
    pub fn insert(&self, record: JobRecord) {
        self.records.insert(record.id, record);
    }

    /// Get a record by id.
    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    /// All records, ordered by id.
    pub fn all(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Cancel a job that has not reached a terminal status.
    ///
    /// Returns true if the record was found and canceled.
    pub fn cancel_job(&self, id: JobId) -> bool {
        match self.records.get_mut(&id) {
            Some(mut record) if !record.status.is_terminal() => {
                record.status = JobStatus::Canceled;
                true
            }
            _ => false,
        }
    }

    /// Simulate an unreachable backend: every port call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Port calls observed so far, in order.
    pub async fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().await.clone()
    }

    /// Port calls that touched `id`.
    pub async fn calls_for(&self, id: JobId) -> Vec<StoreCall> {
        self.calls
            .lock()
            .await
            .iter()
            .copied()
            .filter(|call| match call {
                StoreCall::Persist(c)
                | StoreCall::MarkSucceeded(c)
                | StoreCall::MarkFailed(c)
                | StoreCall::IsCanceled(c) => *c == id,
                StoreCall::GetPending(_) => false,
            })
            .collect()
    }

    async fn observe(&self, call: StoreCall) -> Result<(), StoreError> {
        self.calls.lock().await.push(call);
        if self.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }

    fn set_terminal(&self, record: &JobRecord, status: JobStatus) {
        let mut stored = record.clone();
        stored.status = status;
        self.records.insert(stored.id, stored);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn persist_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.observe(StoreCall::Persist(record.id)).await?;

        // A cancellation recorded by the owner outlives later upserts.
        let canceled = self
            .records
            .get(&record.id)
            .is_some_and(|r| r.status == JobStatus::Canceled);

        let mut stored = record.clone();
        if canceled {
            stored.status = JobStatus::Canceled;
        }
        self.records.insert(stored.id, stored);
        Ok(())
    }

    async fn get_all_pending_jobs(&self, kind: JobKind) -> Result<Vec<JobRecord>, StoreError> {
        self.observe(StoreCall::GetPending(kind)).await?;

        Ok(self
            .records
            .iter()
            .filter(|r| r.kind == kind && r.status == JobStatus::Pending)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn mark_job_as_succeeded(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.observe(StoreCall::MarkSucceeded(record.id)).await?;
        self.set_terminal(record, JobStatus::Succeeded);
        Ok(())
    }

    async fn mark_job_as_failed(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.observe(StoreCall::MarkFailed(record.id)).await?;
        self.set_terminal(record, JobStatus::Failed);
        Ok(())
    }

    async fn is_job_canceled(&self, record: &JobRecord) -> Result<bool, StoreError> {
        self.observe(StoreCall::IsCanceled(record.id)).await?;

        // A record that vanished from storage was deleted by its owner.
        Ok(self
            .records
            .get(&record.id)
            .is_none_or(|r| r.status == JobStatus::Canceled))
    }
}
