//! Job store backed by a directory of JSON files.
//!
//! Each record lives in `<id>.json` under the store root. Writes go to a
//! hidden temp file first and are renamed into place, so a crash never
//! leaves a half-written record behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use courier_jobs::{JobId, JobKind, JobRecord, JobStatus, JobStore, StoreError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const RECORD_EXTENSION: &str = "json";

/// Durable job store rooted at a directory.
#[derive(Debug)]
pub struct FileJobStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles on record files.
    write_lock: Mutex<()>,
}

impl FileJobStore {
    /// Open the store at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "opened job store");
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Get a record by id.
    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.read(id).await
    }

    /// All readable records, ordered by id.
    ///
    /// Files that cannot be parsed are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_record_file(&path) {
                continue;
            }

            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                // Removed between read_dir and read.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            match serde_json::from_slice::<JobRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable job record");
                }
            }
        }

        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    /// Cancel a job that has not reached a terminal status.
    ///
    /// Returns true if the record was found and canceled.
    pub async fn cancel_job(&self, id: JobId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;

        match self.read(id).await? {
            Some(mut record) if !record.status.is_terminal() => {
                record.status = JobStatus::Canceled;
                self.write(&record).await?;
                debug!(id = %id, "canceled job");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn path_for(&self, id: JobId) -> PathBuf {
        self.root.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    fn temp_path_for(&self, id: JobId) -> PathBuf {
        self.root.join(format!(".{id}.{RECORD_EXTENSION}.tmp"))
    }

    async fn read(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        match fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, record: &JobRecord) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(record)?;

        let temp_path = self.temp_path_for(record.id);
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, self.path_for(record.id)).await?;
        Ok(())
    }

    async fn write_terminal(&self, record: &JobRecord, status: JobStatus) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut stored = record.clone();
        stored.status = status;
        self.write(&stored).await
    }
}

fn is_record_file(path: &Path) -> bool {
    let visible = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| !name.starts_with('.'));
    visible && path.extension().is_some_and(|ext| ext == RECORD_EXTENSION)
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn persist_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        // A cancellation written by the owner outlives later upserts.
        let canceled = self
            .read(record.id)
            .await?
            .is_some_and(|existing| existing.status == JobStatus::Canceled);

        if canceled {
            let mut stored = record.clone();
            stored.status = JobStatus::Canceled;
            self.write(&stored).await
        } else {
            self.write(record).await
        }
    }

    async fn get_all_pending_jobs(&self, kind: JobKind) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.kind == kind && r.status == JobStatus::Pending)
            .collect())
    }

    async fn mark_job_as_succeeded(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.write_terminal(record, JobStatus::Succeeded).await
    }

    async fn mark_job_as_failed(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.write_terminal(record, JobStatus::Failed).await
    }

    async fn is_job_canceled(&self, record: &JobRecord) -> Result<bool, StoreError> {
        Ok(self
            .read(record.id)
            .await?
            .is_none_or(|stored| stored.status == JobStatus::Canceled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(ts: u64, kind: JobKind) -> JobRecord {
        JobRecord::new(JobId::new(ts, 0), kind, json!({"ts": ts}))
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();

        {
            let store = FileJobStore::open(dir.path()).await.unwrap();
            store.persist_job(&record(1, JobKind::MessageSend)).await.unwrap();
            store.persist_job(&record(2, JobKind::MessageSend)).await.unwrap();
        }

        let store = FileJobStore::open(dir.path()).await.unwrap();
        let pending = store
            .get_all_pending_jobs(JobKind::MessageSend)
            .await
            .unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![JobId::new(1, 0), JobId::new(2, 0)]);
        assert_eq!(pending[0].payload, json!({"ts": 1}));
    }

    #[tokio::test]
    async fn test_pending_filters_kind_and_status() {
        let dir = tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        let sent = record(1, JobKind::MessageSend);
        let received = record(2, JobKind::MessageReceive);
        let done = record(3, JobKind::MessageSend);
        for r in [&sent, &received, &done] {
            store.persist_job(r).await.unwrap();
        }
        store.mark_job_as_succeeded(&done).await.unwrap();

        let pending = store
            .get_all_pending_jobs(JobKind::MessageSend)
            .await
            .unwrap();
        assert_eq!(pending, vec![sent]);

        let stored = store.get(done.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failure_persist_updates_count() {
        let dir = tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        let mut r = record(1, JobKind::AttachmentUpload);
        store.persist_job(&r).await.unwrap();
        r.record_failure("timeout");
        store.persist_job(&r).await.unwrap();

        let stored = store.get(r.id).await.unwrap().unwrap();
        assert_eq!(stored.failure_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_cancel_survives_persist() {
        let dir = tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        let mut r = record(1, JobKind::MessageSend);
        store.persist_job(&r).await.unwrap();
        assert!(store.cancel_job(r.id).await.unwrap());
        assert!(store.is_job_canceled(&r).await.unwrap());

        r.record_failure("network down");
        store.persist_job(&r).await.unwrap();

        let stored = store.get(r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Canceled);
        assert_eq!(stored.failure_count, 1);
        assert!(
            store
                .get_all_pending_jobs(JobKind::MessageSend)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_cancel_terminal_or_missing_is_noop() {
        let dir = tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        let r = record(1, JobKind::MessageSend);
        store.persist_job(&r).await.unwrap();
        store.mark_job_as_failed(&r).await.unwrap();

        assert!(!store.cancel_job(r.id).await.unwrap());
        assert!(!store.cancel_job(JobId::new(99, 0)).await.unwrap());
        assert_eq!(
            store.get(r.id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_missing_record_counts_as_canceled() {
        let dir = tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        assert!(
            store
                .is_job_canceled(&record(1, JobKind::MessageSend))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_list_skips_corrupt_and_temp_files() {
        let dir = tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        let r = record(1, JobKind::NotifyPushServer);
        store.persist_job(&r).await.unwrap();
        fs::write(dir.path().join("0000000000002.json"), b"{not json")
            .await
            .unwrap();
        fs::write(dir.path().join(".0000000000000300000.json.tmp"), b"{}")
            .await
            .unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec![r]);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        store.persist_job(&record(1, JobKind::MessageSend)).await.unwrap();

        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![format!("{}.json", JobId::new(1, 0))]);
    }
}
