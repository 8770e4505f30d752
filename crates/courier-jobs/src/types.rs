//! Job record types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{JobId, UnknownJobKind};

/// The closed set of job variants the client knows how to run.
///
/// Resume walks [`JobKind::ALL`], so adding a variant here is enough for its
/// pending records to be replayed after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fetch an attachment referenced by a received message.
    AttachmentDownload,
    /// Upload an attachment before its message is sent.
    AttachmentUpload,
    /// Process an incoming message envelope.
    MessageReceive,
    /// Deliver an outgoing message.
    MessageSend,
    /// Register or notify the push notification server.
    NotifyPushServer,
}

impl JobKind {
    /// Every job kind, in resume order.
    pub const ALL: [JobKind; 5] = [
        JobKind::AttachmentDownload,
        JobKind::AttachmentUpload,
        JobKind::MessageReceive,
        JobKind::MessageSend,
        JobKind::NotifyPushServer,
    ];

    /// Stable key used in storage and on the command line.
    pub const fn key(self) -> &'static str {
        match self {
            JobKind::AttachmentDownload => "attachment_download",
            JobKind::AttachmentUpload => "attachment_upload",
            JobKind::MessageReceive => "message_receive",
            JobKind::MessageSend => "message_send",
            JobKind::NotifyPushServer => "notify_push_server",
        }
    }

    /// Default ceiling on failed attempts before a job is given up on.
    pub const fn max_failure_count(self) -> u32 {
        match self {
            JobKind::AttachmentDownload | JobKind::AttachmentUpload => 20,
            JobKind::MessageReceive | JobKind::MessageSend => 10,
            JobKind::NotifyPushServer => 20,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.key() == normalized)
            .ok_or_else(|| UnknownJobKind(s.to_string()))
    }
}

/// Lifecycle status of a job record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be executed (or re-executed after a retry delay).
    #[default]
    Pending,
    /// Currently executing. Never written to storage.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Failed permanently or ran out of retries.
    Failed,
    /// Canceled by the owner of the store.
    Canceled,
}

impl JobStatus {
    /// Returns true if no further execution can follow this status.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        })
    }
}

/// What a recoverable failure did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Still under the ceiling; the job should be retried.
    Retry,
    /// This failure reached the ceiling; the record is now `Failed`.
    Exhausted,
    /// The record was already terminal and was left untouched.
    AlreadyTerminal,
}

/// A persisted unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Submission-ordered identifier.
    pub id: JobId,
    /// Which job variant this is.
    pub kind: JobKind,
    /// Job-specific state, never interpreted by the dispatcher.
    pub payload: Value,
    /// Number of failed execution attempts so far.
    pub failure_count: u32,
    /// Failed attempts allowed before the job is given up on.
    pub max_failure_count: u32,
    /// Current status.
    pub status: JobStatus,
    /// When the job was submitted.
    pub created_at: DateTime<Utc>,
    /// Message of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Create a new pending record using the kind's default retry ceiling.
    pub fn new(id: JobId, kind: JobKind, payload: Value) -> Self {
        Self {
            id,
            kind,
            payload,
            failure_count: 0,
            max_failure_count: kind.max_failure_count(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            last_error: None,
        }
    }

    /// Override the retry ceiling.
    pub fn with_max_failure_count(mut self, max_failure_count: u32) -> Self {
        self.max_failure_count = max_failure_count;
        self
    }

    /// Count a recoverable failure.
    ///
    /// The record goes back to `Pending` while it is under its ceiling and
    /// becomes `Failed` on the failure that reaches it.
    pub fn record_failure(&mut self, error: &str) -> FailureDisposition {
        if self.status.is_terminal() {
            return FailureDisposition::AlreadyTerminal;
        }

        self.failure_count = self.failure_count.saturating_add(1);
        self.last_error = Some(error.to_string());

        if self.failure_count >= self.max_failure_count {
            self.status = JobStatus::Failed;
            FailureDisposition::Exhausted
        } else {
            self.status = JobStatus::Pending;
            FailureDisposition::Retry
        }
    }

    /// Count a failure that must not be retried.
    ///
    /// Returns false if the record was already terminal.
    pub fn record_permanent_failure(&mut self, error: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        self.failure_count = self.failure_count.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.status = JobStatus::Failed;
        true
    }

    /// Mark the record as finished successfully.
    ///
    /// Returns false if the record was already terminal.
    pub fn record_success(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        self.status = JobStatus::Succeeded;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(max_failure_count: u32) -> JobRecord {
        JobRecord::new(JobId::new(1, 0), JobKind::MessageSend, json!({"to": "alice"}))
            .with_max_failure_count(max_failure_count)
    }

    #[test]
    fn test_new_record_defaults() {
        let record = JobRecord::new(JobId::new(1, 0), JobKind::AttachmentDownload, json!(null));
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.max_failure_count, 20);
        assert!(record.last_error.is_none());
    }

    #[test]
    fn test_failure_reaches_ceiling_exactly() {
        let mut record = record(3);
        assert_eq!(record.record_failure("timeout"), FailureDisposition::Retry);
        assert_eq!(record.record_failure("timeout"), FailureDisposition::Retry);
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.record_failure("timeout"), FailureDisposition::Exhausted);
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failure_count, 3);
    }

    #[test]
    fn test_failed_record_is_immutable() {
        let mut record = record(1);
        assert_eq!(record.record_failure("boom"), FailureDisposition::Exhausted);
        assert_eq!(
            record.record_failure("again"),
            FailureDisposition::AlreadyTerminal
        );
        assert!(!record.record_permanent_failure("again"));
        assert!(!record.record_success());
        assert_eq!(record.failure_count, 1);
        assert_eq!(record.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_permanent_failure_ignores_ceiling() {
        let mut record = record(5);
        assert!(record.record_permanent_failure("bad request"));
        assert_eq!(record.failure_count, 1);
        assert_eq!(record.status, JobStatus::Failed);
    }

    #[test]
    fn test_running_record_returns_to_pending_on_retry() {
        let mut record = record(3);
        record.status = JobStatus::Running;
        assert_eq!(record.record_failure("io"), FailureDisposition::Retry);
        assert_eq!(record.status, JobStatus::Pending);
    }

    #[test]
    fn test_kind_keys_parse() {
        for kind in JobKind::ALL {
            assert_eq!(kind.key().parse::<JobKind>().unwrap(), kind);
        }
        assert_eq!(
            "Message-Send".parse::<JobKind>().unwrap(),
            JobKind::MessageSend
        );
        assert!("message_delete".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_kind_serde_matches_key() {
        for kind in JobKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, json!(kind.key()));
        }
    }

    #[test]
    fn test_record_json_shape() {
        let record = record(3);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], json!("000000000000100000"));
        assert_eq!(value["kind"], json!("message_send"));
        assert_eq!(value["status"], json!("pending"));
        assert!(value.get("last_error").is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }
}
