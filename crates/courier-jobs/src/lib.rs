//! Durable job dispatcher for Courier.
//!
//! This crate provides the background-work engine that:
//! - Persists every job before it becomes visible for execution
//! - Executes admitted jobs one at a time, in admission order
//! - Retries recoverable failures with capped exponential backoff
//! - Replays pending work exactly once after a process restart

mod backoff;
mod config;
mod delegate;
mod dispatcher;
mod error;
mod id;
mod memory;
mod retry;
mod store;
mod types;

pub use backoff::BackoffPolicy;
pub use config::DispatcherConfig;
pub use delegate::{JobContext, JobDelegate, JobHandler, JobHandlers, JobOutcome, JobReporter};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, InvalidJobId, StoreError, UnknownJobKind};
pub use id::{JobId, JobIdAllocator};
pub use memory::{MemoryJobStore, StoreCall};
pub use store::JobStore;
pub use types::{FailureDisposition, JobKind, JobRecord, JobStatus};
