//! On-disk persistence for Courier jobs.
//!
//! Implements the [`courier_jobs::JobStore`] port with one JSON file per
//! job record, so pending work survives a process restart.

mod file;

pub use file::FileJobStore;
