use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SbdError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Path too long: {0}")]
    PathTooLong(PathBuf),

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("Fork failed for job {job_id}: {source}")]
    Fork {
        job_id: i64,
        source: nix::errno::Errno,
    },

    #[error("Corrupt job record {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("Unsupported record version {found} in {path}")]
    RecordVersion { path: PathBuf, found: i64 },

    #[error("Record {path} belongs to job {found}, expected {expected}")]
    RecordJobMismatch {
        path: PathBuf,
        expected: i64,
        found: i64,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Link to mbatchd is not ready")]
    LinkNotReady,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("Payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SbdError>;

/// Logs an internal-consistency breach and aborts the process.
///
/// Used where continuing would risk double-executing or silently losing a job.
pub fn invariant_violation(job_id: i64, what: &str) -> ! {
    tracing::error!(job_id, what, "Invariant violated, aborting");
    std::process::abort()
}
