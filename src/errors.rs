//! Typed failure classification for the error handler (spec.md S4.5).
//!
//! Mirrors the teacher's `HttpStatusError` shape: a small struct carried
//! through `anyhow::Error` and downcast at the call site, rather than a
//! `thiserror` hierarchy.

use std::fmt;

use anyhow::anyhow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Local disk full (`ENOSPC`-equivalent).
    DiskFull,
    /// Remote quota exceeded (HTTP 413).
    QuotaExceeded,
    /// Remote probe returned 400: client revoked.
    Revoked,
    /// Remote probe returned 403: wrong permissions.
    WrongPermissions,
    /// Remote is unreachable; caller should enter the offline wait loop.
    Offline,
    /// A `put` failed because the stored rev no longer matches.
    Conflict,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SyncError::DiskFull => "No more disk space",
            SyncError::QuotaExceeded => "Cozy is full",
            SyncError::Revoked => "Client has been revoked",
            SyncError::WrongPermissions => "Client has wrong permissions",
            SyncError::Offline => "remote is offline",
            SyncError::Conflict => "revision conflict",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for SyncError {}

/// Downcasts an `anyhow::Error` to a `SyncError` if the failure carries one,
/// the same pattern the teacher uses to recover `HttpStatusError` out of a
/// generic `anyhow::Result`.
pub fn classify(err: &anyhow::Error) -> Option<&SyncError> {
    err.downcast_ref::<SyncError>()
}

pub fn disk_full() -> anyhow::Error {
    anyhow!(SyncError::DiskFull)
}

pub fn quota_exceeded() -> anyhow::Error {
    anyhow!(SyncError::QuotaExceeded)
}

/// Fatal classification errors the engine cannot recover from: the
/// document's docType was neither `file` nor `folder` (spec.md S4.4 first
/// match in the decision table), or the no-progress loop guard tripped
/// (SPEC_FULL.md S9 Open Questions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    UnknownDocType { id: String },
    NoProgress { iterations: u32 },
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::UnknownDocType { id } => {
                write!(f, "fatal classification error: unknown docType for {id}")
            }
            FatalError::NoProgress { iterations } => {
                write!(f, "sync loop made no progress for {iterations} consecutive iterations")
            }
        }
    }
}

impl std::error::Error for FatalError {}
