use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::ErrorCode;
use thiserror::Error;

/// The database worker is no longer accepting tasks.
#[derive(Debug, Error)]
pub enum DatabaseUnavailable {
    #[error("database thread is not running")]
    WorkerGone,
    #[error("database thread terminated unexpectedly")]
    WorkerTerminated,
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
    )
}

/// Whether a store error means the store itself is unusable, as opposed to a
/// single statement failing.
pub fn is_fatal_store_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.downcast_ref::<DatabaseUnavailable>().is_some() {
            return true;
        }
        match cause.downcast_ref::<rusqlite::Error>() {
            Some(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
                failure.code,
                ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::ReadOnly
                    | ErrorCode::PermissionDenied
            ),
            _ => false,
        }
    })
}
