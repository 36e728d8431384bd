use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::SessionState;

/// Failures of a reader session. Every variant aborts only the current poll
/// cycle.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot reach reader at {address}: {message}")]
    Connection { address: String, message: String },

    #[error("reader rejected login: {0}")]
    Auth(String),

    #[error("reader did not answer {operation} within {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("session is {0:?}, not open")]
    NotOpen(SessionState),

    #[error("reader transport failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionErrorKind {
    Connection,
    Auth,
    Timeout,
    NotOpen,
    Io,
}

impl SessionError {
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            SessionError::Connection { .. } => SessionErrorKind::Connection,
            SessionError::Auth(_) => SessionErrorKind::Auth,
            SessionError::Timeout { .. } => SessionErrorKind::Timeout,
            SessionError::NotOpen(_) => SessionErrorKind::NotOpen,
            SessionError::Io(_) => SessionErrorKind::Io,
        }
    }

    pub(crate) fn timeout(operation: &'static str, after: Duration) -> Self {
        SessionError::Timeout { operation, after }
    }
}
