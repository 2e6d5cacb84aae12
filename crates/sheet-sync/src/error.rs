use std::time::Duration;

use thiserror::Error;

use crate::identity::CellIdentity;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("commit of {identity} rejected: {reason}")]
    CommitRejected {
        identity: CellIdentity,
        reason: String,
    },
    #[error("commit of {identity} timed out after {timeout:?}")]
    CommitTimeout {
        identity: CellIdentity,
        timeout: Duration,
    },
    #[error("change feed failure: {0}")]
    Subscription(String),
    #[error("snapshot fetch failed: {0}")]
    Snapshot(String),
    #[error("cell ({row}, {col}) outside the {max_rows}x{max_cols} grid")]
    OutOfBounds {
        row: u32,
        col: u32,
        max_rows: u32,
        max_cols: u32,
    },
    #[error("sheet session closed")]
    SessionClosed,
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("base url cannot carry a path: {0}")]
    InvalidBaseUrl(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::CommitRejected { .. } => "rejected",
            SyncError::CommitTimeout { .. } => "timeout",
            SyncError::Subscription(_) => "subscription",
            SyncError::Snapshot(_) => "snapshot",
            SyncError::OutOfBounds { .. } => "bounds",
            SyncError::SessionClosed => "closed",
            SyncError::Http(_) => "http",
            SyncError::UnexpectedStatus { .. } => "status",
            SyncError::Decode(_) => "decode",
            SyncError::InvalidBaseUrl(_) => "config",
        }
    }
}
