//! Error types for query pipelines

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Why a scan stopped before reaching the end of its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Requested,
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancellation requested"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Errors surfaced by sources and the query facade.
///
/// `SourceCorrupt` is raised per record and absorbed by the record stream;
/// every other variant aborts the whole request.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The journal or process facility could not be opened
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A single record could not be parsed
    #[error("corrupt record: {0}")]
    SourceCorrupt(String),

    #[error("query cancelled: {0}")]
    Cancelled(CancelReason),

    /// Malformed filter or bucket specification
    #[error("invalid query: {0}")]
    InvalidSpec(String),

    /// The blocking task running the pipeline failed
    #[error("query worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl QueryError {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::SourceUnavailable(_) => "source_unavailable",
            QueryError::SourceCorrupt(_) => "source_corrupt",
            QueryError::Cancelled(_) => "cancelled",
            QueryError::InvalidSpec(_) => "invalid_spec",
            QueryError::Worker(_) => "worker",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled(_))
    }

    /// Structured body for the JSON boundary.
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                kind: self.kind(),
                message: self.to_string(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub kind: &'static str,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, QueryError>;
