//! Error types shared across adapters, storage and the sync pipeline.

use serde::Serialize;
use thiserror::Error;

use crate::models::Source;

/// Failures internal to a source adapter.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Required field missing: {0}")]
    Missing(String),
}

impl From<serde_json::Error> for SourceError {
    fn from(e: serde_json::Error) -> Self {
        SourceError::Parse(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Record not found: {0}")]
    Missing(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    #[error("Storage task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Blob I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to fetch blob source: {0}")]
    Fetch(#[from] SourceError),

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob path: {0}")]
    InvalidPath(String),
}

/// Errors surfaced to callers of the pipeline.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Failed to fetch from {origin}: {reason}")]
    SourceFetch {
        origin: Source,
        #[source]
        reason: SourceError,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Work {0} has no external sources")]
    NoSourceBound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to build {origin} adapter: {reason}")]
    AdapterInit {
        origin: Source,
        #[source]
        reason: SourceError,
    },

    #[error("Reconciliation conflict on {0}")]
    ReconciliationConflict(String),

    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Storage failure: {0}")]
    Store(#[from] StoreError),

    #[error("Blob storage failure: {0}")]
    Blob(#[from] BlobError),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Coarse classification used to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadInput,
    NotFound,
    Upstream,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::BadInput => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Upstream => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Internal => 500,
        }
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::NoSourceBound(_) | AppError::InvalidInput(_) => ErrorKind::BadInput,
            // Unknown identifiers only reach the registry through caller input.
            AppError::Configuration(_) => ErrorKind::BadInput,
            AppError::SourceFetch { .. } => ErrorKind::Upstream,
            AppError::Blob(BlobError::Fetch(_)) => ErrorKind::Upstream,
            AppError::Cancelled => ErrorKind::Timeout,
            AppError::AdapterInit { .. }
            | AppError::ReconciliationConflict(_)
            | AppError::Store(_)
            | AppError::Blob(_) => ErrorKind::Internal,
        }
    }

    pub fn source_fetch(origin: Source, reason: SourceError) -> Self {
        AppError::SourceFetch { origin, reason }
    }
}
