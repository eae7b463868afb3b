use std::time::Duration;

use thiserror::Error;

use crate::sandbox::Milestone;

/// Errors raised by a [`DataProvider`](crate::provider::DataProvider).
#[derive(Error, Debug)]
pub enum DataError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed {table} record {id}: {reason}")]
    MalformedRecord {
        table: &'static str,
        id: i64,
        reason: String,
    },
    #[error("no {table} record with id {id}")]
    NotFound { table: &'static str, id: i64 },
}

/// Errors raised by a [`StorageProvider`](crate::provider::StorageProvider).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage root {0} is not a directory")]
    InvalidRoot(String),
    #[error("storage IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Failures of the sandbox execution protocol.
///
/// Every variant is fatal for the commit being processed.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("timed out after {} ms waiting for `{milestone}`", after.as_millis())]
    TimedOut { milestone: Milestone, after: Duration },
    #[error("expected `{expected}`, got `{got}`")]
    UnexpectedMilestone { expected: Milestone, got: String },
    #[error("container output closed while waiting for `{expected}`")]
    StreamClosed { expected: Milestone },
    #[error("unexpected output `{0}` after the last milestone")]
    TrailingOutput(String),
    #[error("commit has no detected language")]
    MissingLanguage,
    #[error("container runtime command `{command}` failed: {reason}")]
    Runtime { command: String, reason: String },
    #[error("sandbox IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to persist commit: {0}")]
    Persist(#[from] DataError),
}

impl SandboxError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::TimedOut { .. })
    }
}

/// Misuse of the comparison engine.
#[derive(Error, Debug, PartialEq)]
pub enum CompareError {
    #[error("absolute error must not be negative, got {0}")]
    NegativeTolerance(f64),
}
