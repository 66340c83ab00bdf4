//! Error types for the batch scheduler.
//!
//! Row-local and cascading failures never show up here: they become text in
//! the result artifact. What remains is either a rejected submission or an
//! infrastructure failure the caller of the drain step has to handle.

use thiserror::Error;

use super::types::JobType;
use crate::db::DatabaseError;
use crate::source::SourceError;

/// Whole-submission rejection. No job exists when one of these is returned.
#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("No checker registered for job type {0}")]
    NotRegistered(JobType),

    #[error("Job type {0} requires an argument")]
    MissingArgument(JobType),

    #[error("Invalid submitter address: {0}")]
    InvalidSubmitter(String),

    #[error("Unrecognized batch file: {0}")]
    UnrecognizedFormat(String),
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Submission rejected: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Result file error: {0}")]
    Output(#[from] std::io::Error),

    #[error("Could not read batch file: {0}")]
    Source(SourceError),

    #[error("Lease on job {job_id} was lost to another worker")]
    LeaseLost { job_id: i64 },

    #[error("No job with result id {0}")]
    JobNotFound(String),
}

impl BatchError {
    /// Failures tied to one job (its stored row, its checker, its result
    /// file) rather than to the queue as a whole.
    pub fn is_job_scoped(&self) -> bool {
        match self {
            Self::Submission(_) | Self::Output(_) => true,
            Self::Database(e) => matches!(
                e,
                DatabaseError::NotFound { .. }
                    | DatabaseError::InvalidEnum { .. }
                    | DatabaseError::Serialization(_)
            ),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for BatchError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::Sqlite(e))
    }
}

impl From<SourceError> for BatchError {
    fn from(e: SourceError) -> Self {
        if matches!(e, SourceError::Io(_)) {
            return Self::Source(e);
        }
        Self::Submission(SubmissionError::UnrecognizedFormat(e.to_string()))
    }
}

/// Failure reported by a checker implementation. Always row-local.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct CheckerError(pub String);

impl CheckerError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}
