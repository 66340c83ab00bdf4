//! Trait definitions for the batch scheduler.
//!
//! Two traits define the module boundaries:
//! - Checker: per-job-type logic for one entry (external implementations)
//! - JobStore: persistence of jobs, queue items and cascade state

use rusqlite::Connection;

use super::cascade::{CascadeState, CascadeUpdate};
use super::error::CheckerError;
use super::reference::ReferenceId;
use super::types::*;
use crate::db::DatabaseError;

/// Whether a job type takes an argument (e.g. a genome build for conversions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentPolicy {
    Required,
    Optional,
    /// Any supplied argument is dropped at submission.
    Ignored,
}

/// Validates, names or converts a single entry for one job type.
///
/// Implementations may block on network I/O; no timeout is applied here.
pub trait Checker: Send + Sync {
    /// Which job type this checker serves.
    fn job_type(&self) -> JobType;

    fn argument_policy(&self) -> ArgumentPolicy {
        ArgumentPolicy::Ignored
    }

    /// Names of the output columns produced on success.
    fn column_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// The reference the entry depends on. `None` for job types without a
    /// cascade concept.
    fn reference_of(&self, _entry: &str) -> Option<ReferenceId> {
        None
    }

    /// Check one entry. Entry-level problems belong in the returned messages;
    /// `Err` is for unexpected internal failures.
    fn check(&self, entry: &str, argument: Option<&str>) -> Result<CheckOutcome, CheckerError>;
}

/// Durable storage for jobs and their queue items.
pub trait JobStore: Send + Sync {
    /// Create the job and all of its queue items atomically.
    fn insert_job(
        &self,
        conn: &Connection,
        job: &NewJob,
        rows: &[String],
    ) -> Result<Job, DatabaseError>;

    fn get_job(&self, conn: &Connection, job_id: i64) -> Result<Option<Job>, DatabaseError>;

    fn find_job(&self, conn: &Connection, result_id: &str) -> Result<Option<Job>, DatabaseError>;

    /// Reserve the oldest job of one of `job_types` that still has queue
    /// items and no live lease.
    fn claim_job(
        &self,
        conn: &Connection,
        owner: &str,
        job_types: &[JobType],
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Option<JobLease>, DatabaseError>;

    /// Extend a lease we still hold. `false` if another worker owns it now.
    fn renew_lease(
        &self,
        conn: &Connection,
        lease: &JobLease,
        until_ms: i64,
    ) -> Result<bool, DatabaseError>;

    /// Give up a lease. A lease held by someone else is left alone.
    fn release_job(&self, conn: &Connection, lease: &JobLease) -> Result<(), DatabaseError>;

    /// Next queue items of a job in ascending order index.
    fn pending_items(
        &self,
        conn: &Connection,
        job_id: i64,
        limit: usize,
    ) -> Result<Vec<QueueItem>, DatabaseError>;

    /// Delete an item whose result row is already durable, recording the cascade
    /// decisions it produced and renewing the lease, in one transaction.
    /// Returns the number of items the job has left, or `None` if the lease
    /// is no longer ours (nothing is changed then).
    fn complete_item(
        &self,
        conn: &Connection,
        lease: &JobLease,
        item: &QueueItem,
        update: &CascadeUpdate,
        renewed_until_ms: i64,
    ) -> Result<Option<usize>, DatabaseError>;

    fn count_items(&self, conn: &Connection, job_id: i64) -> Result<usize, DatabaseError>;

    fn load_cascade(&self, conn: &Connection, job_id: i64) -> Result<CascadeState, DatabaseError>;

    /// Delete every remaining queue item and the cascade state of a job.
    fn abandon_job(&self, conn: &Connection, job_id: i64) -> Result<usize, DatabaseError>;
}
