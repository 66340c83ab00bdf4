//! Batch Scheduler
//!
//! Runs large submissions of independent entries (variant descriptions,
//! coordinates) through a checker, one entry at a time, and streams the
//! answers into an ordered result file per job.
//!
//! ## Architecture
//!
//! Stages connected by traits:
//! ```text
//! Row Source → submit_job → JobStore (jobs + queue items)
//!                                ↓ claim (lease)
//!          screen → CascadeState → Checker → ResultWriter → complete_item
//! ```
//!
//! ## Guarantees
//! - A job and all of its queue items are created in one transaction.
//! - A queue item is deleted only after its result row is on disk; a job is
//!   done when it has no items left.
//! - One worker at a time drains a job, so cascade decisions made on one row
//!   are seen by every later row of the same job and by no other job.
//! - Entry-level failures become text in the result file; only storage and
//!   I/O failures leave the drain step as errors.

pub mod cascade;
pub mod entry;
pub mod error;
pub mod reference;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod traits;
pub mod trigger;
pub mod types;
pub mod writer;

pub use cascade::{CascadeDecision, CascadeState, CascadeUpdate};
pub use error::{BatchError, CheckerError, SubmissionError};
pub use reference::{parse_reference, ReferenceId};
pub use registry::{CheckerRegistry, MESSAGES_COLUMN};
pub use scheduler::Scheduler;
pub use store::SqliteJobStore;
pub use traits::*;
pub use trigger::{start_drain_trigger, DrainTriggerHandle};
pub use types::*;
pub use writer::{artifact_path, ResultWriter, RowWrite};
