//! Core types for the batch scheduler.
//!
//! These types model the full lifecycle:
//! Upload → Job + Queue items → Claim → Check → Result row → Item deletion.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;

// ═══════════════════════════════════════════
// Job Type
// ═══════════════════════════════════════════

/// The checkers a batch can run. Stored by tag in `jobs.job_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    SyntaxChecker,
    NameChecker,
    PositionConverter,
    BatchPositionConverter,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SyntaxChecker => "syntax-checker",
            Self::NameChecker => "name-checker",
            Self::PositionConverter => "position-converter",
            Self::BatchPositionConverter => "batch-position-converter",
        }
    }

    pub fn all() -> &'static [JobType] {
        &[
            Self::SyntaxChecker,
            Self::NameChecker,
            Self::PositionConverter,
            Self::BatchPositionConverter,
        ]
    }
}

impl std::str::FromStr for JobType {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DatabaseError::InvalidEnum {
                field: "JobType".into(),
                value: s.into(),
            })
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════
// Job + Queue Item (persisted)
// ═══════════════════════════════════════════

/// One submission. Immutable after creation; progress is derived from the
/// number of queue items left.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    /// Public handle naming the output artifact.
    pub result_id: String,
    pub submitter: String,
    pub job_type: JobType,
    pub argument: Option<String>,
    /// Header line of the result artifact, in order.
    pub columns: Vec<String>,
    /// Number of rows submitted.
    pub row_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to create a job; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub result_id: String,
    pub submitter: String,
    pub job_type: JobType,
    pub argument: Option<String>,
    pub columns: Vec<String>,
}

/// One pending entry of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: i64,
    pub job_id: i64,
    pub order_index: usize,
    pub line: String,
}

/// Exclusive, time-limited right of one worker to drain one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLease {
    pub job_id: i64,
    pub owner: String,
    pub expires_at_ms: i64,
}

// ═══════════════════════════════════════════
// Checker output
// ═══════════════════════════════════════════

/// Retrieval-related signal a checker reports alongside its messages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CascadeSignal {
    #[default]
    None,
    /// A bare identifier resolved to a specific version the entry did not name.
    ProvisionalSubstitution { base: String, resolved: String },
    /// The reference could not be retrieved; later entries using it are skipped.
    TerminalFailure { base: String },
}

/// Result of checking one entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckOutcome {
    pub messages: Vec<String>,
    /// Output columns; empty when the entry failed.
    pub columns: Vec<String>,
    pub signal: CascadeSignal,
}

impl CheckOutcome {
    pub fn ok(messages: Vec<String>, columns: Vec<String>) -> Self {
        Self {
            messages,
            columns,
            signal: CascadeSignal::None,
        }
    }

    pub fn failed(messages: Vec<String>) -> Self {
        Self {
            messages,
            columns: Vec::new(),
            signal: CascadeSignal::None,
        }
    }

    pub fn with_signal(mut self, signal: CascadeSignal) -> Self {
        self.signal = signal;
        self
    }
}

// ═══════════════════════════════════════════
// Drain budget + reporting
// ═══════════════════════════════════════════

/// How much work one call of the drain step may do.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainBudget {
    pub max_items: Option<usize>,
    pub max_duration: Option<Duration>,
}

impl DrainBudget {
    /// Drain until the queue is empty.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn items(max_items: usize) -> Self {
        Self {
            max_items: Some(max_items),
            max_duration: None,
        }
    }

    pub fn duration(max_duration: Duration) -> Self {
        Self {
            max_items: None,
            max_duration: Some(max_duration),
        }
    }

    pub(crate) fn start(self) -> BudgetClock {
        BudgetClock {
            remaining_items: self.max_items,
            deadline: self.max_duration.map(|d| Instant::now() + d),
        }
    }
}

/// Running form of a `DrainBudget`.
#[derive(Debug)]
pub(crate) struct BudgetClock {
    remaining_items: Option<usize>,
    deadline: Option<Instant>,
}

impl BudgetClock {
    pub(crate) fn exhausted(&self) -> bool {
        self.remaining_items == Some(0)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub(crate) fn spend_item(&mut self) {
        if let Some(n) = self.remaining_items.as_mut() {
            *n = n.saturating_sub(1);
        }
    }
}

/// What one drain call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Queue items whose result row was written and which were deleted.
    pub items_processed: usize,
    /// Of those, items answered by the skip cascade without a checker call.
    pub items_skipped: usize,
    pub jobs_claimed: usize,
    /// Claimed jobs that could not be worked on (unreadable job row, result
    /// file that cannot be opened). They keep their lease until it expires.
    pub jobs_deferred: usize,
    /// Jobs whose last queue item was deleted during this call.
    pub jobs_completed: Vec<String>,
}

impl DrainReport {
    pub fn is_idle(&self) -> bool {
        self.items_processed == 0 && self.jobs_claimed == 0
    }
}

/// Externally visible progress of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub result_id: String,
    pub total: usize,
    pub remaining: usize,
    pub done: bool,
}
