//! Scheduler: job submission and the drain step.
//!
//! The drain step is meant to be called repeatedly by something outside
//! (`trigger`, a cron job, a request handler). Each call claims whole jobs
//! by lease, oldest first, and works through their queue items in order
//! until the budget runs out or nothing is pending.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use rusqlite::Connection;
use uuid::Uuid;

use super::cascade::{CascadeDecision, CascadeState, CascadeUpdate};
use super::entry::{scheduler_message, screen, Screening};
use super::error::{BatchError, SubmissionError};
use super::registry::CheckerRegistry;
use super::store::SqliteJobStore;
use super::traits::{Checker, JobStore};
use super::types::*;
use super::writer::{artifact_path, ResultWriter, RowWrite};
use crate::config::SchedulerConfig;
use crate::db::{open_database, DatabaseError};
use crate::source::{FileRowSource, RowSource};

/// Separator between the messages of one output row.
const MESSAGE_SEPARATOR: &str = "|";

static SUBMITTER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

/// Output of one queue item, ready to be written.
#[derive(Debug)]
struct ProcessedRow {
    fields: Vec<String>,
    update: CascadeUpdate,
    skipped: bool,
}

impl ProcessedRow {
    fn new(first_field: &str, messages: &[String], columns: Vec<String>) -> Self {
        let mut fields = Vec::with_capacity(columns.len() + 2);
        fields.push(first_field.to_string());
        fields.push(messages.join(MESSAGE_SEPARATOR));
        fields.extend(columns);
        Self {
            fields,
            update: CascadeUpdate::default(),
            skipped: false,
        }
    }
}

pub struct Scheduler {
    conn: Connection,
    store: Box<dyn JobStore>,
    registry: Arc<CheckerRegistry>,
    source: Box<dyn RowSource>,
    config: SchedulerConfig,
    worker_id: String,
}

impl Scheduler {
    /// Open the database named by `config` and use the SQLite job store.
    pub fn open(config: SchedulerConfig, registry: Arc<CheckerRegistry>) -> Result<Self, BatchError> {
        let conn = open_database(&config.database_path, config.busy_timeout)?;
        Ok(Self::new(conn, Box::new(SqliteJobStore::new()), registry, config))
    }

    pub fn new(
        conn: Connection,
        store: Box<dyn JobStore>,
        registry: Arc<CheckerRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let source = Box::new(FileRowSource::new(config.max_upload_bytes));
        Self {
            conn,
            store,
            registry,
            source,
            config,
            worker_id: Uuid::new_v4().to_string(),
        }
    }

    /// Replace the Row Source used by `submit_upload`.
    pub fn with_row_source(mut self, source: Box<dyn RowSource>) -> Self {
        self.source = source;
        self
    }

    /// Lease owner name of this scheduler.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Create a job with one queue item per row and return its result id.
    ///
    /// `columns` are the input column headers; the stored header adds the
    /// messages column and the checker's output columns. Rows are not
    /// validated here.
    pub fn submit_job(
        &self,
        submitter: &str,
        rows: &[String],
        columns: &[String],
        job_type: &str,
        argument: Option<&str>,
    ) -> Result<String, BatchError> {
        if !SUBMITTER_PATTERN.is_match(submitter) {
            return Err(SubmissionError::InvalidSubmitter(submitter.to_string()).into());
        }
        let job_type = self.registry.resolve(job_type)?;
        let argument = self.registry.validate_argument(job_type, argument)?;
        let header = self.registry.output_header(job_type, columns)?;

        let new_job = NewJob {
            result_id: Uuid::new_v4().simple().to_string(),
            submitter: submitter.to_string(),
            job_type,
            argument,
            columns: header,
        };

        // Header first, so even a job without rows has its artifact.
        let writer = ResultWriter::open(&self.config.results_dir, &new_job.result_id, &new_job.columns)?;
        let job = match self.store.insert_job(&self.conn, &new_job, rows) {
            Ok(job) => job,
            Err(e) => {
                let _ = std::fs::remove_file(writer.path());
                return Err(e.into());
            }
        };

        tracing::info!(
            job_id = job.id,
            result_id = %job.result_id,
            job_type = %job.job_type,
            rows = job.row_count,
            "Batch job submitted"
        );
        Ok(job.result_id)
    }

    /// Parse an uploaded batch file and submit its rows.
    pub fn submit_upload(
        &self,
        submitter: &str,
        bytes: &[u8],
        job_type: &str,
        argument: Option<&str>,
    ) -> Result<String, BatchError> {
        let parsed = self.source.parse(bytes)?;
        self.submit_job(submitter, &parsed.rows, &parsed.columns, job_type, argument)
    }

    /// Drain pending queue items until the budget is spent or nothing is left.
    ///
    /// Only jobs whose type this scheduler has a checker for are claimed.
    /// Row-level failures end up in the result artifacts. A job that cannot be
    /// worked on is left leased and skipped until its lease expires. An `Err`
    /// means a failure of the queue itself; the item being worked on stays
    /// queued and is retried by a later call.
    pub fn process(&self, budget: DrainBudget) -> Result<DrainReport, BatchError> {
        let mut clock = budget.start();
        let mut report = DrainReport::default();
        let job_types = self.registry.job_types();

        while !clock.exhausted() {
            let Some(mut lease) = self.store.claim_job(
                &self.conn,
                &self.worker_id,
                &job_types,
                now_ms(),
                self.lease_ms(),
            )?
            else {
                break;
            };
            report.jobs_claimed += 1;

            match self.drain_job(&mut lease, &mut clock, &mut report) {
                Ok(()) => self.release(&lease),
                Err(BatchError::LeaseLost { job_id }) => {
                    tracing::warn!(job_id, worker = %self.worker_id, "Lease taken over by another worker");
                }
                Err(e) if e.is_job_scoped() => {
                    tracing::warn!(
                        job_id = lease.job_id,
                        error = %e,
                        retry_after_ms = lease.expires_at_ms - now_ms(),
                        "Deferring job"
                    );
                    report.jobs_deferred += 1;
                }
                Err(e) => {
                    self.release(&lease);
                    return Err(e);
                }
            }
        }

        if !report.is_idle() {
            tracing::info!(
                items = report.items_processed,
                skipped = report.items_skipped,
                jobs = report.jobs_claimed,
                deferred = report.jobs_deferred,
                completed = report.jobs_completed.len(),
                "Drain step finished"
            );
        }
        Ok(report)
    }

    fn release(&self, lease: &JobLease) {
        if let Err(e) = self.store.release_job(&self.conn, lease) {
            tracing::warn!(job_id = lease.job_id, error = %e, "Failed to release job lease");
        }
    }

    fn drain_job(
        &self,
        lease: &mut JobLease,
        clock: &mut BudgetClock,
        report: &mut DrainReport,
    ) -> Result<(), BatchError> {
        let job = self
            .store
            .get_job(&self.conn, lease.job_id)?
            .ok_or_else(|| DatabaseError::NotFound {
                entity_type: "Job".into(),
                id: lease.job_id.to_string(),
            })?;
        let checker = self
            .registry
            .get(job.job_type)
            .ok_or(SubmissionError::NotRegistered(job.job_type))?;

        let mut cascade = self.store.load_cascade(&self.conn, job.id)?;
        let mut writer = ResultWriter::open(&self.config.results_dir, &job.result_id, &job.columns)?;
        tracing::debug!(
            job_id = job.id,
            result_id = %job.result_id,
            rows_written = writer.rows_written(),
            skips = cascade.skip_count(),
            substitutions = cascade.substitution_count(),
            "Claimed job"
        );

        loop {
            let items = self
                .store
                .pending_items(&self.conn, job.id, self.config.claim_chunk.max(1))?;
            if items.is_empty() {
                return Ok(());
            }

            for item in items {
                if clock.exhausted() {
                    return Ok(());
                }

                let row = self.process_item(&job, checker, &cascade, &item);

                // The checker may have outlived the lease; a worker that took
                // the job over owns the artifact now.
                let renewed_until = now_ms() + self.lease_ms();
                if !self.store.renew_lease(&self.conn, lease, renewed_until)? {
                    return Err(BatchError::LeaseLost { job_id: job.id });
                }
                lease.expires_at_ms = renewed_until;

                if writer.write_row(item.order_index, &row.fields)? == RowWrite::AlreadyPresent {
                    tracing::debug!(
                        job_id = job.id,
                        order_index = item.order_index,
                        "Row already in artifact, completing item"
                    );
                }

                let renewed_until = now_ms() + self.lease_ms();
                let remaining = self
                    .store
                    .complete_item(&self.conn, lease, &item, &row.update, renewed_until)?
                    .ok_or(BatchError::LeaseLost { job_id: job.id })?;
                lease.expires_at_ms = renewed_until;
                cascade.apply(&row.update);

                clock.spend_item();
                report.items_processed += 1;
                if row.skipped {
                    report.items_skipped += 1;
                }

                if remaining == 0 {
                    tracing::info!(
                        job_id = job.id,
                        result_id = %job.result_id,
                        rows = job.row_count,
                        "Batch job completed"
                    );
                    report.jobs_completed.push(job.result_id.clone());
                    return Ok(());
                }
            }
        }
    }

    /// Screen, consult the cascade, run the checker and build the output row.
    fn process_item(
        &self,
        job: &Job,
        checker: &dyn Checker,
        cascade: &CascadeState,
        item: &QueueItem,
    ) -> ProcessedRow {
        let line = item.line.as_str();

        if let Screening::Rejected { first_field, outcome } = screen(line, self.config.max_entry_length) {
            tracing::debug!(job_id = job.id, order_index = item.order_index, "Row rejected by screening");
            let first = first_field.as_deref().unwrap_or(line);
            return ProcessedRow::new(first, &outcome.messages, Vec::new());
        }

        let mut messages = Vec::new();
        let mut entry = line.to_string();

        if let Some(reference) = checker.reference_of(line) {
            match cascade.decide(line, &reference) {
                CascadeDecision::Proceed => {}
                CascadeDecision::Skip => {
                    tracing::debug!(
                        job_id = job.id,
                        order_index = item.order_index,
                        reference = %reference.base,
                        "Skipping entry"
                    );
                    let mut row =
                        ProcessedRow::new(line, &[scheduler_message("Skipping entry")], Vec::new());
                    row.skipped = true;
                    return row;
                }
                CascadeDecision::Substitute {
                    entry: rewritten,
                    resolved,
                } => {
                    tracing::debug!(
                        job_id = job.id,
                        order_index = item.order_index,
                        reference = %reference.base,
                        resolved = %resolved,
                        "Substituting reference"
                    );
                    entry = rewritten;
                    messages.push(scheduler_message("Entry altered before execution"));
                }
            }
        }

        let outcome = run_checker(checker, &entry, job.argument.as_deref());
        messages.extend(outcome.messages);

        let update = cascade.update_for(&outcome.signal);
        if let Some(base) = &update.skip {
            tracing::info!(job_id = job.id, reference = %base, "Registering skip");
            messages.push(scheduler_message(format!(
                "All further occurrences with '{base}' will be skipped"
            )));
        }
        if let Some((base, resolved)) = &update.substitution {
            tracing::info!(job_id = job.id, reference = %base, resolved = %resolved, "Registering substitution");
            messages.push(scheduler_message(format!(
                "All further occurrences of {base} will be substituted by {resolved}"
            )));
        }

        let mut row = ProcessedRow::new(line, &messages, outcome.columns);
        row.update = update;
        row
    }

    /// Remaining and total items of a job.
    pub fn progress(&self, result_id: &str) -> Result<JobProgress, BatchError> {
        let job = self.find(result_id)?;
        let remaining = self.store.count_items(&self.conn, job.id)?;
        Ok(JobProgress {
            result_id: job.result_id,
            total: job.row_count,
            remaining,
            done: remaining == 0,
        })
    }

    /// Cancel a job by deleting its remaining queue items. Rows already
    /// written stay in the artifact. Returns the number of items removed.
    pub fn abandon(&self, result_id: &str) -> Result<usize, BatchError> {
        let job = self.find(result_id)?;
        let removed = self.store.abandon_job(&self.conn, job.id)?;
        tracing::info!(job_id = job.id, result_id = %job.result_id, removed, "Batch job abandoned");
        Ok(removed)
    }

    /// Where the result artifact of `result_id` lives.
    pub fn artifact_path(&self, result_id: &str) -> PathBuf {
        artifact_path(&self.config.results_dir, result_id)
    }

    fn find(&self, result_id: &str) -> Result<Job, BatchError> {
        self.store
            .find_job(&self.conn, result_id)?
            .ok_or_else(|| BatchError::JobNotFound(result_id.to_string()))
    }

    fn lease_ms(&self) -> i64 {
        self.config.lease_duration.as_millis() as i64
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Call the checker, turning errors and panics into a row-local message.
fn run_checker(checker: &dyn Checker, entry: &str, argument: Option<&str>) -> CheckOutcome {
    let detail = match panic::catch_unwind(AssertUnwindSafe(|| checker.check(entry, argument))) {
        Ok(Ok(outcome)) => return outcome,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => panic_detail(payload.as_ref()),
    };
    tracing::warn!(entry, detail = %detail, "Checker failed unexpectedly");
    CheckOutcome::failed(vec![scheduler_message(format!(
        "Unexpected error while checking entry: {detail}"
    ))])
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "checker panicked".to_string()
    }
}
