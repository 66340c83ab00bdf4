//! SQLite job store: jobs, queue items, leases and cascade entries.
//!
//! Queue items are only ever inserted (with their job) and deleted (after
//! their result row is durable). A job is done when it has no items left;
//! there is no status column.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::cascade::{CascadeState, CascadeUpdate};
use super::traits::JobStore;
use super::types::*;
use crate::db::DatabaseError;

const KIND_SKIP: &str = "skip";
const KIND_SUBSTITUTE: &str = "substitute";

/// SQLite-backed job store.
#[derive(Debug, Default)]
pub struct SqliteJobStore;

impl SqliteJobStore {
    pub fn new() -> Self {
        Self
    }
}

struct JobRow {
    id: i64,
    result_id: String,
    submitter: String,
    job_type: String,
    argument: Option<String>,
    columns: String,
    row_count: i64,
    created_at: i64,
}

const JOB_COLUMNS: &str =
    "id, result_id, submitter, job_type, argument, columns, row_count, created_at";

fn read_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        result_id: row.get(1)?,
        submitter: row.get(2)?,
        job_type: row.get(3)?,
        argument: row.get(4)?,
        columns: row.get(5)?,
        row_count: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn job_from_row(row: JobRow) -> Result<Job, DatabaseError> {
    Ok(Job {
        id: row.id,
        result_id: row.result_id,
        submitter: row.submitter,
        job_type: row.job_type.parse()?,
        argument: row.argument,
        columns: serde_json::from_str(&row.columns)?,
        row_count: row.row_count.max(0) as usize,
        created_at: DateTime::from_timestamp_millis(row.created_at).unwrap_or_default(),
    })
}

fn count_items_in(conn: &Connection, job_id: i64) -> Result<usize, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM queue_items WHERE job_id = ?1",
        params![job_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Write transaction that takes the database lock up front, so two workers
/// never both read a job as free and then both claim it.
fn immediate(conn: &Connection) -> Result<Transaction<'_>, DatabaseError> {
    Ok(Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?)
}

impl JobStore for SqliteJobStore {
    fn insert_job(
        &self,
        conn: &Connection,
        job: &NewJob,
        rows: &[String],
    ) -> Result<Job, DatabaseError> {
        let created_at = Utc::now();
        let columns_json = serde_json::to_string(&job.columns)?;

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO jobs (result_id, submitter, job_type, argument, columns, row_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.result_id,
                job.submitter,
                job.job_type.as_str(),
                job.argument,
                columns_json,
                rows.len() as i64,
                created_at.timestamp_millis(),
            ],
        )?;
        let job_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO queue_items (job_id, order_index, line) VALUES (?1, ?2, ?3)",
            )?;
            for (order_index, line) in rows.iter().enumerate() {
                stmt.execute(params![job_id, order_index as i64, line])?;
            }
        }
        tx.commit()?;

        Ok(Job {
            id: job_id,
            result_id: job.result_id.clone(),
            submitter: job.submitter.clone(),
            job_type: job.job_type,
            argument: job.argument.clone(),
            columns: job.columns.clone(),
            row_count: rows.len(),
            created_at,
        })
    }

    fn get_job(&self, conn: &Connection, job_id: i64) -> Result<Option<Job>, DatabaseError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        conn.query_row(&sql, params![job_id], read_job_row)
            .optional()?
            .map(job_from_row)
            .transpose()
    }

    fn find_job(&self, conn: &Connection, result_id: &str) -> Result<Option<Job>, DatabaseError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE result_id = ?1");
        conn.query_row(&sql, params![result_id], read_job_row)
            .optional()?
            .map(job_from_row)
            .transpose()
    }

    fn claim_job(
        &self,
        conn: &Connection,
        owner: &str,
        job_types: &[JobType],
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Option<JobLease>, DatabaseError> {
        if job_types.is_empty() {
            return Ok(None);
        }
        let placeholders = (0..job_types.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT j.id FROM jobs j
             WHERE EXISTS (SELECT 1 FROM queue_items q WHERE q.job_id = j.id)
               AND (j.lease_owner IS NULL OR j.lease_expires_at <= ?1)
               AND j.job_type IN ({placeholders})
             ORDER BY j.created_at ASC, j.id ASC
             LIMIT 1"
        );
        let mut values = vec![Value::Integer(now_ms)];
        values.extend(job_types.iter().map(|t| Value::Text(t.as_str().to_string())));

        let tx = immediate(conn)?;
        let job_id: Option<i64> = tx
            .query_row(&sql, params_from_iter(values), |row| row.get(0))
            .optional()?;

        let Some(job_id) = job_id else {
            return Ok(None);
        };

        let expires_at_ms = now_ms + lease_ms;
        tx.execute(
            "UPDATE jobs SET lease_owner = ?1, lease_expires_at = ?2 WHERE id = ?3",
            params![owner, expires_at_ms, job_id],
        )?;
        tx.commit()?;

        Ok(Some(JobLease {
            job_id,
            owner: owner.to_string(),
            expires_at_ms,
        }))
    }

    fn renew_lease(
        &self,
        conn: &Connection,
        lease: &JobLease,
        until_ms: i64,
    ) -> Result<bool, DatabaseError> {
        let updated = conn.execute(
            "UPDATE jobs SET lease_expires_at = ?1 WHERE id = ?2 AND lease_owner = ?3",
            params![until_ms, lease.job_id, lease.owner],
        )?;
        Ok(updated == 1)
    }

    fn release_job(&self, conn: &Connection, lease: &JobLease) -> Result<(), DatabaseError> {
        conn.execute(
            "UPDATE jobs SET lease_owner = NULL, lease_expires_at = NULL
             WHERE id = ?1 AND lease_owner = ?2",
            params![lease.job_id, lease.owner],
        )?;
        Ok(())
    }

    fn pending_items(
        &self,
        conn: &Connection,
        job_id: i64,
        limit: usize,
    ) -> Result<Vec<QueueItem>, DatabaseError> {
        let mut stmt = conn.prepare(
            "SELECT id, job_id, order_index, line FROM queue_items
             WHERE job_id = ?1
             ORDER BY order_index ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![job_id, limit as i64], |row| {
            Ok(QueueItem {
                id: row.get(0)?,
                job_id: row.get(1)?,
                order_index: row.get::<_, i64>(2)? as usize,
                line: row.get(3)?,
            })
        })?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    fn complete_item(
        &self,
        conn: &Connection,
        lease: &JobLease,
        item: &QueueItem,
        update: &CascadeUpdate,
        renewed_until_ms: i64,
    ) -> Result<Option<usize>, DatabaseError> {
        let tx = immediate(conn)?;

        let owner: Option<String> = tx
            .query_row(
                "SELECT lease_owner FROM jobs WHERE id = ?1",
                params![lease.job_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        if owner.as_deref() != Some(lease.owner.as_str()) {
            return Ok(None);
        }

        if let Some(base) = &update.skip {
            tx.execute(
                "INSERT OR IGNORE INTO cascade_entries (job_id, kind, base, resolved)
                 VALUES (?1, ?2, ?3, NULL)",
                params![lease.job_id, KIND_SKIP, base],
            )?;
        }
        if let Some((base, resolved)) = &update.substitution {
            tx.execute(
                "INSERT OR IGNORE INTO cascade_entries (job_id, kind, base, resolved)
                 VALUES (?1, ?2, ?3, ?4)",
                params![lease.job_id, KIND_SUBSTITUTE, base, resolved],
            )?;
        }

        tx.execute(
            "DELETE FROM queue_items WHERE id = ?1 AND job_id = ?2",
            params![item.id, lease.job_id],
        )?;
        tx.execute(
            "UPDATE jobs SET lease_expires_at = ?1 WHERE id = ?2 AND lease_owner = ?3",
            params![renewed_until_ms, lease.job_id, lease.owner],
        )?;

        let remaining = count_items_in(&tx, lease.job_id)?;
        if remaining == 0 {
            tx.execute(
                "DELETE FROM cascade_entries WHERE job_id = ?1",
                params![lease.job_id],
            )?;
        }
        tx.commit()?;

        Ok(Some(remaining))
    }

    fn count_items(&self, conn: &Connection, job_id: i64) -> Result<usize, DatabaseError> {
        count_items_in(conn, job_id)
    }

    fn load_cascade(&self, conn: &Connection, job_id: i64) -> Result<CascadeState, DatabaseError> {
        let mut stmt = conn.prepare(
            "SELECT kind, base, resolved FROM cascade_entries WHERE job_id = ?1",
        )?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut state = CascadeState::new();
        for row in rows {
            match row? {
                (kind, base, _) if kind == KIND_SKIP => state.insert_skip(base),
                (kind, base, Some(resolved)) if kind == KIND_SUBSTITUTE => {
                    state.insert_substitution(base, resolved)
                }
                (kind, base, _) => {
                    tracing::warn!(job_id, kind = %kind, base = %base, "Ignoring malformed cascade entry");
                }
            }
        }
        Ok(state)
    }

    fn abandon_job(&self, conn: &Connection, job_id: i64) -> Result<usize, DatabaseError> {
        let tx = conn.unchecked_transaction()?;
        let deleted = tx.execute("DELETE FROM queue_items WHERE job_id = ?1", params![job_id])?;
        tx.execute(
            "DELETE FROM cascade_entries WHERE job_id = ?1",
            params![job_id],
        )?;
        tx.execute(
            "UPDATE jobs SET lease_owner = NULL, lease_expires_at = NULL WHERE id = ?1",
            params![job_id],
        )?;
        tx.commit()?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;

    fn new_job(result_id: &str) -> NewJob {
        NewJob {
            result_id: result_id.into(),
            submitter: "test@example.com".into(),
            job_type: JobType::SyntaxChecker,
            argument: None,
            columns: vec!["Input".into(), "Errors and warnings".into()],
        }
    }

    fn rows(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn insert_creates_job_and_items() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        let job = store
            .insert_job(&conn, &new_job("r1"), &rows(&["a", "b", "c"]))
            .unwrap();

        assert_eq!(job.row_count, 3);
        assert_eq!(store.count_items(&conn, job.id).unwrap(), 3);

        let items = store.pending_items(&conn, job.id, 10).unwrap();
        let indices: Vec<usize> = items.iter().map(|i| i.order_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(items[1].line, "b");
    }

    #[test]
    fn jobs_round_trip_through_lookup() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        let mut submitted = new_job("r1");
        submitted.job_type = JobType::PositionConverter;
        submitted.argument = Some("hg19".into());
        let job = store.insert_job(&conn, &submitted, &rows(&["a"])).unwrap();

        let found = store.find_job(&conn, "r1").unwrap().unwrap();
        assert_eq!(found.id, job.id);
        assert_eq!(found.job_type, JobType::PositionConverter);
        assert_eq!(found.argument.as_deref(), Some("hg19"));
        assert_eq!(found.columns, submitted.columns);
        assert_eq!(found.created_at.timestamp_millis(), job.created_at.timestamp_millis());

        assert!(store.get_job(&conn, job.id).unwrap().is_some());
        assert!(store.find_job(&conn, "nope").unwrap().is_none());
    }

    #[test]
    fn empty_job_has_no_items() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        let job = store.insert_job(&conn, &new_job("r1"), &[]).unwrap();
        assert_eq!(store.count_items(&conn, job.id).unwrap(), 0);
        assert!(store.claim_job(&conn, "w1", JobType::all(), 0, 1000).unwrap().is_none());
    }

    #[test]
    fn duplicate_result_id_inserts_nothing() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        store.insert_job(&conn, &new_job("r1"), &rows(&["a"])).unwrap();
        assert!(store.insert_job(&conn, &new_job("r1"), &rows(&["b", "c"])).is_err());

        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM queue_items", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn claim_takes_oldest_job_and_excludes_others() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        let first = store.insert_job(&conn, &new_job("r1"), &rows(&["a"])).unwrap();
        let second = store.insert_job(&conn, &new_job("r2"), &rows(&["b"])).unwrap();

        let lease = store.claim_job(&conn, "w1", JobType::all(), 1_000, 500).unwrap().unwrap();
        assert_eq!(lease.job_id, first.id);
        assert_eq!(lease.expires_at_ms, 1_500);

        let other = store.claim_job(&conn, "w2", JobType::all(), 1_000, 500).unwrap().unwrap();
        assert_eq!(other.job_id, second.id);

        assert!(store.claim_job(&conn, "w3", JobType::all(), 1_000, 500).unwrap().is_none());
    }

    #[test]
    fn claim_only_considers_the_given_job_types() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        let mut names = new_job("r1");
        names.job_type = JobType::NameChecker;
        store.insert_job(&conn, &names, &rows(&["a"])).unwrap();
        let syntax = store.insert_job(&conn, &new_job("r2"), &rows(&["b"])).unwrap();

        let lease = store
            .claim_job(&conn, "w1", &[JobType::SyntaxChecker], 0, 500)
            .unwrap()
            .unwrap();
        assert_eq!(lease.job_id, syntax.id);
        assert!(store
            .claim_job(&conn, "w1", &[JobType::SyntaxChecker], 0, 500)
            .unwrap()
            .is_none());
        assert!(store.claim_job(&conn, "w1", &[], 0, 500).unwrap().is_none());
    }

    #[test]
    fn renewal_fails_once_the_lease_changed_hands() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        store.insert_job(&conn, &new_job("r1"), &rows(&["a"])).unwrap();

        let stale = store.claim_job(&conn, "w1", JobType::all(), 0, 500).unwrap().unwrap();
        assert!(store.renew_lease(&conn, &stale, 400).unwrap());

        store.claim_job(&conn, "w2", JobType::all(), 1_000, 500).unwrap().unwrap();
        assert!(!store.renew_lease(&conn, &stale, 1_400).unwrap());
    }

    #[test]
    fn expired_lease_can_be_reclaimed() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        let job = store.insert_job(&conn, &new_job("r1"), &rows(&["a"])).unwrap();

        store.claim_job(&conn, "w1", JobType::all(), 1_000, 500).unwrap().unwrap();
        assert!(store.claim_job(&conn, "w2", JobType::all(), 1_400, 500).unwrap().is_none());

        let taken = store.claim_job(&conn, "w2", JobType::all(), 1_500, 500).unwrap().unwrap();
        assert_eq!(taken.job_id, job.id);
        assert_eq!(taken.owner, "w2");
    }

    #[test]
    fn released_job_is_claimable_again() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        store.insert_job(&conn, &new_job("r1"), &rows(&["a"])).unwrap();

        let lease = store.claim_job(&conn, "w1", JobType::all(), 0, 500).unwrap().unwrap();
        store.release_job(&conn, &lease).unwrap();
        assert!(store.claim_job(&conn, "w2", JobType::all(), 0, 500).unwrap().is_some());
    }

    #[test]
    fn complete_item_deletes_and_records_cascade() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        let job = store.insert_job(&conn, &new_job("r1"), &rows(&["a", "b"])).unwrap();
        let lease = store.claim_job(&conn, "w1", JobType::all(), 0, 500).unwrap().unwrap();
        let items = store.pending_items(&conn, job.id, 10).unwrap();

        let update = CascadeUpdate {
            skip: Some("NM_1234567890".into()),
            substitution: Some(("NM_000059".into(), "NM_000059.3".into())),
        };
        let remaining = store
            .complete_item(&conn, &lease, &items[0], &update, 900)
            .unwrap();
        assert_eq!(remaining, Some(1));

        let state = store.load_cascade(&conn, job.id).unwrap();
        assert!(state.is_skipped("NM_1234567890"));
        assert_eq!(state.substitution_for("NM_000059"), Some("NM_000059.3"));

        let expires: i64 = conn
            .query_row("SELECT lease_expires_at FROM jobs WHERE id = ?1", [job.id], |r| r.get(0))
            .unwrap();
        assert_eq!(expires, 900);
    }

    #[test]
    fn draining_the_last_item_clears_cascade_entries() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        let job = store.insert_job(&conn, &new_job("r1"), &rows(&["a"])).unwrap();
        let lease = store.claim_job(&conn, "w1", JobType::all(), 0, 500).unwrap().unwrap();
        let items = store.pending_items(&conn, job.id, 10).unwrap();

        let update = CascadeUpdate {
            skip: Some("AB000001".into()),
            substitution: None,
        };
        let remaining = store
            .complete_item(&conn, &lease, &items[0], &update, 900)
            .unwrap();
        assert_eq!(remaining, Some(0));
        assert_eq!(store.count_items(&conn, job.id).unwrap(), 0);
        assert_eq!(store.load_cascade(&conn, job.id).unwrap(), CascadeState::new());
    }

    #[test]
    fn lost_lease_changes_nothing() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        let job = store.insert_job(&conn, &new_job("r1"), &rows(&["a"])).unwrap();
        let stale = store.claim_job(&conn, "w1", JobType::all(), 0, 500).unwrap().unwrap();
        store.claim_job(&conn, "w2", JobType::all(), 600, 500).unwrap().unwrap();

        let items = store.pending_items(&conn, job.id, 10).unwrap();
        let update = CascadeUpdate {
            skip: Some("AB000001".into()),
            substitution: None,
        };
        let result = store
            .complete_item(&conn, &stale, &items[0], &update, 1_000)
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(store.count_items(&conn, job.id).unwrap(), 1);
        assert!(!store.load_cascade(&conn, job.id).unwrap().is_skipped("AB000001"));
    }

    #[test]
    fn cascade_entries_are_job_scoped() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        let a = store.insert_job(&conn, &new_job("r1"), &rows(&["x", "y"])).unwrap();
        let b = store.insert_job(&conn, &new_job("r2"), &rows(&["x"])).unwrap();
        let lease = store.claim_job(&conn, "w1", JobType::all(), 0, 500).unwrap().unwrap();
        assert_eq!(lease.job_id, a.id);

        let items = store.pending_items(&conn, a.id, 1).unwrap();
        let update = CascadeUpdate {
            skip: Some("AB000001".into()),
            substitution: None,
        };
        store.complete_item(&conn, &lease, &items[0], &update, 900).unwrap();

        assert!(store.load_cascade(&conn, a.id).unwrap().is_skipped("AB000001"));
        assert!(!store.load_cascade(&conn, b.id).unwrap().is_skipped("AB000001"));
    }

    #[test]
    fn abandon_removes_remaining_items() {
        let conn = open_memory_database().unwrap();
        let store = SqliteJobStore::new();
        let job = store.insert_job(&conn, &new_job("r1"), &rows(&["a", "b"])).unwrap();
        assert_eq!(store.abandon_job(&conn, job.id).unwrap(), 2);
        assert_eq!(store.count_items(&conn, job.id).unwrap(), 0);
        assert!(store.get_job(&conn, job.id).unwrap().is_some());
    }
}
