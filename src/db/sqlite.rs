use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};

use super::DatabaseError;

/// Busy timeout used when the caller does not supply one.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Open a SQLite connection to the given path and run migrations.
///
/// Several workers may open the same file; writers wait up to
/// `busy_timeout` for each other instead of failing with `SQLITE_BUSY`.
pub fn open_database(path: &Path, busy_timeout: Duration) -> Result<Connection, DatabaseError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (for testing)
pub fn open_memory_database() -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    configure_pragmas(&conn)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "PRAGMA journal_mode=DELETE;
         PRAGMA foreign_keys=ON;"
    )?;
    Ok(())
}

/// Run all pending migrations.
///
/// Each migration runs in its own write transaction that re-reads the version
/// first, so workers opening a fresh database together apply it once and a
/// crash never leaves half a migration behind.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let migrations: Vec<(i64, &str)> = vec![
        (1, include_str!("../../resources/migrations/001_batch_jobs.sql")),
        (2, include_str!("../../resources/migrations/002_cascade_state.sql")),
    ];

    for (version, sql) in migrations {
        if version <= get_current_version(conn) {
            continue;
        }

        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        if version <= get_current_version(&tx) {
            // Another connection applied it while we waited for the lock.
            continue;
        }
        tracing::info!("Running migration v{version}");
        tx.execute_batch(sql)
            .and_then(|()| tx.commit())
            .map_err(|e| DatabaseError::MigrationFailed {
                version,
                reason: e.to_string(),
            })?;
    }

    Ok(())
}

/// Get the current schema version (0 if no schema exists yet)
fn get_current_version(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get::<_, i64>(0),
    )
    .unwrap_or(0)
}

/// Count tables in the database (for verification)
pub fn count_tables(conn: &Connection) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}
