use std::path::PathBuf;
use std::time::Duration;

/// Application-level constants
pub const APP_NAME: &str = "varbatch";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "varbatch=info"
}

/// Base directory for the queue database and result files.
/// Falls back to the working directory when the platform has no data dir.
pub fn app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Scheduler settings. Every field can be overridden from the environment.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// SQLite file shared by every worker.
    pub database_path: PathBuf,
    /// Directory holding `batch-job-<result_id>.txt` artifacts.
    pub results_dir: PathBuf,
    /// How long a claimed job stays reserved for one worker without progress.
    pub lease_duration: Duration,
    /// Queue items fetched per query while draining a job.
    pub claim_chunk: usize,
    /// Entries longer than this (in characters) are reported as malformed.
    pub max_entry_length: usize,
    /// Uploads larger than this are rejected before parsing.
    pub max_upload_bytes: u64,
    /// How long a writer waits on a locked database.
    pub busy_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let data_dir = app_data_dir();
        Self {
            database_path: data_dir.join("batch.db"),
            results_dir: data_dir.join("results"),
            lease_duration: Duration::from_secs(300),
            claim_chunk: 50,
            max_entry_length: 200,
            max_upload_bytes: 100 * 1024 * 1024,
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            database_path: std::env::var("VARBATCH_DATABASE")
                .map(PathBuf::from)
                .unwrap_or(default.database_path),
            results_dir: std::env::var("VARBATCH_RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.results_dir),
            lease_duration: env_parse("VARBATCH_LEASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.lease_duration),
            claim_chunk: env_parse("VARBATCH_CLAIM_CHUNK")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.claim_chunk),
            max_entry_length: env_parse("VARBATCH_MAX_ENTRY_LENGTH")
                .unwrap_or(default.max_entry_length),
            max_upload_bytes: env_parse("VARBATCH_MAX_UPLOAD_BYTES")
                .unwrap_or(default.max_upload_bytes),
            busy_timeout: env_parse("VARBATCH_BUSY_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.busy_timeout),
        }
    }

    /// Config rooted in a single directory (database + results), as used by tests
    /// and single-host deployments.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            database_path: dir.join("batch.db"),
            results_dir: dir.join("results"),
            ..Self::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
