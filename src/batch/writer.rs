//! Ordered, append-only result artifact of one job.
//!
//! The artifact is TAB-delimited UTF-8 text: the header line, then one row per
//! input line in original order. Rows are appended and synced before the
//! matching queue item is deleted, so a crash between the two leaves a row
//! whose item is still queued. Every append happens under an exclusive
//! advisory lock after re-reading whatever other writers added, and
//! `write_row` refuses to write an order index that is already on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

const SCAN_CHUNK: usize = 64 * 1024;

/// Location of a job's result artifact.
pub fn artifact_path(results_dir: &Path, result_id: &str) -> PathBuf {
    results_dir.join(format!("batch-job-{result_id}.txt"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowWrite {
    Written,
    /// The artifact already holds this order index.
    AlreadyPresent,
}

#[derive(Debug)]
pub struct ResultWriter {
    path: PathBuf,
    file: File,
    /// Length of the complete lines scanned so far.
    scanned: u64,
    /// Complete lines in the artifact, header included.
    lines: usize,
}

impl ResultWriter {
    /// Open the artifact for `result_id`, creating it with `header` if needed.
    pub fn open(results_dir: &Path, result_id: &str, header: &[String]) -> io::Result<Self> {
        fs::create_dir_all(results_dir)?;
        let path = artifact_path(results_dir, result_id);

        if !path.exists() {
            create_with_header(results_dir, &path, header)?;
        }

        let file = OpenOptions::new().read(true).append(true).open(&path)?;
        let mut writer = Self {
            path,
            file,
            scanned: 0,
            lines: 0,
        };

        let _lock = ArtifactLock::acquire(&writer.file)?;
        writer.catch_up()?;
        if writer.lines == 0 {
            writer.append(&format_line(header))?;
        }
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of complete data rows in the artifact, as of the last scan.
    pub fn rows_written(&self) -> usize {
        self.lines.saturating_sub(1)
    }

    /// Append the row for `order_index` and sync it to disk.
    pub fn write_row(&mut self, order_index: usize, fields: &[String]) -> io::Result<RowWrite> {
        let _lock = ArtifactLock::acquire(&self.file)?;
        self.catch_up()?;

        if order_index < self.rows_written() {
            return Ok(RowWrite::AlreadyPresent);
        }
        if order_index > self.rows_written() {
            tracing::warn!(
                path = %self.path.display(),
                order_index,
                rows_written = self.rows_written(),
                "Rows missing before this one; were queue items removed externally?"
            );
        }

        self.append(&format_line(fields))?;
        Ok(RowWrite::Written)
    }

    fn append(&mut self, line: &str) -> io::Result<()> {
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        self.scanned += line.len() as u64;
        self.lines += 1;
        Ok(())
    }

    /// Count the lines other writers appended since the last scan. Only the
    /// unseen tail is read. A partial trailing line is left by a writer that
    /// crashed mid-row and is cut off.
    fn catch_up(&mut self) -> io::Result<()> {
        let end = self.file.metadata()?.len();
        if end < self.scanned {
            self.scanned = 0;
            self.lines = 0;
        }
        if end == self.scanned {
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(self.scanned))?;
        let mut tail = (&self.file).take(end - self.scanned);
        let mut buf = vec![0u8; SCAN_CHUNK];
        let mut offset = self.scanned;
        let mut complete = self.scanned;
        loop {
            let n = tail.read(&mut buf)?;
            if n == 0 {
                break;
            }
            for (i, byte) in buf[..n].iter().enumerate() {
                if *byte == b'\n' {
                    self.lines += 1;
                    complete = offset + i as u64 + 1;
                }
            }
            offset += n as u64;
        }

        if complete < end {
            tracing::warn!(
                path = %self.path.display(),
                dropped_bytes = end - complete,
                "Dropping partial trailing row"
            );
            self.file.set_len(complete)?;
        }
        self.scanned = complete;
        Ok(())
    }
}

/// Exclusive advisory lock on an open artifact, released on drop.
#[cfg(unix)]
struct ArtifactLock(std::os::unix::io::RawFd);

#[cfg(unix)]
impl ArtifactLock {
    fn acquire(file: &File) -> io::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let fd = file.as_raw_fd();
        // SAFETY: `fd` belongs to an open file that outlives the lock.
        let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(fd))
    }
}

#[cfg(unix)]
impl Drop for ArtifactLock {
    fn drop(&mut self) {
        // SAFETY: see `acquire`.
        unsafe {
            libc::flock(self.0, libc::LOCK_UN);
        }
    }
}

/// Without advisory locks only the lease check guards concurrent appends.
#[cfg(not(unix))]
struct ArtifactLock;

#[cfg(not(unix))]
impl ArtifactLock {
    fn acquire(_file: &File) -> io::Result<Self> {
        Ok(Self)
    }
}

fn create_with_header(dir: &Path, path: &Path, header: &[String]) -> io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(format_line(header).as_bytes())?;
    tmp.as_file().sync_all()?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(()),
        // Another writer created it first; theirs has the same header.
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.error),
    }
}

fn format_line(fields: &[String]) -> String {
    let mut line = fields
        .iter()
        .map(|f| f.replace(['\t', '\r', '\n'], " "))
        .collect::<Vec<_>>()
        .join("\t");
    line.push('\n');
    line
}
