//! Append-only CSV audit log.
//!
//! Columns:
//!
//! ```text
//! timestamp_us, rtc_seconds, notes, overflow_flag, overflow_location,
//! start_writing_marker, done_writing_marker, see_block
//! ```
//!
//! The file is opened, appended and closed for every write so a crash never
//! leaves it half-buffered. Writers take a simple busy flag; rows that fail
//! to land are kept and retried ahead of the next row.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::ipc::events::OverflowLocation;

const BUSY_BACKOFF: Duration = Duration::from_micros(200);

/// One audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRow {
    /// Microseconds since the session started.
    pub timestamp_us: u64,
    /// Wall-clock Unix seconds.
    pub rtc_seconds: i64,
    pub notes: String,
    pub overflow_flag: u8,
    /// Location code, 0 when no overflow is recorded.
    pub overflow_location: u8,
    pub start_writing_marker: u8,
    pub done_writing_marker: u8,
    /// Blocks published in the session when the row was written.
    pub see_block: u64,
}

/// Which event a row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    DrainStart,
    DrainEnd,
    Overflow(OverflowLocation),
}

pub struct StatusLog {
    path: PathBuf,
    session_start: Instant,
    busy: AtomicBool,
    backlog: Mutex<Vec<StatusRow>>,
}

impl StatusLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            session_start: Instant::now(),
            busy: AtomicBool::new(false),
            backlog: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build a row stamped with the current times.
    pub fn row(&self, kind: RowKind, notes: Option<String>, see_block: u64) -> StatusRow {
        let (overflow_flag, overflow_location) = match kind {
            RowKind::Overflow(loc) => (1, loc.code()),
            _ => (0, 0),
        };
        StatusRow {
            timestamp_us: self.session_start.elapsed().as_micros() as u64,
            rtc_seconds: chrono::Utc::now().timestamp(),
            notes: notes.unwrap_or_default(),
            overflow_flag,
            overflow_location,
            start_writing_marker: u8::from(kind == RowKind::DrainStart),
            done_writing_marker: u8::from(kind == RowKind::DrainEnd),
            see_block,
        }
    }

    /// Append `row` (after any backlog). On failure the rows stay queued.
    pub fn append(&self, row: StatusRow) -> Result<()> {
        while self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            thread::sleep(BUSY_BACKOFF);
        }
        let result = {
            let mut backlog = self.backlog.lock();
            backlog.push(row);
            let written = self.write_rows(&backlog);
            if written.is_ok() {
                backlog.clear();
            } else {
                warn!(
                    path = %self.path.display(),
                    queued = backlog.len(),
                    "status log write failed; rows kept for retry"
                );
            }
            written
        };
        self.busy.store(false, Ordering::Release);
        result
    }

    /// Rows waiting for a successful write.
    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    fn write_rows(&self, rows: &[StatusRow]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let is_new = file.metadata()?.len() == 0;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Read every row back (used by tests and offline tooling).
pub fn read_status_rows(path: &Path) -> Result<Vec<StatusRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_written_once_and_rows_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.csv");
        let log = StatusLog::new(&path);

        log.append(log.row(RowKind::DrainStart, Some("deploy".into()), 10)).unwrap();
        log.append(log.row(RowKind::DrainEnd, None, 12)).unwrap();
        log.append(log.row(RowKind::Overflow(OverflowLocation::MidTransfer), None, 14))
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text.lines().next().unwrap(),
            "timestamp_us,rtc_seconds,notes,overflow_flag,overflow_location,start_writing_marker,done_writing_marker,see_block"
        );
        assert_eq!(text.lines().count(), 4);

        let rows = read_status_rows(&path).unwrap();
        assert_eq!(rows[0].notes, "deploy");
        assert_eq!((rows[0].start_writing_marker, rows[0].done_writing_marker), (1, 0));
        assert_eq!((rows[1].start_writing_marker, rows[1].done_writing_marker), (0, 1));
        assert_eq!((rows[2].overflow_flag, rows[2].overflow_location), (1, 2));
        assert_eq!(rows[2].see_block, 14);
        assert!(rows[0].timestamp_us <= rows[2].timestamp_us);
    }

    #[test]
    fn failed_rows_are_retried_on_next_write() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the open fail.
        let path = dir.path().join("blocked.csv");
        std::fs::create_dir(&path).unwrap();
        let log = StatusLog::new(&path);

        assert!(log.append(log.row(RowKind::DrainStart, Some("first".into()), 0)).is_err());
        assert_eq!(log.backlog_len(), 1);

        std::fs::remove_dir(&path).unwrap();
        log.append(log.row(RowKind::DrainEnd, Some("second".into()), 1)).unwrap();
        assert_eq!(log.backlog_len(), 0);

        let notes: Vec<String> = read_status_rows(&path)
            .unwrap()
            .into_iter()
            .map(|r| r.notes)
            .collect();
        assert_eq!(notes, vec!["first", "second"]);
    }
}
