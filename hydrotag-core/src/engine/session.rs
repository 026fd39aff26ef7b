//! Per-session state shared by the producer, the consumer and the engine.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::geometry::{ResolvedGeometry, SampleGeometry};
use crate::ipc::events::OverflowLocation;

/// One acquisition run, from priming to teardown.
#[derive(Debug)]
pub struct AcquisitionSession {
    pub resolved: ResolvedGeometry,
    pub blocks_per_page: usize,
    pub start_timestamp: DateTime<Utc>,
    started: Instant,
    current_file: Mutex<Option<PathBuf>>,
    bytes_in_file: AtomicU64,
    overflow: Mutex<Option<OverflowLocation>>,
    producer_finished: AtomicBool,
    note: Mutex<Option<String>>,
}

/// Serializable view for status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub geometry: SampleGeometry,
    pub start_timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub block_bytes: usize,
    pub blocks_per_page: usize,
    pub block_fill_interval_us: u64,
    pub file_rotation_bytes: u64,
    pub current_file: Option<PathBuf>,
    pub bytes_in_file: u64,
    pub overflow_flag: bool,
    pub overflow_location: Option<OverflowLocation>,
}

impl AcquisitionSession {
    pub fn new(resolved: ResolvedGeometry, blocks_per_page: usize) -> Self {
        Self {
            resolved,
            blocks_per_page,
            start_timestamp: Utc::now(),
            started: Instant::now(),
            current_file: Mutex::new(None),
            bytes_in_file: AtomicU64::new(0),
            overflow: Mutex::new(None),
            producer_finished: AtomicBool::new(false),
            note: Mutex::new(None),
        }
    }

    pub fn geometry(&self) -> &SampleGeometry {
        &self.resolved.geometry
    }

    pub fn set_current_file(&self, path: Option<&Path>) {
        *self.current_file.lock() = path.map(Path::to_path_buf);
        self.bytes_in_file.store(0, Ordering::Relaxed);
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        self.current_file.lock().clone()
    }

    pub fn add_file_bytes(&self, bytes: u64) -> u64 {
        self.bytes_in_file.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub fn bytes_in_file(&self) -> u64 {
        self.bytes_in_file.load(Ordering::Relaxed)
    }

    /// Record the first overflow of the session; later ones are ignored.
    pub fn declare_overflow(&self, location: OverflowLocation) {
        self.overflow.lock().get_or_insert(location);
    }

    pub fn overflow_location(&self) -> Option<OverflowLocation> {
        *self.overflow.lock()
    }

    pub fn overflow_flag(&self) -> bool {
        self.overflow_location().is_some()
    }

    /// Producer has left the stream loop and will write no more blocks.
    pub fn mark_producer_finished(&self) {
        self.producer_finished.store(true, Ordering::Release);
    }

    pub fn producer_finished(&self) -> bool {
        self.producer_finished.load(Ordering::Acquire)
    }

    /// Queue a free-text note for the next audit row (replaces any pending one).
    pub fn set_note(&self, note: String) {
        *self.note.lock() = Some(note);
    }

    pub fn take_note(&self) -> Option<String> {
        self.note.lock().take()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            geometry: self.resolved.geometry,
            start_timestamp: self.start_timestamp,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            block_bytes: self.resolved.block_bytes,
            blocks_per_page: self.blocks_per_page,
            block_fill_interval_us: self.resolved.block_fill_interval_us(),
            file_rotation_bytes: self.resolved.file_rotation_bytes,
            current_file: self.current_file(),
            bytes_in_file: self.bytes_in_file(),
            overflow_flag: self.overflow_flag(),
            overflow_location: self.overflow_location(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{resolve, FilterType, DEFAULT_BASE_FILE_BYTES};

    fn session() -> AcquisitionSession {
        let g = SampleGeometry::new(16, 96_000, 3, FilterType::Wideband).unwrap();
        AcquisitionSession::new(resolve(g, DEFAULT_BASE_FILE_BYTES), 8)
    }

    #[test]
    fn first_overflow_location_wins() {
        let s = session();
        assert!(!s.overflow_flag());
        s.declare_overflow(OverflowLocation::MidTransfer);
        s.declare_overflow(OverflowLocation::BeforeWait);
        assert_eq!(s.overflow_location(), Some(OverflowLocation::MidTransfer));
    }

    #[test]
    fn note_is_consumed_once() {
        let s = session();
        s.set_note("tag on animal".into());
        assert_eq!(s.take_note().as_deref(), Some("tag on animal"));
        assert_eq!(s.take_note(), None);
    }

    #[test]
    fn file_counter_resets_with_new_file() {
        let s = session();
        s.set_current_file(Some(Path::new("/tmp/a.wav")));
        assert_eq!(s.add_file_bytes(10), 10);
        assert_eq!(s.add_file_bytes(5), 15);
        s.set_current_file(Some(Path::new("/tmp/b.wav")));
        assert_eq!(s.bytes_in_file(), 0);

        let json = serde_json::to_value(s.snapshot()).unwrap();
        assert_eq!(json["blocksPerPage"], 8);
        assert_eq!(json["geometry"]["channelCount"], 3);
        assert_eq!(json["currentFile"], "/tmp/b.wav");
    }
}
