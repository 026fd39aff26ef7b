//! Named counting signals over shared memory.
//!
//! Each signal is a 16-byte segment holding two `AtomicU64`s:
//!
//! ```text
//! [ count | posted_total ]
//! ```
//!
//! `count` has counting-semaphore semantics (post increments, wait blocks
//! until > 0 then decrements). `posted_total` only ever grows and lets
//! read-only observers in other processes follow the producer without
//! consuming anything.
//!
//! In-process waiters are woken through a condvar; posts made by another
//! process are picked up by a short timed re-check.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::shm::{ReadOnlySegment, ShmSegment};
use crate::error::{HydroError, Result};

/// Upper bound on one condvar sleep, so cross-process posts are seen promptly.
const WAKE_SLICE: Duration = Duration::from_millis(2);

#[repr(C)]
struct SignalCells {
    count: AtomicU64,
    posted_total: AtomicU64,
}

const CELLS_BYTES: usize = std::mem::size_of::<SignalCells>();

/// A counting signal shared through a named segment.
pub struct NamedSignal {
    name: String,
    _segment: ShmSegment,
    cells: *const SignalCells,
    gate: Mutex<()>,
    wake: Condvar,
}

// SAFETY: `cells` points into `_segment`, which lives as long as `self`.
// All access to the cells goes through atomics.
unsafe impl Send for NamedSignal {}
unsafe impl Sync for NamedSignal {}

impl NamedSignal {
    /// Map (creating if absent) the signal `dir/name` and zero it.
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        let mut segment = ShmSegment::create_or_open(dir, name, CELLS_BYTES)?;
        let cells = segment.base_ptr() as *const SignalCells;
        let signal = Self {
            name: name.to_string(),
            _segment: segment,
            cells,
            gate: Mutex::new(()),
            wake: Condvar::new(),
        };
        signal.reset();
        Ok(signal)
    }

    fn cells(&self) -> &SignalCells {
        // SAFETY: page-aligned mapping of at least CELLS_BYTES, valid for `self`.
        unsafe { &*self.cells }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reset(&self) {
        self.cells().count.store(0, Ordering::SeqCst);
        self.cells().posted_total.store(0, Ordering::SeqCst);
    }

    /// Increment the signal and wake in-process waiters.
    pub fn post(&self) {
        self.cells().posted_total.fetch_add(1, Ordering::AcqRel);
        self.cells().count.fetch_add(1, Ordering::AcqRel);
        let _gate = self.gate.lock();
        self.wake.notify_all();
    }

    /// Decrement if the count is positive; never blocks.
    pub fn try_wait(&self) -> bool {
        let count = &self.cells().count;
        let mut current = count.load(Ordering::Acquire);
        while current > 0 {
            match count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Block until the count is positive or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut gate = self.gate.lock();
            if self.try_wait() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(WAKE_SLICE);
            self.wake.wait_for(&mut gate, slice);
        }
    }

    /// Block until the count is positive.
    pub fn wait(&self) {
        while !self.wait_timeout(Duration::from_secs(1)) {}
    }

    /// Pending (unconsumed) posts.
    pub fn count(&self) -> u64 {
        self.cells().count.load(Ordering::Acquire)
    }

    /// Posts since the last reset, consumed or not.
    pub fn posted_total(&self) -> u64 {
        self.cells().posted_total.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for NamedSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSignal")
            .field("name", &self.name)
            .field("count", &self.count())
            .field("posted_total", &self.posted_total())
            .finish()
    }
}

/// Read-only view of a signal mapped by another process.
pub struct SignalView {
    segment: ReadOnlySegment,
}

impl SignalView {
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let segment = ReadOnlySegment::open(dir, name)?;
        if segment.len() < CELLS_BYTES {
            return Err(HydroError::SharedMemory(format!(
                "signal {name} is {} bytes, expected {CELLS_BYTES}",
                segment.len()
            )));
        }
        Ok(Self { segment })
    }

    pub fn posted_total(&self) -> u64 {
        // SAFETY: length checked in `open`; the mapping is page-aligned.
        let cells = unsafe { &*(self.segment.base_ptr() as *const SignalCells) };
        cells.posted_total.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn post_then_wait_consumes_one_count() {
        let dir = tempfile::tempdir().unwrap();
        let sig = NamedSignal::create(dir.path(), "t.page-ready").unwrap();
        assert!(!sig.try_wait());
        sig.post();
        sig.post();
        assert_eq!(sig.count(), 2);
        assert!(sig.try_wait());
        assert_eq!(sig.count(), 1);
        assert_eq!(sig.posted_total(), 2);
    }

    #[test]
    fn wait_timeout_expires_without_posts() {
        let dir = tempfile::tempdir().unwrap();
        let sig = NamedSignal::create(dir.path(), "t.idle").unwrap();
        let start = Instant::now();
        assert!(!sig.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn waiter_wakes_on_post_from_another_thread() {
        let dir = tempfile::tempdir().unwrap();
        let sig = Arc::new(NamedSignal::create(dir.path(), "t.wake").unwrap());
        let poster = Arc::clone(&sig);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            poster.post();
        });
        assert!(sig.wait_timeout(Duration::from_secs(2)));
        handle.join().unwrap();
        assert_eq!(sig.count(), 0);
    }

    #[test]
    fn create_resets_a_stale_signal_and_view_sees_posts() {
        let dir = tempfile::tempdir().unwrap();
        {
            let stale = NamedSignal::create(dir.path(), "t.stale").unwrap();
            stale.post();
        }
        let sig = NamedSignal::create(dir.path(), "t.stale").unwrap();
        assert_eq!(sig.count(), 0);

        let view = SignalView::open(dir.path(), "t.stale").unwrap();
        sig.post();
        assert!(sig.try_wait());
        assert_eq!(view.posted_total(), 1);
    }
}
