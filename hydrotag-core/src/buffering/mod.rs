//! Two-page, block-subdivided ring over a named shared-memory segment.
//!
//! ```text
//!  segment: [ page 0: block 0 | block 1 | .. | block N-1 ][ page 1: ... ]
//!  signals: <name>.block-ready   +1 per block written
//!           <name>.page-ready    +1 per page completed
//! ```
//!
//! The producer (`RingWriter`) owns the page it is filling; the consumer
//! (`RingReader`) may only touch a page after taking a page-ready count for it.
//! Each page carries a small state word (`Free → Writing → Full → Draining →
//! Free`) so that a writer wrapping into a page the reader still holds is
//! reported as `HydroError::RingOverrun` instead of scribbling over it.

pub mod observer;
pub mod shm;
pub mod signal;

use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{HydroError, Result};

pub use observer::{BlockObserver, ObservedBlock};
pub use shm::{ShmSegment, DEFAULT_SHM_DIR};
pub use signal::{NamedSignal, SignalView};

/// Pages in the ring.
pub const PAGE_COUNT: usize = 2;

/// Block size and page length of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    block_bytes: usize,
    blocks_per_page: usize,
}

/// A `(page, block, byte)` position inside the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingAddress {
    pub page: usize,
    pub block: usize,
    pub byte: usize,
}

impl RingAddress {
    pub const fn block_start(page: usize, block: usize) -> Self {
        Self {
            page,
            block,
            byte: 0,
        }
    }
}

impl RingLayout {
    pub fn new(block_bytes: usize, blocks_per_page: usize) -> Result<Self> {
        if block_bytes == 0 || blocks_per_page == 0 {
            return Err(HydroError::RingAddress(format!(
                "degenerate layout: {blocks_per_page} blocks of {block_bytes} bytes"
            )));
        }
        Ok(Self {
            block_bytes,
            blocks_per_page,
        })
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    pub fn blocks_per_page(&self) -> usize {
        self.blocks_per_page
    }

    pub fn page_bytes(&self) -> usize {
        self.block_bytes * self.blocks_per_page
    }

    /// Exact segment size: `2 × blocks_per_page × block_bytes`.
    pub fn segment_bytes(&self) -> usize {
        PAGE_COUNT * self.page_bytes()
    }

    /// Linear offset of `addr`, or `RingAddress` if any component is out of range.
    pub fn offset(&self, addr: RingAddress) -> Result<usize> {
        if addr.page >= PAGE_COUNT
            || addr.block >= self.blocks_per_page
            || addr.byte >= self.block_bytes
        {
            return Err(HydroError::RingAddress(format!(
                "{addr:?} outside {PAGE_COUNT} pages × {} blocks × {} bytes",
                self.blocks_per_page, self.block_bytes
            )));
        }
        Ok(addr.page * self.page_bytes() + addr.block * self.block_bytes + addr.byte)
    }
}

/// Where a ring's segment and signals live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingNames {
    pub dir: PathBuf,
    pub name: String,
}

impl RingNames {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn data(&self) -> String {
        self.name.clone()
    }

    pub fn block_ready(&self) -> String {
        format!("{}.block-ready", self.name)
    }

    pub fn page_ready(&self) -> String {
        format!("{}.page-ready", self.name)
    }
}

const PAGE_FREE: u8 = 0;
const PAGE_WRITING: u8 = 1;
const PAGE_FULL: u8 = 2;
const PAGE_DRAINING: u8 = 3;

/// Shared state behind a writer/reader pair.
pub struct SharedRing {
    layout: RingLayout,
    names: RingNames,
    _segment: ShmSegment,
    base: *mut u8,
    page_state: [AtomicU8; PAGE_COUNT],
    writing_page: AtomicUsize,
    block_cursor: AtomicUsize,
    page_started_ms: [AtomicI64; PAGE_COUNT],
    block_ready: NamedSignal,
    page_ready: NamedSignal,
}

// SAFETY: `base` points into `_segment`, owned by the ring. Byte ranges are
// handed out per page under the `page_state` protocol: only the `RingWriter`
// writes a page in `Writing`, only the `RingReader` reads a page in
// `Draining`, and the transitions use acquire/release ordering.
unsafe impl Send for SharedRing {}
unsafe impl Sync for SharedRing {}

impl SharedRing {
    /// Create (or reopen and resize) the segment and both signals, zero the
    /// signals and return the single writer and reader for the session.
    pub fn create(names: RingNames, layout: RingLayout) -> Result<(RingWriter, RingReader)> {
        let mut segment = ShmSegment::create_or_open(names.dir(), &names.data(), layout.segment_bytes())?;
        let base = segment.base_ptr();
        let block_ready = NamedSignal::create(names.dir(), &names.block_ready())?;
        let page_ready = NamedSignal::create(names.dir(), &names.page_ready())?;

        debug!(
            segment = %segment.path().display(),
            block_bytes = layout.block_bytes(),
            blocks_per_page = layout.blocks_per_page(),
            "ring created"
        );

        let ring = Arc::new(SharedRing {
            layout,
            names,
            _segment: segment,
            base,
            page_state: [AtomicU8::new(PAGE_FREE), AtomicU8::new(PAGE_FREE)],
            writing_page: AtomicUsize::new(0),
            block_cursor: AtomicUsize::new(0),
            page_started_ms: [AtomicI64::new(0), AtomicI64::new(0)],
            block_ready,
            page_ready,
        });

        Ok((
            RingWriter {
                ring: Arc::clone(&ring),
            },
            RingReader {
                ring,
                next_page: 0,
                draining: None,
            },
        ))
    }

    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    pub fn names(&self) -> &RingNames {
        &self.names
    }

    pub fn writing_page(&self) -> usize {
        self.writing_page.load(Ordering::Acquire)
    }

    /// Blocks already written into the page being filled.
    pub fn filled_blocks_in_page(&self) -> usize {
        self.block_cursor.load(Ordering::Acquire)
    }

    /// Blocks still to be written before the current page flips.
    pub fn remaining_blocks_in_page(&self) -> usize {
        self.layout.blocks_per_page() - self.filled_blocks_in_page()
    }

    pub fn block_ready_total(&self) -> u64 {
        self.block_ready.posted_total()
    }

    pub fn page_ready_total(&self) -> u64 {
        self.page_ready.posted_total()
    }

    /// Pending page-ready counts not yet taken by the reader.
    pub fn pages_pending(&self) -> u64 {
        self.page_ready.count()
    }

    /// Block-ready signal, for in-process consumers of live blocks.
    pub fn block_ready_signal(&self) -> &NamedSignal {
        &self.block_ready
    }

    /// Wall-clock epoch milliseconds at which `page` received its first block.
    pub fn page_started_ms(&self, page: usize) -> i64 {
        self.page_started_ms[page % PAGE_COUNT].load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SharedRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRing")
            .field("layout", &self.layout)
            .field("names", &self.names)
            .field("writing_page", &self.writing_page())
            .field("block_cursor", &self.filled_blocks_in_page())
            .finish()
    }
}

/// Producer half. Not `Clone`: one writer per session.
#[derive(Debug)]
pub struct RingWriter {
    ring: Arc<SharedRing>,
}

impl RingWriter {
    pub fn ring(&self) -> &Arc<SharedRing> {
        &self.ring
    }

    /// Copy one block into the ring at the cursor and raise block-ready.
    /// On the last block of a page, flip pages and raise page-ready.
    ///
    /// Returns `true` when the write flipped a page.
    ///
    /// # Errors
    /// - `HydroError::RingAddress` if `data` is not exactly one block.
    /// - `HydroError::RingOverrun` if the next page has not been drained yet.
    pub fn write_block(&mut self, data: &[u8]) -> Result<bool> {
        let ring = &*self.ring;
        let layout = ring.layout;
        if data.len() != layout.block_bytes() {
            return Err(HydroError::RingAddress(format!(
                "block of {} bytes, ring blocks are {}",
                data.len(),
                layout.block_bytes()
            )));
        }

        let page = ring.writing_page.load(Ordering::Relaxed);
        let block = ring.block_cursor.load(Ordering::Relaxed);

        if block == 0 {
            if ring.page_state[page]
                .compare_exchange(PAGE_FREE, PAGE_WRITING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                warn!(page, "reader has not released page; refusing to overwrite");
                return Err(HydroError::RingOverrun { page });
            }
            ring.page_started_ms[page].store(chrono::Utc::now().timestamp_millis(), Ordering::Release);
        }

        let offset = layout.offset(RingAddress::block_start(page, block))?;
        // SAFETY: `offset + block_bytes` lies within the segment (validated
        // by `offset` and the exact length check above), and `page` is in
        // `Writing`, which only this writer can hold.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), ring.base.add(offset), data.len());
        }

        let next = block + 1;
        let flipped = next == layout.blocks_per_page();
        if flipped {
            ring.page_state[page].store(PAGE_FULL, Ordering::Release);
            ring.block_cursor.store(0, Ordering::Release);
            ring.writing_page.store((page + 1) % PAGE_COUNT, Ordering::Release);
        } else {
            ring.block_cursor.store(next, Ordering::Release);
        }

        ring.block_ready.post();
        if flipped {
            ring.page_ready.post();
        }
        Ok(flipped)
    }

    pub fn remaining_blocks_in_page(&self) -> usize {
        self.ring.remaining_blocks_in_page()
    }
}

/// A page handed to the consumer: which page, and how many valid blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGrant {
    pub page: usize,
    pub blocks: usize,
    /// Epoch milliseconds of the page's first block.
    pub started_ms: i64,
}

/// Consumer half. Drains pages strictly in order 0, 1, 0, 1, ...
#[derive(Debug)]
pub struct RingReader {
    ring: Arc<SharedRing>,
    next_page: usize,
    draining: Option<PageGrant>,
}

impl RingReader {
    pub fn ring(&self) -> &Arc<SharedRing> {
        &self.ring
    }

    /// Block until a page is ready, then take it.
    pub fn page_drain_begin(&mut self) -> Result<PageGrant> {
        loop {
            if let Some(grant) = self.try_page_drain_begin(Duration::from_secs(1))? {
                return Ok(grant);
            }
        }
    }

    /// Wait up to `timeout` for a page; `None` if none arrived.
    ///
    /// # Errors
    /// `HydroError::RingAddress` if a previous page is still being drained.
    pub fn try_page_drain_begin(&mut self, timeout: Duration) -> Result<Option<PageGrant>> {
        if let Some(held) = self.draining {
            return Err(HydroError::RingAddress(format!(
                "page {} still draining",
                held.page
            )));
        }
        if !self.ring.page_ready.wait_timeout(timeout) {
            return Ok(None);
        }
        let page = self.next_page;
        self.ring.page_state[page]
            .compare_exchange(PAGE_FULL, PAGE_DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|state| {
                HydroError::RingAddress(format!(
                    "page-ready for page {page} but page state is {state}"
                ))
            })?;
        let grant = PageGrant {
            page,
            blocks: self.ring.layout.blocks_per_page(),
            started_ms: self.ring.page_started_ms(page),
        };
        self.draining = Some(grant);
        Ok(Some(grant))
    }

    /// Take the page the writer was filling when it stopped, if it holds any
    /// blocks. Only valid once the writer has stopped for good.
    pub fn partial_drain_begin(&mut self) -> Result<Option<PageGrant>> {
        if let Some(held) = self.draining {
            return Err(HydroError::RingAddress(format!(
                "page {} still draining",
                held.page
            )));
        }
        let blocks = self.ring.filled_blocks_in_page();
        if blocks == 0 {
            return Ok(None);
        }
        let page = self.ring.writing_page();
        self.ring.page_state[page]
            .compare_exchange(PAGE_WRITING, PAGE_DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|state| {
                HydroError::RingAddress(format!(
                    "partial page {page} is not being written (state {state})"
                ))
            })?;
        let grant = PageGrant {
            page,
            blocks,
            started_ms: self.ring.page_started_ms(page),
        };
        self.draining = Some(grant);
        Ok(Some(grant))
    }

    /// Bytes of the page currently held, limited to its valid blocks.
    pub fn page_bytes(&self) -> Result<&[u8]> {
        let grant = self
            .draining
            .ok_or_else(|| HydroError::RingAddress("no page is being drained".into()))?;
        let layout = self.ring.layout;
        let offset = layout.offset(RingAddress::block_start(grant.page, 0))?;
        // SAFETY: the page is in `Draining`, held only by this reader, and the
        // writer never writes a page outside `Writing`. The slice borrows
        // `self`, so it cannot outlive `page_drain_end`.
        Ok(unsafe {
            std::slice::from_raw_parts(
                self.ring.base.add(offset),
                grant.blocks * layout.block_bytes(),
            )
        })
    }

    /// Release the held page back to the writer.
    pub fn page_drain_end(&mut self) -> Result<()> {
        let grant = self
            .draining
            .take()
            .ok_or_else(|| HydroError::RingAddress("page_drain_end without a page".into()))?;
        self.ring.page_state[grant.page].store(PAGE_FREE, Ordering::Release);
        if grant.blocks == self.ring.layout.blocks_per_page() {
            self.next_page = (grant.page + 1) % PAGE_COUNT;
        }
        Ok(())
    }

    pub fn draining(&self) -> Option<PageGrant> {
        self.draining
    }
}
