//! Read-only live view of a running ring.
//!
//! An observer maps the data segment and the block-ready signal without
//! write access and never consumes counts, so it cannot disturb the
//! producer or the persistence consumer. It follows `posted_total`: block
//! number `n` (1-based) lives at linear slot `(n - 1) % (2 × blocks_per_page)`.

use super::shm::ReadOnlySegment;
use super::signal::SignalView;
use super::{RingLayout, RingNames, PAGE_COUNT};
use crate::error::{HydroError, Result};

/// One block copied out of the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedBlock {
    /// 1-based block sequence number within the session.
    pub seq: u64,
    pub page: usize,
    pub block: usize,
    /// Blocks published since the previous poll that were skipped.
    pub missed: u64,
    pub data: Vec<u8>,
}

pub struct BlockObserver {
    layout: RingLayout,
    data: ReadOnlySegment,
    block_ready: SignalView,
    last_seen: u64,
}

impl BlockObserver {
    /// Attach to a ring created by another process (or thread).
    pub fn attach(names: &RingNames, layout: RingLayout) -> Result<Self> {
        let data = ReadOnlySegment::open(names.dir(), &names.data())?;
        if data.len() != layout.segment_bytes() {
            return Err(HydroError::SharedMemory(format!(
                "segment {} is {} bytes, layout expects {}",
                names.data(),
                data.len(),
                layout.segment_bytes()
            )));
        }
        let block_ready = SignalView::open(names.dir(), &names.block_ready())?;
        let last_seen = block_ready.posted_total();
        Ok(Self {
            layout,
            data,
            block_ready,
            last_seen,
        })
    }

    /// Total blocks published so far in the session.
    pub fn published(&self) -> u64 {
        self.block_ready.posted_total()
    }

    /// Copy out the newest block published since the last call, if any.
    ///
    /// Returns `None` when nothing new arrived, or when the producer lapped
    /// the slot while it was being copied.
    pub fn poll_latest(&mut self) -> Option<ObservedBlock> {
        let seq = self.block_ready.posted_total();
        if seq <= self.last_seen {
            return None;
        }
        let slots = (PAGE_COUNT * self.layout.blocks_per_page()) as u64;
        let slot = ((seq - 1) % slots) as usize;
        let page = slot / self.layout.blocks_per_page();
        let block = slot % self.layout.blocks_per_page();
        let start = slot * self.layout.block_bytes();

        let mut data = vec![0u8; self.layout.block_bytes()];
        // SAFETY: `start + block_bytes <= segment_bytes`, checked in `attach`.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data.base_ptr().add(start),
                data.as_mut_ptr(),
                data.len(),
            );
        }

        // The writer starts overwriting this slot before publishing seq + slots.
        if self.block_ready.posted_total() >= seq + slots - 1 {
            self.last_seen = seq;
            return None;
        }

        let missed = seq - self.last_seen - 1;
        self.last_seen = seq;
        Some(ObservedBlock {
            seq,
            page,
            block,
            missed,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::SharedRing;

    #[test]
    fn observer_follows_writes_without_consuming() {
        let dir = tempfile::tempdir().unwrap();
        let names = RingNames::new(dir.path(), "obs");
        let layout = RingLayout::new(4, 3).unwrap();
        let (mut writer, _reader) = SharedRing::create(names.clone(), layout).unwrap();
        let mut observer = BlockObserver::attach(&names, layout).unwrap();

        assert!(observer.poll_latest().is_none());

        writer.write_block(&[1; 4]).unwrap();
        let seen = observer.poll_latest().unwrap();
        assert_eq!((seen.seq, seen.page, seen.block, seen.missed), (1, 0, 0, 0));
        assert_eq!(seen.data, vec![1; 4]);
        assert!(observer.poll_latest().is_none());

        writer.write_block(&[2; 4]).unwrap();
        writer.write_block(&[3; 4]).unwrap();
        writer.write_block(&[4; 4]).unwrap();
        let seen = observer.poll_latest().unwrap();
        assert_eq!((seen.seq, seen.page, seen.block, seen.missed), (4, 1, 0, 2));
        assert_eq!(seen.data, vec![4; 4]);

        // Counts are untouched by the observer.
        assert_eq!(writer.ring().block_ready_signal().count(), 4);
        assert_eq!(writer.ring().pages_pending(), 1);
    }

    #[test]
    fn attach_rejects_mismatched_layout() {
        let dir = tempfile::tempdir().unwrap();
        let names = RingNames::new(dir.path(), "obs-size");
        let (_w, _r) = SharedRing::create(names.clone(), RingLayout::new(4, 3).unwrap()).unwrap();
        assert!(BlockObserver::attach(&names, RingLayout::new(4, 4).unwrap()).is_err());
    }
}
