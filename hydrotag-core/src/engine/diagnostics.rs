use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by both engines, reset at every start.
#[derive(Debug, Default)]
pub struct EngineDiagnostics {
    // producer
    pub blocks_written: AtomicU64,
    pub pages_flipped: AtomicU64,
    pub catch_up_iterations: AtomicU64,
    pub poll_sleeps: AtomicU64,
    pub deadline_misses: AtomicU64,
    pub overflows: AtomicU64,
    pub transport_errors: AtomicU64,
    // consumer
    pub pages_persisted: AtomicU64,
    pub pages_dropped: AtomicU64,
    pub partial_flushes: AtomicU64,
    pub files_opened: AtomicU64,
    pub encoded_bytes: AtomicU64,
    pub encoder_errors: AtomicU64,
    pub status_log_errors: AtomicU64,
}

impl EngineDiagnostics {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn counters(&self) -> [&AtomicU64; 14] {
        [
            &self.blocks_written,
            &self.pages_flipped,
            &self.catch_up_iterations,
            &self.poll_sleeps,
            &self.deadline_misses,
            &self.overflows,
            &self.transport_errors,
            &self.pages_persisted,
            &self.pages_dropped,
            &self.partial_flushes,
            &self.files_opened,
            &self.encoded_bytes,
            &self.encoder_errors,
            &self.status_log_errors,
        ]
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            blocks_written: load(&self.blocks_written),
            pages_flipped: load(&self.pages_flipped),
            catch_up_iterations: load(&self.catch_up_iterations),
            poll_sleeps: load(&self.poll_sleeps),
            deadline_misses: load(&self.deadline_misses),
            overflows: load(&self.overflows),
            transport_errors: load(&self.transport_errors),
            pages_persisted: load(&self.pages_persisted),
            pages_dropped: load(&self.pages_dropped),
            partial_flushes: load(&self.partial_flushes),
            files_opened: load(&self.files_opened),
            encoded_bytes: load(&self.encoded_bytes),
            encoder_errors: load(&self.encoder_errors),
            status_log_errors: load(&self.status_log_errors),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub blocks_written: u64,
    pub pages_flipped: u64,
    pub catch_up_iterations: u64,
    pub poll_sleeps: u64,
    pub deadline_misses: u64,
    pub overflows: u64,
    pub transport_errors: u64,
    pub pages_persisted: u64,
    pub pages_dropped: u64,
    pub partial_flushes: u64,
    pub files_opened: u64,
    pub encoded_bytes: u64,
    pub encoder_errors: u64,
    pub status_log_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_every_counter() {
        let d = EngineDiagnostics::default();
        for c in d.counters() {
            c.store(3, Ordering::Relaxed);
        }
        assert_eq!(d.snapshot().encoded_bytes, 3);
        d.reset();
        assert_eq!(d.snapshot(), EngineDiagnostics::default().snapshot());
    }
}
