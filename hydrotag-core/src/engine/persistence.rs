//! Consumer: drains full pages to the encoder and rotates output files.
//!
//! For each page-ready count:
//!
//! ```text
//! audit row (drain start, pending note)
//!   → wire words → i32 samples → encoder
//!   → byte counter; rotate when the next page would cross the threshold
//! audit row (drain end)
//! ```
//!
//! After the producer finishes: drain any pages still signalled, flush the
//! partial page (only its valid blocks), finalize the encoder.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn};

use super::diagnostics::EngineDiagnostics;
use super::sched;
use super::session::AcquisitionSession;
use crate::buffering::{PageGrant, RingReader};
use crate::encoder::{convert_page, SampleEncoder};
use crate::error::Result;
use crate::ipc::events::PagePersistedEvent;
use crate::status_log::{RowKind, StatusLog};

/// How long one wait for page-ready lasts before re-checking for shutdown.
const PAGE_WAIT: Duration = Duration::from_millis(20);

/// Encoder plus the current output file and its byte counter.
pub struct Persistence {
    encoder: Box<dyn SampleEncoder>,
    session: Arc<AcquisitionSession>,
    output_dir: PathBuf,
    current: Option<PathBuf>,
    file_bytes: u64,
    diagnostics: Arc<EngineDiagnostics>,
}

impl Persistence {
    pub fn new(
        encoder: Box<dyn SampleEncoder>,
        session: Arc<AcquisitionSession>,
        output_dir: impl Into<PathBuf>,
        diagnostics: Arc<EngineDiagnostics>,
    ) -> Self {
        Self {
            encoder,
            session,
            output_dir: output_dir.into(),
            current: None,
            file_bytes: 0,
            diagnostics,
        }
    }

    pub fn current_file(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    /// Open a new file named by the epoch-millisecond time of its first sample.
    pub fn open_file(&mut self, first_sample_ms: i64) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        let ext = self.encoder.extension();
        let mut stamp = first_sample_ms;
        let mut path = self.output_dir.join(format!("{stamp}.{ext}"));
        while path.exists() {
            stamp += 1;
            path = self.output_dir.join(format!("{stamp}.{ext}"));
        }
        self.encoder.begin_file(&path, self.session.geometry())?;
        self.current = Some(path.clone());
        self.file_bytes = 0;
        self.session.set_current_file(Some(&path));
        EngineDiagnostics::bump(&self.diagnostics.files_opened);
        info!(file = %path.display(), "output file opened");
        Ok(path)
    }

    /// Finalize the open file. An empty file is removed.
    pub fn close_file(&mut self) -> Result<()> {
        let Some(path) = self.current.take() else {
            return Ok(());
        };
        self.session.set_current_file(None);
        let bytes = if self.encoder.is_open() {
            self.encoder.finish_file()?
        } else {
            0
        };
        if bytes == 0 {
            debug!(file = %path.display(), "removing empty output file");
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "could not remove empty file");
            }
        } else {
            info!(file = %path.display(), bytes, "output file finalized");
        }
        Ok(())
    }

    /// Encode one page and rotate if the next full page would cross the
    /// threshold. `next_started_ms` is the producer's start stamp for the
    /// following page (stale if it has not begun it yet).
    ///
    /// Encoder failures drop the page's samples; the file is abandoned and a
    /// fresh one is opened for the next page.
    fn write_page(&mut self, bytes: &[u8], grant: PageGrant, next_started_ms: i64) -> PageWrite {
        let geometry = *self.session.geometry();
        let samples = convert_page(bytes, geometry.bit_depth);
        let mut outcome = PageWrite::default();

        if self.current.is_none() {
            if let Err(e) = self.open_file(grant.started_ms) {
                EngineDiagnostics::bump(&self.diagnostics.encoder_errors);
                EngineDiagnostics::bump(&self.diagnostics.pages_dropped);
                error!(page = grant.page, error = %e, "no output file; page dropped");
                return outcome;
            }
        }

        let written = match self.encoder.write_samples(&samples) {
            Ok(written) => written,
            Err(e) => {
                EngineDiagnostics::bump(&self.diagnostics.encoder_errors);
                EngineDiagnostics::bump(&self.diagnostics.pages_dropped);
                error!(page = grant.page, error = %e, "encoder failed; page dropped");
                if let Err(e) = self.close_file() {
                    warn!(error = %e, "abandoned file not finalized");
                }
                return outcome;
            }
        };
        self.file_bytes += written;
        self.session.add_file_bytes(written);
        self.diagnostics
            .encoded_bytes
            .fetch_add(written, Ordering::Relaxed);
        outcome.samples = samples.len();
        outcome.file = self.current.clone();
        outcome.file_bytes = self.file_bytes;

        let full_page = geometry.encoded_len(
            self.session.blocks_per_page * self.session.resolved.block_bytes,
        ) as u64;
        let last_page = grant.blocks < self.session.blocks_per_page;
        if !last_page && self.file_bytes + full_page > self.session.resolved.file_rotation_bytes {
            let next_start = if next_started_ms > grant.started_ms {
                next_started_ms
            } else {
                let page_us = grant.blocks as u64 * self.session.resolved.block_fill_interval_us();
                grant.started_ms + (page_us / 1_000) as i64
            };
            match self.close_file().and_then(|_| self.open_file(next_start)) {
                Ok(path) => outcome.rotated_to = Some(path),
                Err(e) => {
                    EngineDiagnostics::bump(&self.diagnostics.encoder_errors);
                    error!(error = %e, "file rotation failed; retrying on next page");
                }
            }
        }
        outcome
    }

    pub fn finish(&mut self) -> Result<()> {
        self.close_file()
    }
}

/// Result of encoding one page.
#[derive(Debug, Default)]
struct PageWrite {
    samples: usize,
    file: Option<PathBuf>,
    file_bytes: u64,
    rotated_to: Option<PathBuf>,
}

/// All context the consumer needs.
pub struct ConsumerContext {
    pub persistence: Persistence,
    pub reader: RingReader,
    pub session: Arc<AcquisitionSession>,
    pub status_log: Arc<StatusLog>,
    pub page_tx: broadcast::Sender<PagePersistedEvent>,
    pub diagnostics: Arc<EngineDiagnostics>,
    pub core: Option<usize>,
    pub done_tx: Sender<()>,
}

/// Run the consumer until the producer has finished and everything is flushed.
pub fn run(mut ctx: ConsumerContext) {
    let span = info_span!("consumer");
    let _enter = span.enter();

    sched::pin_current_thread("consumer", ctx.core);
    sched::lower_priority("consumer");

    let mut seq = 0u64;
    loop {
        match ctx.reader.try_page_drain_begin(PAGE_WAIT) {
            Ok(Some(grant)) => drain(&mut ctx, grant, false, &mut seq),
            Ok(None) => {
                if ctx.session.producer_finished() {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "page handoff failed");
                if ctx.session.producer_finished() {
                    break;
                }
            }
        }
    }

    // Pages completed just before the producer stopped.
    while let Ok(Some(grant)) = ctx.reader.try_page_drain_begin(Duration::ZERO) {
        drain(&mut ctx, grant, false, &mut seq);
    }

    match ctx.reader.partial_drain_begin() {
        Ok(Some(grant)) => {
            EngineDiagnostics::bump(&ctx.diagnostics.partial_flushes);
            info!(blocks = grant.blocks, "flushing partial page");
            drain(&mut ctx, grant, true, &mut seq);
        }
        Ok(None) => {}
        Err(e) => error!(error = %e, "partial page not flushed"),
    }

    if let Err(e) = ctx.persistence.finish() {
        EngineDiagnostics::bump(&ctx.diagnostics.encoder_errors);
        error!(error = %e, "final file not finalized");
    }

    let snapshot = ctx.diagnostics.snapshot();
    info!(
        pages = snapshot.pages_persisted,
        dropped = snapshot.pages_dropped,
        files = snapshot.files_opened,
        bytes = snapshot.encoded_bytes,
        errors = snapshot.encoder_errors + snapshot.status_log_errors,
        "consumer finished"
    );
    let _ = ctx.done_tx.send(());
}

fn audit(ctx: &ConsumerContext, kind: RowKind) {
    let see_block = ctx.reader.ring().block_ready_total();
    let row = ctx.status_log.row(kind, ctx.session.take_note(), see_block);
    if let Err(e) = ctx.status_log.append(row) {
        EngineDiagnostics::bump(&ctx.diagnostics.status_log_errors);
        warn!(error = %e, "audit row not written; will retry");
    }
}

fn drain(ctx: &mut ConsumerContext, grant: PageGrant, partial: bool, seq: &mut u64) {
    audit(ctx, RowKind::DrainStart);

    let ring = Arc::clone(ctx.reader.ring());
    let next_started_ms = ring.page_started_ms(grant.page + 1);
    let outcome = match ctx.reader.page_bytes() {
        Ok(bytes) => ctx.persistence.write_page(bytes, grant, next_started_ms),
        Err(e) => {
            error!(page = grant.page, error = %e, "page unreadable");
            PageWrite::default()
        }
    };
    if let Err(e) = ctx.reader.page_drain_end() {
        error!(page = grant.page, error = %e, "page release failed");
    }
    if outcome.samples > 0 {
        EngineDiagnostics::bump(&ctx.diagnostics.pages_persisted);
    }

    audit(ctx, RowKind::DrainEnd);

    *seq += 1;
    let _ = ctx.page_tx.send(PagePersistedEvent {
        seq: *seq,
        page: grant.page,
        blocks: grant.blocks,
        samples: outcome.samples,
        file: outcome
            .file
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        file_bytes: outcome.file_bytes,
        rotated_to: outcome.rotated_to.map(|p| p.display().to_string()),
        partial,
    });
    debug!(
        page = grant.page,
        blocks = grant.blocks,
        samples = outcome.samples,
        partial,
        "page persisted"
    );
}
