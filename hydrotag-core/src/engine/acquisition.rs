//! Producer: drains the hardware FIFO into the ring.
//!
//! ## Per iteration
//!
//! ```text
//! 1. stop flag?                         → Stopping
//! 2. overflow line (before-wait)        → Overflowed(1)
//! 3. poll data_ready, sleeping interval/20 between polls
//! 4. transfer first half of the block
//! 5. overflow line (mid-transfer)       → Overflowed(2)
//! 6. transfer second half
//! 7. overflow line (after-transfer)     → Overflowed(3)
//! 8. commit block to the ring (block-ready, maybe page-ready)
//! 9. data already waiting? loop now : sleep (interval - elapsed)
//! ```
//!
//! Teardown stops the FIFO, lets the consumer drain and flush, and (after an
//! overflow or transport failure) resets the FIFO before returning to idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn};

use super::diagnostics::EngineDiagnostics;
use super::sched;
use super::session::AcquisitionSession;
use super::StatusBoard;
use crate::buffering::RingWriter;
use crate::error::{HydroError, Result};
use crate::geometry::{ResolvedGeometry, STORED_BYTES_PER_SAMPLE};
use crate::hardware::HydrophoneHardware;
use crate::ipc::events::{AcquisitionStatus, OverflowLocation};
use crate::status_log::{RowKind, StatusLog};

/// Shared handle to the front-end.
pub type SharedHardware = Arc<Mutex<Box<dyn HydrophoneHardware>>>;

/// Everything the producer thread owns for one session.
pub struct ProducerContext {
    pub hw: SharedHardware,
    pub writer: RingWriter,
    pub session: Arc<AcquisitionSession>,
    pub running: Arc<AtomicBool>,
    pub forced_overflow: Arc<AtomicBool>,
    pub status: StatusBoard,
    pub status_log: Arc<StatusLog>,
    pub diagnostics: Arc<EngineDiagnostics>,
    pub core: Option<usize>,
    pub realtime: bool,
    /// Priming result, consumed by `AcquisitionEngine::start`.
    pub primed_tx: Sender<Result<()>>,
    /// Closed (or sent on) by the consumer once it has flushed and finalized.
    pub consumer_done: Receiver<()>,
}

/// How the stream loop ended.
#[derive(Debug)]
enum StreamEnd {
    Stopped,
    Overflow(OverflowLocation),
    Failed(HydroError),
}

/// Put the front-end into the session geometry and start the FIFO.
pub fn prime<H: HydrophoneHardware + ?Sized>(hw: &mut H, resolved: &ResolvedGeometry) -> Result<()> {
    resolved.register_program.apply(hw)?;
    hw.fifo_reset()?;
    hw.fifo_start()?;

    let mut junk = [0u8; STORED_BYTES_PER_SAMPLE];
    hw.transfer_block(&mut junk)?;
    debug!(junk = ?junk, "discarded cold-start word");

    if hw.overflow_asserted()? {
        return Err(HydroError::Transport(
            "overflow line still asserted after FIFO reset".into(),
        ));
    }
    Ok(())
}

/// Run the producer until stopped, overflowed or failed.
pub fn run(mut ctx: ProducerContext) {
    let geometry = *ctx.session.geometry();
    let span = info_span!(
        "producer",
        rate_hz = geometry.sample_rate.hz(),
        bits = geometry.bit_depth.bits(),
        channels = geometry.channel_count()
    );
    let _enter = span.enter();

    sched::pin_current_thread("producer", ctx.core);

    let hw_slot = Arc::clone(&ctx.hw);
    let mut hw = hw_slot.lock();

    if let Err(e) = prime(&mut **hw, &ctx.session.resolved) {
        error!(error = %e, "priming failed");
        if let Err(stop_err) = hw.fifo_stop() {
            warn!(error = %stop_err, "fifo_stop after failed priming");
        }
        let _ = ctx.primed_tx.send(Err(e));
        return;
    }
    ctx.status.set(AcquisitionStatus::Streaming, None, None);
    let _ = ctx.primed_tx.send(Ok(()));

    if ctx.realtime {
        sched::raise_realtime_priority("producer");
    }
    info!(
        block_bytes = ctx.session.resolved.block_bytes,
        interval_us = ctx.session.resolved.block_fill_interval_us(),
        "streaming"
    );

    let end = stream(&mut **hw, &mut ctx);
    teardown(&mut **hw, &ctx, end);
}

fn stream<H: HydrophoneHardware + ?Sized>(hw: &mut H, ctx: &mut ProducerContext) -> StreamEnd {
    let resolved = &ctx.session.resolved;
    let interval = resolved.block_fill_interval;
    let poll = resolved.poll_interval();
    let mut block = vec![0u8; resolved.block_bytes];
    // Split on a word boundary so the mid-transfer check sits between samples.
    let half = (resolved.block_bytes / 2) / STORED_BYTES_PER_SAMPLE * STORED_BYTES_PER_SAMPLE;

    loop {
        // ── 1. Cooperative stop ──────────────────────────────────────────
        if !ctx.running.load(Ordering::Relaxed) {
            return StreamEnd::Stopped;
        }
        let iteration_start = Instant::now();

        // ── 2. Overflow before waiting ──────────────────────────────────
        match overflow_check(hw, ctx, OverflowLocation::BeforeWait) {
            Ok(Some(loc)) => return StreamEnd::Overflow(loc),
            Ok(None) => {}
            Err(e) => return StreamEnd::Failed(e),
        }

        // ── 3. Wait for a block's worth of data ─────────────────────────
        loop {
            match hw.data_ready() {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => return StreamEnd::Failed(e),
            }
            if !ctx.running.load(Ordering::Relaxed) {
                return StreamEnd::Stopped;
            }
            if ctx.forced_overflow.load(Ordering::Acquire) {
                return StreamEnd::Overflow(OverflowLocation::Commanded);
            }
            EngineDiagnostics::bump(&ctx.diagnostics.poll_sleeps);
            thread::sleep(poll);
        }

        // ── 4-7. Transfer in two halves, checking the line between ──────
        if let Err(e) = hw.transfer_block(&mut block[..half]) {
            return StreamEnd::Failed(e);
        }
        match overflow_check(hw, ctx, OverflowLocation::MidTransfer) {
            Ok(Some(loc)) => return StreamEnd::Overflow(loc),
            Ok(None) => {}
            Err(e) => return StreamEnd::Failed(e),
        }
        if let Err(e) = hw.transfer_block(&mut block[half..]) {
            return StreamEnd::Failed(e);
        }
        match overflow_check(hw, ctx, OverflowLocation::AfterTransfer) {
            Ok(Some(loc)) => return StreamEnd::Overflow(loc),
            Ok(None) => {}
            Err(e) => return StreamEnd::Failed(e),
        }

        // ── 8. Commit ────────────────────────────────────────────────────
        match ctx.writer.write_block(&block) {
            Ok(flipped) => {
                EngineDiagnostics::bump(&ctx.diagnostics.blocks_written);
                if flipped {
                    EngineDiagnostics::bump(&ctx.diagnostics.pages_flipped);
                    debug!(
                        page = 1 - ctx.writer.ring().writing_page(),
                        "page complete"
                    );
                }
            }
            Err(HydroError::RingOverrun { page }) => {
                warn!(page, "consumer fell a full page behind");
                return StreamEnd::Overflow(OverflowLocation::RingOverrun);
            }
            Err(e) => return StreamEnd::Failed(e),
        }

        // ── 9. Pace ──────────────────────────────────────────────────────
        match hw.data_ready() {
            Ok(true) => {
                EngineDiagnostics::bump(&ctx.diagnostics.catch_up_iterations);
                continue;
            }
            Ok(false) => {}
            Err(e) => return StreamEnd::Failed(e),
        }
        match interval.checked_sub(iteration_start.elapsed()) {
            Some(rest) if !rest.is_zero() => thread::sleep(rest),
            _ => EngineDiagnostics::bump(&ctx.diagnostics.deadline_misses),
        }
    }
}

/// Sample the overflow line (or a commanded overflow) at one check point.
fn overflow_check<H: HydrophoneHardware + ?Sized>(
    hw: &mut H,
    ctx: &ProducerContext,
    location: OverflowLocation,
) -> Result<Option<OverflowLocation>> {
    let forced = ctx.forced_overflow.load(Ordering::Acquire);
    if forced || hw.overflow_asserted()? {
        return Ok(Some(location));
    }
    Ok(None)
}

fn teardown<H: HydrophoneHardware + ?Sized>(hw: &mut H, ctx: &ProducerContext, end: StreamEnd) {
    let see_block = ctx.writer.ring().block_ready_total();
    match &end {
        StreamEnd::Stopped => {
            info!(blocks = see_block, "stop requested");
            ctx.status.set(AcquisitionStatus::Stopping, None, None);
        }
        StreamEnd::Overflow(location) => {
            EngineDiagnostics::bump(&ctx.diagnostics.overflows);
            error!(
                overflow_location = location.code(),
                ?location,
                blocks = see_block,
                "FIFO overflow; tearing session down"
            );
            ctx.session.declare_overflow(*location);
            ctx.status.set(
                AcquisitionStatus::Overflowed,
                Some(format!("overflow detected at {location:?}")),
                Some(*location),
            );
            let row = ctx
                .status_log
                .row(RowKind::Overflow(*location), ctx.session.take_note(), see_block);
            if let Err(e) = ctx.status_log.append(row) {
                EngineDiagnostics::bump(&ctx.diagnostics.status_log_errors);
                warn!(error = %e, "overflow audit row not written");
            }
        }
        StreamEnd::Failed(e) => {
            EngineDiagnostics::bump(&ctx.diagnostics.transport_errors);
            error!(code = "transport", error = %e, blocks = see_block, "transport failure; tearing session down");
            ctx.status
                .set(AcquisitionStatus::Error, Some(e.to_string()), None);
        }
    }

    if let Err(e) = hw.fifo_stop() {
        warn!(error = %e, "fifo_stop failed");
    }

    // Let the consumer drain what it holds, flush the partial page and close the file.
    ctx.session.mark_producer_finished();
    let _ = ctx.consumer_done.recv();

    if !matches!(end, StreamEnd::Stopped) {
        if let Err(e) = hw.fifo_reset() {
            warn!(error = %e, "fifo_reset after teardown failed");
        }
    }

    let snapshot = ctx.diagnostics.snapshot();
    info!(
        blocks = snapshot.blocks_written,
        pages = snapshot.pages_flipped,
        catch_up = snapshot.catch_up_iterations,
        poll_sleeps = snapshot.poll_sleeps,
        deadline_misses = snapshot.deadline_misses,
        "producer finished"
    );

    ctx.running.store(false, Ordering::SeqCst);
    ctx.status.set(AcquisitionStatus::Idle, None, None);
}
