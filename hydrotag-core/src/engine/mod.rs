//! `AcquisitionEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! AcquisitionEngine::new(config, hardware)
//!     └─► start()   → Priming → Streaming   (producer + consumer threads)
//!         ├─► stop()              → Stopping → Idle   (partial page flushed)
//!         └─► overflow / transport failure
//!                                 → Overflowed | Error → Idle
//! ```
//!
//! `stop()` on a stopped engine and `simulate_overflow()` on an engine that
//! is not streaming are no-ops.
//!
//! ## Threading
//!
//! The producer primes the hardware on its own thread (it holds the hardware
//! lock for the whole session) and reports the priming result over a bounded
//! handshake channel. Only after a successful handshake is the consumer
//! spawned. It opens the first output file when it drains the first page.

pub mod acquisition;
pub mod diagnostics;
pub mod persistence;
#[allow(unsafe_code)]
pub mod sched;
pub mod session;

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    buffering::{RingLayout, RingNames, SharedRing, DEFAULT_SHM_DIR},
    encoder::EncoderKind,
    error::{HydroError, Result},
    geometry::{
        resolve, SampleGeometry, SampleRate, DEFAULT_BASE_FILE_BYTES, DEFAULT_PAGE_DURATION,
    },
    hardware::HydrophoneHardware,
    ipc::events::{AcquisitionStatus, OverflowLocation, PagePersistedEvent, StatusEvent},
    status_log::StatusLog,
};

pub use acquisition::SharedHardware;
pub use diagnostics::{DiagnosticsSnapshot, EngineDiagnostics};
pub use session::{AcquisitionSession, SessionSnapshot};

/// Broadcast channel capacity for status and page events.
const BROADCAST_CAP: usize = 256;

/// Configuration for `AcquisitionEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub geometry: SampleGeometry,
    pub encoder: EncoderKind,
    /// Directory receiving one audio file per rotation.
    pub output_dir: PathBuf,
    /// Append-only status CSV.
    pub status_log_path: PathBuf,
    /// Shared-memory directory and segment name.
    pub ring: RingNames,
    /// Target page length; ignored when `blocks_per_page` is set.
    pub page_duration: Duration,
    pub blocks_per_page: Option<usize>,
    /// Rotation size at the slow/48 kHz rates, before the per-rate multiplier.
    pub base_file_bytes: u64,
    pub producer_core: Option<usize>,
    pub consumer_core: Option<usize>,
    /// Request SCHED_RR for the producer. Off in tests.
    pub realtime_scheduling: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            geometry: SampleGeometry::default(),
            encoder: EncoderKind::Wav,
            output_dir: PathBuf::from("recordings"),
            status_log_path: PathBuf::from("recordings/status.csv"),
            ring: RingNames::new(DEFAULT_SHM_DIR, "hydrotag"),
            page_duration: DEFAULT_PAGE_DURATION,
            blocks_per_page: None,
            base_file_bytes: DEFAULT_BASE_FILE_BYTES,
            producer_core: None,
            consumer_core: None,
            realtime_scheduling: true,
        }
    }
}

impl EngineConfig {
    /// Ring layout for the configured geometry.
    pub fn ring_layout(&self) -> Result<RingLayout> {
        let blocks = self
            .blocks_per_page
            .unwrap_or_else(|| self.geometry.blocks_per_page(self.page_duration));
        RingLayout::new(self.geometry.block_bytes(), blocks)
    }
}

/// Current status plus its broadcast channel; cloned into both threads.
#[derive(Clone)]
pub struct StatusBoard {
    current: Arc<Mutex<AcquisitionStatus>>,
    tx: broadcast::Sender<StatusEvent>,
    seq: Arc<AtomicU64>,
}

impl StatusBoard {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            current: Arc::new(Mutex::new(AcquisitionStatus::Idle)),
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn get(&self) -> AcquisitionStatus {
        *self.current.lock()
    }

    pub fn set(
        &self,
        status: AcquisitionStatus,
        detail: Option<String>,
        overflow_location: Option<OverflowLocation>,
    ) {
        *self.current.lock() = status;
        let _ = self.tx.send(StatusEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            status,
            detail,
            overflow_location,
        });
    }

    fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

struct SessionThreads {
    producer: JoinHandle<()>,
    consumer: Option<JoinHandle<()>>,
}

/// The top-level engine handle.
///
/// `AcquisitionEngine` is `Send + Sync`; all fields use interior mutability.
/// Wrap in `Arc` to share with the daemon's command and event tasks.
pub struct AcquisitionEngine {
    config: Mutex<EngineConfig>,
    hw: SharedHardware,
    /// `true` from `start()` until the producer's teardown completes.
    running: Arc<AtomicBool>,
    forced_overflow: Arc<AtomicBool>,
    status: StatusBoard,
    page_tx: broadcast::Sender<PagePersistedEvent>,
    diagnostics: Arc<EngineDiagnostics>,
    session: Mutex<Option<Arc<AcquisitionSession>>>,
    ring: Mutex<Option<Arc<SharedRing>>>,
    threads: Mutex<Option<SessionThreads>>,
    /// Serialises start/stop/set_sample_rate.
    lifecycle: Mutex<()>,
    pending_note: Mutex<Option<String>>,
}

impl AcquisitionEngine {
    pub fn new(config: EngineConfig, hardware: impl HydrophoneHardware) -> Self {
        let (page_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            config: Mutex::new(config),
            hw: Arc::new(Mutex::new(Box::new(hardware))),
            running: Arc::new(AtomicBool::new(false)),
            forced_overflow: Arc::new(AtomicBool::new(false)),
            status: StatusBoard::new(),
            page_tx,
            diagnostics: Arc::new(EngineDiagnostics::default()),
            session: Mutex::new(None),
            ring: Mutex::new(None),
            threads: Mutex::new(None),
            lifecycle: Mutex::new(()),
            pending_note: Mutex::new(None),
        }
    }

    /// Prime the hardware and start both engines.
    ///
    /// Blocks until priming succeeds (or fails), then returns; acquisition
    /// continues on background threads.
    ///
    /// # Errors
    /// - `HydroError::AlreadyRunning` if a session is active.
    /// - `HydroError::GeometryRejected` / transport errors from priming.
    /// - Shared-memory and I/O errors creating the ring or the first file.
    pub fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        self.start_locked()
    }

    fn start_locked(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(HydroError::AlreadyRunning);
        }
        self.reap_threads();

        let config = self.config.lock().clone();
        let resolved = resolve(config.geometry, config.base_file_bytes);
        let layout = config.ring_layout()?;

        self.diagnostics.reset();
        self.forced_overflow.store(false, Ordering::SeqCst);
        self.status.set(AcquisitionStatus::Priming, None, None);

        let (writer, reader) = match SharedRing::create(config.ring.clone(), layout) {
            Ok(pair) => pair,
            Err(e) => return Err(self.fail_start(e)),
        };
        let ring = Arc::clone(writer.ring());

        let session = Arc::new(AcquisitionSession::new(resolved, layout.blocks_per_page()));
        if let Some(note) = self.pending_note.lock().take() {
            session.set_note(note);
        }
        let status_log = Arc::new(StatusLog::new(&config.status_log_path));

        info!(
            bits = config.geometry.bit_depth.bits(),
            rate_hz = config.geometry.sample_rate.hz(),
            channels = config.geometry.channel_count(),
            filter = ?config.geometry.filter_type,
            block_bytes = layout.block_bytes(),
            blocks_per_page = layout.blocks_per_page(),
            rotation_bytes = session.resolved.file_rotation_bytes,
            "starting acquisition"
        );

        self.running.store(true, Ordering::SeqCst);

        let (primed_tx, primed_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);

        let producer_ctx = acquisition::ProducerContext {
            hw: Arc::clone(&self.hw),
            writer,
            session: Arc::clone(&session),
            running: Arc::clone(&self.running),
            forced_overflow: Arc::clone(&self.forced_overflow),
            status: self.status.clone(),
            status_log: Arc::clone(&status_log),
            diagnostics: Arc::clone(&self.diagnostics),
            core: config.producer_core,
            realtime: config.realtime_scheduling,
            primed_tx,
            consumer_done: done_rx,
        };
        let producer = thread::Builder::new()
            .name("hydrotag-producer".into())
            .spawn(move || acquisition::run(producer_ctx))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                self.fail_start(HydroError::Io(e))
            })?;

        // Block until the producer has primed the hardware.
        match primed_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = producer.join();
                self.running.store(false, Ordering::SeqCst);
                return Err(self.fail_start(e));
            }
            Err(_) => {
                let _ = producer.join();
                self.running.store(false, Ordering::SeqCst);
                return Err(self.fail_start(HydroError::Other(anyhow::anyhow!(
                    "producer thread died during priming"
                ))));
            }
        }

        // The first file opens with the first drained page, named by its start stamp.
        let persistence = persistence::Persistence::new(
            config.encoder.build(),
            Arc::clone(&session),
            &config.output_dir,
            Arc::clone(&self.diagnostics),
        );

        let consumer_ctx = persistence::ConsumerContext {
            persistence,
            reader,
            session: Arc::clone(&session),
            status_log,
            page_tx: self.page_tx.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
            core: config.consumer_core,
            done_tx,
        };
        let consumer = match thread::Builder::new()
            .name("hydrotag-consumer".into())
            .spawn(move || persistence::run(consumer_ctx))
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "consumer thread failed to spawn; stopping");
                self.running.store(false, Ordering::SeqCst);
                let _ = producer.join();
                return Err(self.fail_start(HydroError::Io(e)));
            }
        };

        *self.session.lock() = Some(session);
        *self.ring.lock() = Some(ring);
        *self.threads.lock() = Some(SessionThreads { producer, consumer });
        info!("acquisition started");
        Ok(())
    }

    fn fail_start(&self, e: HydroError) -> HydroError {
        warn!(error = %e, "acquisition failed to start");
        self.status
            .set(AcquisitionStatus::Error, Some(e.to_string()), None);
        self.status.set(AcquisitionStatus::Idle, None, None);
        e
    }

    /// Stop acquisition, flush the partial page and wait for both threads.
    /// A no-op when nothing is running.
    pub fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        self.stop_locked()
    }

    fn stop_locked(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("stop requested while idle");
            self.reap_threads();
            return Ok(());
        }
        info!("acquisition stop requested");
        self.reap_threads();
        Ok(())
    }

    /// Join the threads of a finished (or finishing) session.
    fn reap_threads(&self) {
        let Some(threads) = self.threads.lock().take() else {
            return;
        };
        if threads.producer.join().is_err() {
            warn!("producer thread panicked");
        }
        if let Some(consumer) = threads.consumer {
            if consumer.join().is_err() {
                warn!("consumer thread panicked");
            }
        }
    }

    /// Change the sample rate. A running session is stopped and restarted
    /// with the new geometry.
    ///
    /// # Errors
    /// `HydroError::InvalidGeometry` for an unsupported rate; restart errors
    /// as for `start()`.
    pub fn set_sample_rate(&self, hz: u32) -> Result<()> {
        let rate = SampleRate::try_from(hz)?;
        let _lifecycle = self.lifecycle.lock();
        let was_running = self.running.load(Ordering::SeqCst);
        if was_running {
            self.stop_locked()?;
        }
        {
            let mut config = self.config.lock();
            config.geometry.sample_rate = rate;
        }
        info!(rate_hz = hz, restart = was_running, "sample rate changed");
        if was_running {
            self.start_locked()?;
        }
        Ok(())
    }

    /// Reset the hardware FIFO. Only allowed while stopped.
    ///
    /// # Errors
    /// `HydroError::AlreadyRunning` during a session.
    pub fn reset_fifo(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.running.load(Ordering::SeqCst) {
            return Err(HydroError::AlreadyRunning);
        }
        self.reap_threads();
        self.hw.lock().fifo_reset()?;
        info!("FIFO reset");
        Ok(())
    }

    /// Raise an overflow at the producer's next check point and return.
    ///
    /// # Errors
    /// `HydroError::NotRunning` when no session is active.
    pub fn force_overflow(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(HydroError::NotRunning);
        }
        self.forced_overflow.store(true, Ordering::SeqCst);
        warn!("overflow forced from command");
        Ok(())
    }

    /// Force an overflow and wait for the teardown to finish. A no-op when
    /// no session is streaming.
    pub fn simulate_overflow(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if !self.running.load(Ordering::SeqCst) {
            debug!("simulate_overflow while idle");
            return Ok(());
        }
        self.forced_overflow.store(true, Ordering::SeqCst);
        warn!("simulated overflow");
        self.reap_threads();
        Ok(())
    }

    /// Attach a free-text note to the next audit row.
    pub fn note(&self, text: impl Into<String>) {
        let text = text.into();
        match self.current_session() {
            Some(session) if self.is_running() => session.set_note(text),
            _ => *self.pending_note.lock() = Some(text),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> AcquisitionStatus {
        self.status.get()
    }

    pub fn config(&self) -> EngineConfig {
        self.config.lock().clone()
    }

    /// Session of the running (or most recent) acquisition.
    pub fn current_session(&self) -> Option<Arc<AcquisitionSession>> {
        self.session.lock().clone()
    }

    /// Ring of the running (or most recent) acquisition.
    pub fn current_ring(&self) -> Option<Arc<SharedRing>> {
        self.ring.lock().clone()
    }

    /// Overflow location of the most recent session, if it overflowed.
    pub fn last_overflow(&self) -> Option<OverflowLocation> {
        self.current_session()?.overflow_location()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    pub fn subscribe_pages(&self) -> broadcast::Receiver<PagePersistedEvent> {
        self.page_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

impl Drop for AcquisitionEngine {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.reap_threads();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::FilterType;
    use crate::hardware::SimulatedHydrophone;
    use std::time::Instant;

    fn wait_for_blocks(engine: &AcquisitionEngine, blocks: u64) {
        let ring = engine.current_ring().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while ring.block_ready_total() < blocks && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(ring.block_ready_total(), blocks);
    }

    fn config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            geometry: SampleGeometry::new(16, 96_000, 3, FilterType::Wideband).unwrap(),
            encoder: EncoderKind::Raw,
            output_dir: dir.join("out"),
            status_log_path: dir.join("status.csv"),
            ring: RingNames::new(dir.join("shm"), "engine-test"),
            blocks_per_page: Some(4),
            realtime_scheduling: false,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn default_config_layout_covers_page_duration() {
        let layout = EngineConfig::default().ring_layout().unwrap();
        assert_eq!(layout.block_bytes(), 4096);
        // 30 s at 750 Hz × 4 ch × 4 B = 360 000 bytes → 88 blocks.
        assert_eq!(layout.blocks_per_page(), 88);
    }

    #[test]
    fn stop_when_idle_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AcquisitionEngine::new(config(dir.path()), SimulatedHydrophone::new());
        engine.stop().unwrap();
        engine.stop().unwrap();
        assert_eq!(engine.status(), AcquisitionStatus::Idle);
        assert!(matches!(engine.force_overflow(), Err(HydroError::NotRunning)));
        engine.simulate_overflow().unwrap();
    }

    #[test]
    fn double_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let hw = SimulatedHydrophone::new();
        hw.faults().limit_blocks(1);
        let engine = AcquisitionEngine::new(config(dir.path()), hw);
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(HydroError::AlreadyRunning)));
        assert!(matches!(engine.reset_fifo(), Err(HydroError::AlreadyRunning)));
        engine.stop().unwrap();
        assert!(!engine.is_running());
    }

    #[test]
    fn invalid_rate_is_rejected_without_touching_config() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AcquisitionEngine::new(config(dir.path()), SimulatedHydrophone::new());
        assert!(engine.set_sample_rate(44_100).is_err());
        assert_eq!(engine.config().geometry.sample_rate, SampleRate::Hz96k);
        engine.set_sample_rate(192_000).unwrap();
        assert_eq!(engine.config().geometry.sample_rate, SampleRate::Hz192k);
    }

    #[test]
    fn note_before_start_lands_in_first_audit_row() {
        let dir = tempfile::tempdir().unwrap();
        let hw = SimulatedHydrophone::new();
        hw.faults().limit_blocks(2);
        let engine = AcquisitionEngine::new(config(dir.path()), hw);
        engine.note("pre-deploy check");
        engine.start().unwrap();
        wait_for_blocks(&engine, 2);
        engine.stop().unwrap();

        let rows = crate::status_log::read_status_rows(&dir.path().join("status.csv")).unwrap();
        assert_eq!(rows.len(), 2, "one partial page: drain start and drain end");
        assert_eq!(rows[0].notes, "pre-deploy check");
        assert_eq!(rows[0].start_writing_marker, 1);
        assert_eq!(rows[1].done_writing_marker, 1);
        assert!(rows[1].notes.is_empty(), "a note is recorded once");
    }
}
