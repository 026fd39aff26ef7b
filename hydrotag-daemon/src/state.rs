//! Daemon state shared by the command loop and the event forwarders.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use hydrotag_core::{
    AcquisitionEngine, AcquisitionStatus, DiagnosticsSnapshot, OverflowLocation, SessionSnapshot,
};
use parking_lot::Mutex;
use serde::Serialize;

use crate::settings::DaemonSettings;

pub struct DaemonState {
    pub engine: Arc<AcquisitionEngine>,
    /// Persisted settings cache.
    pub settings: Arc<Mutex<DaemonSettings>>,
    /// Absolute path to `settings.json`.
    pub settings_path: PathBuf,
    /// Set once shutdown begins; suppresses automatic restarts.
    pub shutting_down: Arc<AtomicBool>,
    /// Sessions restarted after an overflow teardown.
    pub overflow_restarts: Arc<AtomicUsize>,
    /// Commands accepted since launch.
    pub commands_handled: Arc<AtomicUsize>,
}

impl DaemonState {
    pub fn new(engine: Arc<AcquisitionEngine>, settings: DaemonSettings, settings_path: PathBuf) -> Self {
        Self {
            engine,
            settings: Arc::new(Mutex::new(settings)),
            settings_path,
            shutting_down: Arc::new(AtomicBool::new(false)),
            overflow_restarts: Arc::new(AtomicUsize::new(0)),
            commands_handled: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn restart_on_overflow(&self) -> bool {
        self.settings.lock().restart_on_overflow && !self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            status: self.engine.status(),
            running: self.engine.is_running(),
            last_overflow: self.engine.last_overflow(),
            session: self.engine.current_session().map(|s| s.snapshot()),
            diagnostics: self.engine.diagnostics_snapshot(),
            overflow_restarts: self.overflow_restarts.load(Ordering::Relaxed),
            commands_handled: self.commands_handled.load(Ordering::Relaxed),
        }
    }
}

/// Reply to the `status` command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: AcquisitionStatus,
    pub running: bool,
    pub last_overflow: Option<OverflowLocation>,
    pub session: Option<SessionSnapshot>,
    pub diagnostics: DiagnosticsSnapshot,
    pub overflow_restarts: usize,
    pub commands_handled: usize,
}
