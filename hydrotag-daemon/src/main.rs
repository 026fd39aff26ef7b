//! Hydrotag acquisition daemon entry point.
//!
//! Reads commands from stdin (one per line), prints engine events and command
//! replies to stdout as JSON lines, and stops the session cleanly on SIGINT
//! or end of input.

mod commands;
mod settings;
mod state;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use hydrotag_core::{AcquisitionEngine, AcquisitionStatus, SimulatedHydrophone};
use serde::Serialize;
use settings::{default_settings_path, load_settings};
use state::DaemonState;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use commands::{execute, parse_command, Reply};

fn emit<T: Serialize>(kind: &str, payload: &T) {
    match serde_json::to_string(&serde_json::json!({ "event": kind, "data": payload })) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, kind, "event not serializable"),
    }
}

/// Forward status events to stdout and restart after overflow teardowns.
fn spawn_status_forwarder(state: Arc<DaemonState>) {
    let mut rx = state.engine.subscribe_status();
    tokio::spawn(async move {
        let mut overflowed = false;
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "status forwarder lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            emit("status", &event);

            match event.status {
                AcquisitionStatus::Overflowed => overflowed = true,
                AcquisitionStatus::Priming | AcquisitionStatus::Streaming => overflowed = false,
                AcquisitionStatus::Idle if overflowed => {
                    overflowed = false;
                    if !state.restart_on_overflow() {
                        continue;
                    }
                    let engine = Arc::clone(&state.engine);
                    let restarts = Arc::clone(&state.overflow_restarts);
                    tokio::task::spawn_blocking(move || {
                        let n = restarts.fetch_add(1, Ordering::Relaxed) + 1;
                        info!(restart = n, "restarting acquisition after overflow");
                        if let Err(e) = engine.start() {
                            error!(error = %e, "restart after overflow failed");
                        }
                    });
                }
                _ => {}
            }
        }
    });
}

fn spawn_page_forwarder(state: &DaemonState) {
    let mut rx = state.engine.subscribe_pages();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => emit("page", &event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "page forwarder lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Run one command on the blocking pool. Returns false once the loop should end.
async fn handle_line(state: &Arc<DaemonState>, line: &str) -> bool {
    let command = match parse_command(line) {
        Ok(Some(command)) => command,
        Ok(None) => return true,
        Err(msg) => {
            emit("error", &msg);
            return true;
        }
    };
    let worker = Arc::clone(state);
    let outcome = tokio::task::spawn_blocking(move || execute(&worker, command)).await;
    match outcome {
        Ok(Ok(Reply::Ok(msg))) => emit("ok", &msg),
        Ok(Ok(Reply::Status(report))) => emit("report", &report),
        Ok(Ok(Reply::Quit)) => return false,
        Ok(Err(msg)) => emit("error", &msg),
        Err(e) => {
            error!(error = %e, "command task failed");
            emit("error", &e.to_string());
        }
    }
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hydrotag=info")),
        )
        .init();

    info!("hydrotag starting");

    let settings_path = default_settings_path();
    let settings = load_settings(&settings_path)
        .with_context(|| format!("reading settings from {}", settings_path.display()))?;
    let config = settings
        .to_engine_config()
        .context("settings describe an unsupported sample geometry")?;
    info!(
        settings_path = ?settings_path,
        rate_hz = config.geometry.sample_rate.hz(),
        bits = config.geometry.bit_depth.bits(),
        channels = config.geometry.channel_count(),
        encoder = ?config.encoder,
        output_dir = %config.output_dir.display(),
        restart_on_overflow = settings.restart_on_overflow,
        "settings loaded"
    );

    // ── Engine setup ──────────────────────────────────────────────────────
    // No bus driver ships with this repository; the simulated front-end is
    // paced in real time.
    let engine = Arc::new(AcquisitionEngine::new(config, SimulatedHydrophone::realtime()));
    let auto_start = settings.auto_start;
    let state = Arc::new(DaemonState::new(engine, settings, settings_path));

    spawn_status_forwarder(Arc::clone(&state));
    spawn_page_forwarder(&state);

    if auto_start && !handle_line(&state, "start").await {
        return Ok(());
    }

    // ── Command loop ──────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(&state, &line).await {
                        break;
                    }
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "stdin read failed");
                    break;
                }
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "ctrl-c handler failed");
                }
                info!("interrupt received");
                break;
            }
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────
    state.shutting_down.store(true, Ordering::SeqCst);
    let engine = Arc::clone(&state.engine);
    tokio::task::spawn_blocking(move || engine.stop())
        .await
        .context("stop task panicked")?
        .context("stopping acquisition")?;
    let diag = state.engine.diagnostics_snapshot();
    info!(
        blocks = diag.blocks_written,
        pages = diag.pages_persisted,
        overflows = diag.overflows,
        restarts = state.overflow_restarts.load(Ordering::Relaxed),
        "hydrotag stopped"
    );
    Ok(())
}
