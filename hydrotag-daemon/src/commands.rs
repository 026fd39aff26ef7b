//! Line-oriented command surface.
//!
//! One command per stdin line. Handlers are synchronous and may block on the
//! engine (start primes the hardware, stop joins both threads), so the loop in
//! `main` runs them on the blocking pool.

use std::sync::atomic::Ordering;

use tracing::{info, warn};

use crate::settings::save_settings;
use crate::state::{DaemonState, StatusReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    SetSampleRate(u32),
    ResetFifo,
    SimulateOverflow,
    ForceOverflow,
    Note(String),
    Status,
    Quit,
}

#[derive(Debug)]
pub enum Reply {
    Ok(&'static str),
    Status(Box<StatusReport>),
    Quit,
}

/// Parse one input line. Blank lines and `#` comments yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let no_args = |cmd: Command| {
        if rest.is_empty() {
            Ok(Some(cmd))
        } else {
            Err(format!("`{word}` takes no arguments"))
        }
    };

    match word.to_ascii_lowercase().as_str() {
        "start" => no_args(Command::Start),
        "stop" => no_args(Command::Stop),
        "reset_fifo" => no_args(Command::ResetFifo),
        "simulate_overflow" => no_args(Command::SimulateOverflow),
        "force_overflow" => no_args(Command::ForceOverflow),
        "status" => no_args(Command::Status),
        "quit" | "exit" => no_args(Command::Quit),
        "set_sample_rate" => {
            let hz = rest
                .parse::<u32>()
                .map_err(|_| format!("set_sample_rate expects a rate in Hz, got `{rest}`"))?;
            Ok(Some(Command::SetSampleRate(hz)))
        }
        "note" => {
            if rest.is_empty() {
                Err("note expects text".into())
            } else {
                Ok(Some(Command::Note(rest.to_string())))
            }
        }
        other => Err(format!("unknown command `{other}`")),
    }
}

/// Run one command against the engine.
pub fn execute(state: &DaemonState, command: Command) -> Result<Reply, String> {
    state.commands_handled.fetch_add(1, Ordering::Relaxed);
    match command {
        Command::Start => {
            state.engine.start().map_err(|e| e.to_string())?;
            Ok(Reply::Ok("started"))
        }
        Command::Stop => {
            state.engine.stop().map_err(|e| e.to_string())?;
            let diag = state.engine.diagnostics_snapshot();
            info!(
                blocks = diag.blocks_written,
                pages = diag.pages_persisted,
                files = diag.files_opened,
                "diagnostics snapshot on stop"
            );
            Ok(Reply::Ok("stopped"))
        }
        Command::SetSampleRate(hz) => {
            state.engine.set_sample_rate(hz).map_err(|e| e.to_string())?;
            let mut settings = state.settings.lock();
            settings.sample_rate = hz;
            if let Err(e) = save_settings(&state.settings_path, &settings) {
                warn!(error = %e, "sample rate applied but not persisted");
            }
            Ok(Reply::Ok("sample rate set"))
        }
        Command::ResetFifo => {
            state.engine.reset_fifo().map_err(|e| e.to_string())?;
            Ok(Reply::Ok("fifo reset"))
        }
        Command::SimulateOverflow => {
            state.engine.simulate_overflow().map_err(|e| e.to_string())?;
            Ok(Reply::Ok("overflow simulated"))
        }
        Command::ForceOverflow => {
            state.engine.force_overflow().map_err(|e| e.to_string())?;
            Ok(Reply::Ok("overflow forced"))
        }
        Command::Note(text) => {
            state.engine.note(text);
            Ok(Reply::Ok("note queued"))
        }
        Command::Status => Ok(Reply::Status(Box::new(state.report()))),
        Command::Quit => Ok(Reply::Quit),
    }
}
