//! # hydrotag-core
//!
//! Acquisition pipeline for an animal-borne hydrophone tag.
//!
//! ## Architecture
//!
//! ```text
//! settings → SampleGeometry ──resolve──► RegisterProgram ──► HydrophoneHardware
//!                                                                 │ FIFO
//!                                     producer (SCHED_RR, pinned) ▼
//!                                 ┌──────── SharedRing (shm, 2 pages) ───────┐
//!                                 │ block-ready                 page-ready   │
//!                          BlockObserver                 consumer (nice 19)  │
//!                          (read-only)                    → SampleEncoder → files
//!                                                         → StatusLog (CSV)
//! ```
//!
//! The producer never waits on the consumer. Only the ring and the signal
//! counters cross the thread (and process) boundary.

#![deny(unsafe_code)]
#![warn(clippy::all)]

#[allow(unsafe_code)]
pub mod buffering;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod hardware;
pub mod ipc;
pub mod status_log;

// Convenience re-exports for downstream crates
pub use buffering::{BlockObserver, RingLayout, RingNames, SharedRing};
pub use encoder::{EncoderKind, SampleEncoder};
pub use engine::{AcquisitionEngine, DiagnosticsSnapshot, EngineConfig, SessionSnapshot};
pub use error::{HydroError, Result};
pub use geometry::{resolve, BitDepth, FilterType, ResolvedGeometry, SampleGeometry, SampleRate};
pub use hardware::{HydrophoneHardware, Register, SimulatedHydrophone};
pub use ipc::events::{AcquisitionStatus, OverflowLocation, PagePersistedEvent, StatusEvent};
