//! Types published to subscribers outside the engine.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so the daemon
//! can forward them as JSON lines.

pub mod events;
