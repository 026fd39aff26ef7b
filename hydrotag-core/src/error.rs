use thiserror::Error;

use crate::hardware::Register;

/// All errors produced by hydrotag-core.
#[derive(Debug, Error)]
pub enum HydroError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error(
        "geometry rejected by hardware: {register:?} wrote {wrote:#06x}, read back {read:#06x} after {attempts} attempts"
    )]
    GeometryRejected {
        register: Register,
        wrote: u32,
        read: u32,
        attempts: u32,
    },

    #[error("shared memory error: {0}")]
    SharedMemory(String),

    #[error("ring addressing error: {0}")]
    RingAddress(String),

    #[error("ring overrun: page {page} has not been drained")]
    RingOverrun { page: usize },

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("status log error: {0}")]
    StatusLog(#[from] csv::Error),

    #[error("acquisition is already running")]
    AlreadyRunning,

    #[error("acquisition is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<hound::Error> for HydroError {
    fn from(e: hound::Error) -> Self {
        HydroError::Encoder(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HydroError>;
