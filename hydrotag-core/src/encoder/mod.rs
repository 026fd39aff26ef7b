//! Sample encoders.
//!
//! The `SampleEncoder` trait is the seam between the persistence engine and
//! the on-disk format: `WavEncoder` (default) or `RawEncoder`, chosen at
//! startup through `EncoderKind`. Both receive sign-extended integer samples
//! recovered from the ring's wire words by `convert_page`.

pub mod raw;
pub mod wav;

pub use raw::{read_raw_samples, RawEncoder};
pub use wav::WavEncoder;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geometry::{unpack_wire_sample, BitDepth, SampleGeometry, STORED_BYTES_PER_SAMPLE};

/// Which encoder the persistence engine builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    #[default]
    Wav,
    Raw,
}

impl EncoderKind {
    pub fn build(self) -> Box<dyn SampleEncoder> {
        match self {
            EncoderKind::Wav => Box::new(WavEncoder::default()),
            EncoderKind::Raw => Box::new(RawEncoder::default()),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            EncoderKind::Wav => "wav",
            EncoderKind::Raw => "raw",
        }
    }
}

/// File-at-a-time sample sink.
///
/// Byte counts returned are encoded *sample* bytes, excluding any container
/// header, so rotation thresholds mean the same thing for every format.
pub trait SampleEncoder: Send + 'static {
    /// File extension without the dot.
    fn extension(&self) -> &'static str;

    /// Open `path` for a new file at `geometry`. Any open file must have been
    /// finished first.
    fn begin_file(&mut self, path: &Path, geometry: &SampleGeometry) -> Result<()>;

    /// Append interleaved samples; returns encoded bytes written.
    fn write_samples(&mut self, samples: &[i32]) -> Result<u64>;

    /// Finalize the open file; returns encoded sample bytes in it.
    fn finish_file(&mut self) -> Result<u64>;

    fn is_open(&self) -> bool;
}

/// Recover sign-extended samples from a span of wire words.
///
/// Trailing bytes that do not form a whole word are ignored.
pub fn convert_page(bytes: &[u8], depth: BitDepth) -> Vec<i32> {
    bytes
        .chunks_exact(STORED_BYTES_PER_SAMPLE)
        .map(|w| unpack_wire_sample([w[0], w[1], w[2], w[3]], depth))
        .collect()
}
