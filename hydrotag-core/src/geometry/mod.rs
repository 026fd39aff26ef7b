//! Sample geometry: validation, block sizing, timing budget and file rotation.
//!
//! ## Wire layout
//!
//! Every sample travels as one 32-bit big-endian word, value left-justified:
//!
//! ```text
//! 24-bit:  [ b23..b16 | b15..b8 | b7..b0 | pad ]
//! 16-bit:  [ b15..b8  | b7..b0  |  pad   | pad ]
//! ```
//!
//! Frames interleave channels (`ch0 ch1 ch2 [ch3]`) with no extra framing, so a
//! block is valid as long as it holds a whole number of frames.

pub mod program;

pub use program::{RegisterProgram, MAX_REGISTER_ATTEMPTS};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HydroError, Result};

/// Bytes each sample occupies on the wire and in the ring, regardless of depth.
pub const STORED_BYTES_PER_SAMPLE: usize = 4;

/// FIFO fill level at which the FPGA raises "data ready" pressure.
pub const FIFO_HIGH_WATER_BYTES: usize = 8192;

/// Blocks are sized to half the high-water mark (rounded down to whole frames).
pub const BLOCK_TARGET_BYTES: usize = FIFO_HIGH_WATER_BYTES / 2;

/// Default audio duration held by one page of the ring.
pub const DEFAULT_PAGE_DURATION: Duration = Duration::from_secs(30);

/// Default rotation threshold at the baseline rate multiplier (64 MiB).
pub const DEFAULT_BASE_FILE_BYTES: u64 = 64 * 1024 * 1024;

/// Sample width delivered by the ADC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BitDepth {
    Sixteen,
    TwentyFour,
}

impl BitDepth {
    pub const fn bits(self) -> u32 {
        match self {
            BitDepth::Sixteen => 16,
            BitDepth::TwentyFour => 24,
        }
    }

    /// Bytes per sample once packed for the encoder.
    pub const fn packed_bytes(self) -> usize {
        match self {
            BitDepth::Sixteen => 2,
            BitDepth::TwentyFour => 3,
        }
    }
}

impl TryFrom<u32> for BitDepth {
    type Error = HydroError;

    fn try_from(bits: u32) -> Result<Self> {
        match bits {
            16 => Ok(BitDepth::Sixteen),
            24 => Ok(BitDepth::TwentyFour),
            other => Err(HydroError::InvalidGeometry(format!(
                "unsupported bit depth {other} (expected 16 or 24)"
            ))),
        }
    }
}

impl From<BitDepth> for u32 {
    fn from(depth: BitDepth) -> u32 {
        depth.bits()
    }
}

/// Supported output data rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SampleRate {
    /// Low-power monitoring rate, 750 Hz.
    Default,
    Hz48k,
    Hz96k,
    Hz192k,
}

impl SampleRate {
    pub const ALL: [SampleRate; 4] = [
        SampleRate::Default,
        SampleRate::Hz48k,
        SampleRate::Hz96k,
        SampleRate::Hz192k,
    ];

    pub const fn hz(self) -> u32 {
        match self {
            SampleRate::Default => 750,
            SampleRate::Hz48k => 48_000,
            SampleRate::Hz96k => 96_000,
            SampleRate::Hz192k => 192_000,
        }
    }

    pub fn from_hz(hz: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|rate| rate.hz() == hz)
    }

    /// Rotation multiplier: files hold a comparable duration at every rate.
    pub const fn rotation_multiplier(self) -> u64 {
        match self {
            SampleRate::Default | SampleRate::Hz48k => 1,
            SampleRate::Hz96k => 2,
            SampleRate::Hz192k => 4,
        }
    }
}

impl TryFrom<u32> for SampleRate {
    type Error = HydroError;

    fn try_from(hz: u32) -> Result<Self> {
        SampleRate::from_hz(hz).ok_or_else(|| {
            HydroError::InvalidGeometry(format!(
                "unsupported sample rate {hz} Hz (expected 750, 48000, 96000 or 192000)"
            ))
        })
    }
}

impl From<SampleRate> for u32 {
    fn from(rate: SampleRate) -> u32 {
        rate.hz()
    }
}

/// ADC digital filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    Wideband,
    Sinc5,
}

/// Immutable per-session sample layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "GeometryFields")]
pub struct SampleGeometry {
    pub bit_depth: BitDepth,
    pub sample_rate: SampleRate,
    channel_count: u8,
    pub filter_type: FilterType,
}

impl SampleGeometry {
    /// Validate a raw configuration tuple.
    ///
    /// # Errors
    /// `HydroError::InvalidGeometry` for any value outside the supported set.
    /// Nothing is substituted: a bad tuple fails the session start.
    pub fn new(
        bit_depth: u32,
        sample_rate_hz: u32,
        channel_count: u32,
        filter_type: FilterType,
    ) -> Result<Self> {
        let bit_depth = BitDepth::try_from(bit_depth)?;
        let sample_rate = SampleRate::try_from(sample_rate_hz)?;
        let channel_count = match channel_count {
            3 | 4 => channel_count as u8,
            other => {
                return Err(HydroError::InvalidGeometry(format!(
                    "unsupported channel count {other} (expected 3 or 4)"
                )))
            }
        };
        Ok(Self {
            bit_depth,
            sample_rate,
            channel_count,
            filter_type,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count as usize
    }

    /// Bytes per interleaved frame on the wire.
    pub fn frame_bytes(&self) -> usize {
        self.channel_count() * STORED_BYTES_PER_SAMPLE
    }

    /// Largest whole number of frames that fits the block target.
    pub fn block_bytes(&self) -> usize {
        let frame = self.frame_bytes();
        (BLOCK_TARGET_BYTES / frame) * frame
    }

    /// Wire bytes produced per second.
    pub fn wire_bytes_per_second(&self) -> u64 {
        self.frame_bytes() as u64 * self.sample_rate.hz() as u64
    }

    /// Time the FIFO needs to accumulate one block, in microseconds.
    pub fn block_fill_interval_us(&self) -> u64 {
        self.block_bytes() as u64 * 1_000_000 / self.wire_bytes_per_second()
    }

    /// Number of blocks per ring page for a target page duration (at least one).
    pub fn blocks_per_page(&self, page_duration: Duration) -> usize {
        let page_bytes = self.wire_bytes_per_second() as u128 * page_duration.as_micros() / 1_000_000;
        let block = self.block_bytes() as u128;
        (page_bytes.div_ceil(block) as usize).max(1)
    }

    /// Encoded size of `wire_bytes` of ring data.
    pub fn encoded_len(&self, wire_bytes: usize) -> usize {
        wire_bytes / STORED_BYTES_PER_SAMPLE * self.bit_depth.packed_bytes()
    }
}

impl Default for SampleGeometry {
    /// 16-bit, slow default rate, four channels, wideband filter.
    fn default() -> Self {
        Self {
            bit_depth: BitDepth::Sixteen,
            sample_rate: SampleRate::Default,
            channel_count: 4,
            filter_type: FilterType::Wideband,
        }
    }
}

/// Pack a sample value into its left-justified big-endian wire word.
pub fn pack_wire_sample(value: i32, depth: BitDepth) -> [u8; STORED_BYTES_PER_SAMPLE] {
    ((value as u32) << (32 - depth.bits())).to_be_bytes()
}

/// Recover a sign-extended sample from its wire word; padding bits are ignored.
pub fn unpack_wire_sample(word: [u8; STORED_BYTES_PER_SAMPLE], depth: BitDepth) -> i32 {
    i32::from_be_bytes(word) >> (32 - depth.bits())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeometryFields {
    bit_depth: u32,
    sample_rate: u32,
    channel_count: u32,
    filter_type: FilterType,
}

impl TryFrom<GeometryFields> for SampleGeometry {
    type Error = HydroError;

    fn try_from(f: GeometryFields) -> Result<Self> {
        SampleGeometry::new(f.bit_depth, f.sample_rate, f.channel_count, f.filter_type)
    }
}

/// Everything derived from a geometry at session start.
#[derive(Debug, Clone)]
pub struct ResolvedGeometry {
    pub geometry: SampleGeometry,
    pub register_program: RegisterProgram,
    pub block_bytes: usize,
    pub block_fill_interval: Duration,
    pub file_rotation_bytes: u64,
}

impl ResolvedGeometry {
    pub fn block_fill_interval_us(&self) -> u64 {
        self.block_fill_interval.as_micros() as u64
    }

    /// Sleep slice used while polling "data ready".
    pub fn poll_interval(&self) -> Duration {
        self.block_fill_interval / 20
    }
}

/// Resolve a geometry into its register program, block size, deadline and
/// rotation threshold.
///
/// The rotation threshold depends on the sample rate only: bit depth does not
/// scale it, so files at a given rate always rotate at the same byte count.
pub fn resolve(geometry: SampleGeometry, base_file_bytes: u64) -> ResolvedGeometry {
    let block_fill_interval_us = geometry.block_fill_interval_us();
    ResolvedGeometry {
        geometry,
        register_program: RegisterProgram::for_geometry(&geometry),
        block_bytes: geometry.block_bytes(),
        block_fill_interval: Duration::from_micros(block_fill_interval_us),
        file_rotation_bytes: base_file_bytes * geometry.sample_rate.rotation_multiplier(),
    }
}
