//! RIFF/WAVE integer PCM through `hound`.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};

use super::SampleEncoder;
use crate::error::{HydroError, Result};
use crate::geometry::{BitDepth, SampleGeometry};

#[derive(Default)]
pub struct WavEncoder {
    writer: Option<WavWriter<BufWriter<File>>>,
    depth: Option<BitDepth>,
    bytes: u64,
}

impl SampleEncoder for WavEncoder {
    fn extension(&self) -> &'static str {
        "wav"
    }

    fn begin_file(&mut self, path: &Path, geometry: &SampleGeometry) -> Result<()> {
        if self.writer.is_some() {
            return Err(HydroError::Encoder("previous WAV file not finished".into()));
        }
        let spec = WavSpec {
            channels: geometry.channel_count() as u16,
            sample_rate: geometry.sample_rate.hz(),
            bits_per_sample: geometry.bit_depth.bits() as u16,
            sample_format: SampleFormat::Int,
        };
        self.writer = Some(WavWriter::create(path, spec)?);
        self.depth = Some(geometry.bit_depth);
        self.bytes = 0;
        Ok(())
    }

    fn write_samples(&mut self, samples: &[i32]) -> Result<u64> {
        let (Some(writer), Some(depth)) = (self.writer.as_mut(), self.depth) else {
            return Err(HydroError::Encoder("no WAV file open".into()));
        };
        match depth {
            BitDepth::Sixteen => {
                for &s in samples {
                    writer.write_sample(s as i16)?;
                }
            }
            BitDepth::TwentyFour => {
                for &s in samples {
                    writer.write_sample(s)?;
                }
            }
        }
        let written = (samples.len() * depth.packed_bytes()) as u64;
        self.bytes += written;
        Ok(written)
    }

    fn finish_file(&mut self) -> Result<u64> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| HydroError::Encoder("no WAV file open".into()))?;
        writer.finalize()?;
        Ok(std::mem::take(&mut self.bytes))
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}
