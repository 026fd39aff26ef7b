//! Headerless packed PCM: 2 or 3 little-endian bytes per sample, interleaved.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use super::SampleEncoder;
use crate::error::{HydroError, Result};
use crate::geometry::{BitDepth, SampleGeometry};

#[derive(Default)]
pub struct RawEncoder {
    out: Option<BufWriter<File>>,
    depth: Option<BitDepth>,
    bytes: u64,
}

fn pack(sample: i32, depth: BitDepth, buf: &mut Vec<u8>) {
    let le = sample.to_le_bytes();
    buf.extend_from_slice(&le[..depth.packed_bytes()]);
}

impl SampleEncoder for RawEncoder {
    fn extension(&self) -> &'static str {
        "raw"
    }

    fn begin_file(&mut self, path: &Path, geometry: &SampleGeometry) -> Result<()> {
        if self.out.is_some() {
            return Err(HydroError::Encoder("previous raw file not finished".into()));
        }
        self.out = Some(BufWriter::new(File::create(path)?));
        self.depth = Some(geometry.bit_depth);
        self.bytes = 0;
        Ok(())
    }

    fn write_samples(&mut self, samples: &[i32]) -> Result<u64> {
        let (Some(out), Some(depth)) = (self.out.as_mut(), self.depth) else {
            return Err(HydroError::Encoder("no raw file open".into()));
        };
        let mut buf = Vec::with_capacity(samples.len() * depth.packed_bytes());
        for &s in samples {
            pack(s, depth, &mut buf);
        }
        out.write_all(&buf)?;
        self.bytes += buf.len() as u64;
        Ok(buf.len() as u64)
    }

    fn finish_file(&mut self) -> Result<u64> {
        let mut out = self
            .out
            .take()
            .ok_or_else(|| HydroError::Encoder("no raw file open".into()))?;
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(std::mem::take(&mut self.bytes))
    }

    fn is_open(&self) -> bool {
        self.out.is_some()
    }
}

/// Decode a file written by `RawEncoder`.
pub fn read_raw_samples(path: &Path, depth: BitDepth) -> Result<Vec<i32>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let width = depth.packed_bytes();
    if bytes.len() % width != 0 {
        return Err(HydroError::Encoder(format!(
            "{} is {} bytes, not a whole number of {width}-byte samples",
            path.display(),
            bytes.len()
        )));
    }
    let shift = 32 - depth.bits();
    Ok(bytes
        .chunks_exact(width)
        .map(|c| {
            let mut le = [0u8; 4];
            le[..width].copy_from_slice(c);
            (i32::from_le_bytes(le) << shift) >> shift
        })
        .collect())
}
