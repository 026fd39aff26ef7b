//! `SimulatedHydrophone`: in-memory stand-in for the ADC and FPGA front-end.
//!
//! Behaves like the real register service closely enough to drive the whole
//! pipeline: writes are latched on `sync()`, the FIFO emits one junk word
//! after every start, samples follow a deterministic pattern derived from the
//! configured registers, and a `FaultInjector` handle can break things on
//! demand (register rejection, transport failure, overflow).
//!
//! Clones share state, so a test can hand one clone to the engine and keep
//! another to inspect or inject faults.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use super::{HydrophoneHardware, Register};
use crate::error::{HydroError, Result};
use crate::geometry::{
    pack_wire_sample,
    program::{depth_from_register, rate_from_registers},
    BitDepth, SampleRate, FIFO_HIGH_WATER_BYTES, STORED_BYTES_PER_SAMPLE,
};

/// Word the FIFO emits once after each cold start.
pub const COLD_START_JUNK: [u8; STORED_BYTES_PER_SAMPLE] = [0xA5; STORED_BYTES_PER_SAMPLE];

/// Read-back of a register that has never latched a write.
pub const POWER_ON_VALUE: u32 = 0xFFFF_FFFF;

/// `FpgaFifoControl` bits.
pub const FIFO_CONTROL_RUN: u32 = 1 << 0;
pub const FIFO_CONTROL_RESET: u32 = 1 << 1;

/// Backlog beyond which a paced FIFO latches its overflow line.
const FIFO_CAPACITY_BYTES: u64 = 2 * FIFO_HIGH_WATER_BYTES as u64;

/// Deterministic test pattern for frame `frame`, channel `channel`.
pub fn synthetic_sample(frame: u64, channel: usize, depth: BitDepth) -> i32 {
    let span = 1u64 << depth.bits();
    let raw = (frame.wrapping_mul(7_919) + channel as u64 * 104_729) % span;
    raw as i32 - (span / 2) as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pacing {
    /// Data is available as fast as it is read.
    Unpaced,
    /// Data accrues at the configured sample rate.
    Realtime,
}

#[derive(Debug)]
struct SimState {
    pacing: Pacing,
    shadow: HashMap<Register, u32>,
    registers: HashMap<Register, u32>,
    write_counts: HashMap<Register, usize>,
    streaming: bool,
    started_at: Option<Instant>,
    junk_pending: bool,
    bytes_transferred: u64,
    transfers: u64,
    overflow_latched: bool,
    start_count: usize,
    stop_count: usize,
    reset_count: usize,
    // faults
    rejected: HashSet<Register>,
    rejected_once: HashSet<Register>,
    fail_transfers_after: Option<u64>,
    overflow_after_bytes: Option<u64>,
    block_budget: Option<u64>,
    transfer_delay: Option<Duration>,
}

impl SimState {
    fn new(pacing: Pacing) -> Self {
        Self {
            pacing,
            shadow: HashMap::new(),
            registers: HashMap::new(),
            write_counts: HashMap::new(),
            streaming: false,
            started_at: None,
            junk_pending: false,
            bytes_transferred: 0,
            transfers: 0,
            overflow_latched: false,
            start_count: 0,
            stop_count: 0,
            reset_count: 0,
            rejected: HashSet::new(),
            rejected_once: HashSet::new(),
            fail_transfers_after: None,
            overflow_after_bytes: None,
            block_budget: None,
            transfer_delay: None,
        }
    }

    fn geometry_parts(&self) -> Option<(BitDepth, SampleRate, usize)> {
        let rate = rate_from_registers(
            *self.registers.get(&Register::AdcPowerClock)?,
            *self.registers.get(&Register::AdcChannelMode)?,
        )?;
        let depth = depth_from_register(*self.registers.get(&Register::FpgaBitDepth)?)?;
        let channels = *self.registers.get(&Register::FpgaChannelCount)? as usize;
        (channels > 0).then_some((depth, rate, channels))
    }

    fn block_bytes(&self) -> Option<u64> {
        let (_, _, channels) = self.geometry_parts()?;
        let frame = channels * STORED_BYTES_PER_SAMPLE;
        Some((FIFO_HIGH_WATER_BYTES / 2 / frame * frame) as u64)
    }

    /// Bytes produced by the front-end since the last start, before budget caps.
    fn produced_bytes(&self) -> Option<u64> {
        match self.pacing {
            Pacing::Unpaced => None,
            Pacing::Realtime => {
                let (_, rate, channels) = self.geometry_parts()?;
                let started = self.started_at?;
                let bytes_per_sec = (channels * STORED_BYTES_PER_SAMPLE) as u128 * rate.hz() as u128;
                Some((started.elapsed().as_micros() * bytes_per_sec / 1_000_000) as u64)
            }
        }
    }

    fn available_bytes(&self) -> u64 {
        if !self.streaming {
            return 0;
        }
        let mut limit = u64::MAX;
        if let Some(produced) = self.produced_bytes() {
            limit = limit.min(produced);
        }
        if let (Some(budget), Some(block)) = (self.block_budget, self.block_bytes()) {
            limit = limit.min(budget * block);
        }
        limit.saturating_sub(self.bytes_transferred)
    }

    fn refresh_overflow(&mut self) {
        if let Some(threshold) = self.overflow_after_bytes {
            if self.bytes_transferred >= threshold {
                self.overflow_latched = true;
            }
        }
        if self.streaming && self.pacing == Pacing::Realtime {
            if let Some(produced) = self.produced_bytes() {
                if produced.saturating_sub(self.bytes_transferred) > FIFO_CAPACITY_BYTES {
                    self.overflow_latched = true;
                }
            }
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        let (depth, _, channels) = self.geometry_parts().ok_or_else(|| {
            HydroError::Transport("FIFO read before front-end was configured".into())
        })?;
        let frame_bytes = (channels * STORED_BYTES_PER_SAMPLE) as u64;
        let mut start = 0;
        if self.junk_pending {
            let n = buf.len().min(COLD_START_JUNK.len());
            buf[..n].copy_from_slice(&COLD_START_JUNK[..n]);
            self.junk_pending = false;
            start = n;
        }
        for byte in buf[start..].iter_mut() {
            let offset = self.bytes_transferred;
            let frame = offset / frame_bytes;
            let within = offset % frame_bytes;
            let channel = (within / STORED_BYTES_PER_SAMPLE as u64) as usize;
            let word = pack_wire_sample(synthetic_sample(frame, channel, depth), depth);
            *byte = word[(within % STORED_BYTES_PER_SAMPLE as u64) as usize];
            self.bytes_transferred += 1;
        }
        Ok(())
    }
}

/// Simulated register service + FIFO transport.
#[derive(Debug, Clone)]
pub struct SimulatedHydrophone {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedHydrophone {
    /// A front-end whose FIFO always has data (subject to the block budget).
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(Pacing::Unpaced))),
        }
    }

    /// A front-end producing data at the configured sample rate; falling
    /// behind by more than the FIFO capacity latches the overflow line.
    pub fn realtime() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(Pacing::Realtime))),
        }
    }

    pub fn faults(&self) -> FaultInjector {
        FaultInjector {
            state: Arc::clone(&self.state),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().start_count
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().stop_count
    }

    pub fn reset_count(&self) -> usize {
        self.state.lock().reset_count
    }

    /// Sample bytes read since the last FIFO reset (junk excluded).
    pub fn bytes_transferred(&self) -> u64 {
        self.state.lock().bytes_transferred
    }

    pub fn register_write_count(&self, reg: Register) -> usize {
        self.state.lock().write_counts.get(&reg).copied().unwrap_or(0)
    }

    /// Depth, rate and channel count currently latched in the registers.
    pub fn configured_geometry_parts(&self) -> Option<(BitDepth, SampleRate, usize)> {
        self.state.lock().geometry_parts()
    }
}

impl Default for SimulatedHydrophone {
    fn default() -> Self {
        Self::new()
    }
}

impl HydrophoneHardware for SimulatedHydrophone {
    fn register_write(&mut self, reg: Register, value: u32) -> Result<()> {
        let mut s = self.state.lock();
        s.shadow.insert(reg, value);
        *s.write_counts.entry(reg).or_default() += 1;
        Ok(())
    }

    fn register_read(&mut self, reg: Register) -> Result<u32> {
        Ok(self
            .state
            .lock()
            .registers
            .get(&reg)
            .copied()
            .unwrap_or(POWER_ON_VALUE))
    }

    fn sync(&mut self) -> Result<()> {
        let mut s = self.state.lock();
        let pending: Vec<(Register, u32)> = s.shadow.drain().collect();
        for (reg, value) in pending {
            if s.rejected.contains(&reg) || s.rejected_once.remove(&reg) {
                continue;
            }
            s.registers.insert(reg, value);
        }
        Ok(())
    }

    fn fifo_start(&mut self) -> Result<()> {
        let mut s = self.state.lock();
        if s.geometry_parts().is_none() {
            return Err(HydroError::Transport(
                "fifo_start before front-end was configured".into(),
            ));
        }
        s.streaming = true;
        s.registers.insert(Register::FpgaFifoControl, FIFO_CONTROL_RUN);
        s.started_at = Some(Instant::now());
        s.junk_pending = true;
        s.start_count += 1;
        debug!("simulated FIFO started");
        Ok(())
    }

    fn fifo_stop(&mut self) -> Result<()> {
        let mut s = self.state.lock();
        s.streaming = false;
        s.registers.insert(Register::FpgaFifoControl, 0);
        s.stop_count += 1;
        debug!("simulated FIFO stopped");
        Ok(())
    }

    fn fifo_reset(&mut self) -> Result<()> {
        let mut s = self.state.lock();
        s.bytes_transferred = 0;
        s.overflow_latched = false;
        s.junk_pending = false;
        s.started_at = s.streaming.then(Instant::now);
        let run = if s.streaming { FIFO_CONTROL_RUN } else { 0 };
        s.registers.insert(Register::FpgaFifoControl, run | FIFO_CONTROL_RESET);
        s.reset_count += 1;
        debug!("simulated FIFO reset");
        Ok(())
    }

    fn transfer_block(&mut self, buf: &mut [u8]) -> Result<()> {
        let delay = self.state.lock().transfer_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        let mut s = self.state.lock();
        if let Some(limit) = s.fail_transfers_after {
            if s.transfers >= limit {
                return Err(HydroError::Transport(format!(
                    "injected transfer failure after {limit} transfers"
                )));
            }
        }
        s.transfers += 1;
        s.fill(buf)
    }

    fn data_ready(&mut self) -> Result<bool> {
        let s = self.state.lock();
        let Some(block) = s.block_bytes() else {
            return Ok(false);
        };
        Ok(s.available_bytes() >= block)
    }

    fn overflow_asserted(&mut self) -> Result<bool> {
        let mut s = self.state.lock();
        s.refresh_overflow();
        Ok(s.overflow_latched)
    }
}

/// Fault-injection handle sharing state with a `SimulatedHydrophone`.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    state: Arc<Mutex<SimState>>,
}

impl FaultInjector {
    /// Writes to `reg` never latch, so read-back always mismatches.
    pub fn reject_register(&self, reg: Register) {
        self.state.lock().rejected.insert(reg);
    }

    /// The next write to `reg` fails to latch; later writes succeed.
    pub fn reject_register_once(&self, reg: Register) {
        self.state.lock().rejected_once.insert(reg);
    }

    /// Every block transfer after the first `n` reports a transport error.
    pub fn fail_transfers_after(&self, n: u64) {
        self.state.lock().fail_transfers_after = Some(n);
    }

    /// Latch the overflow line once `bytes` sample bytes have been read.
    pub fn overflow_after_bytes(&self, bytes: u64) {
        self.state.lock().overflow_after_bytes = Some(bytes);
    }

    /// Latch the overflow line now.
    pub fn force_overflow(&self) {
        self.state.lock().overflow_latched = true;
    }

    /// Produce at most `blocks` blocks per stream start.
    pub fn limit_blocks(&self, blocks: u64) {
        self.state.lock().block_budget = Some(blocks);
    }

    /// Every block transfer takes at least `delay`.
    pub fn slow_transfers(&self, delay: Duration) {
        self.state.lock().transfer_delay = Some(delay);
    }

    pub fn clear(&self) {
        let mut s = self.state.lock();
        s.rejected.clear();
        s.rejected_once.clear();
        s.fail_transfers_after = None;
        s.overflow_after_bytes = None;
        s.block_budget = None;
        s.transfer_delay = None;
        s.overflow_latched = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{unpack_wire_sample, FilterType, RegisterProgram, SampleGeometry};

    fn configured(depth: u32, channels: u32) -> (SimulatedHydrophone, SampleGeometry) {
        let g = SampleGeometry::new(depth, 48_000, channels, FilterType::Wideband).unwrap();
        let mut hw = SimulatedHydrophone::new();
        RegisterProgram::for_geometry(&g).apply(&mut hw).unwrap();
        (hw, g)
    }

    #[test]
    fn writes_only_become_visible_after_sync() {
        let mut hw = SimulatedHydrophone::new();
        hw.register_write(Register::FpgaChannelCount, 4).unwrap();
        assert_eq!(
            hw.register_read(Register::FpgaChannelCount).unwrap(),
            POWER_ON_VALUE
        );
        hw.sync().unwrap();
        assert_eq!(hw.register_read(Register::FpgaChannelCount).unwrap(), 4);
    }

    #[test]
    fn fifo_commands_drive_the_control_register() {
        let (mut hw, _) = configured(16, 4);
        assert_eq!(
            hw.register_read(Register::FpgaFifoControl).unwrap(),
            POWER_ON_VALUE
        );
        hw.fifo_reset().unwrap();
        assert_eq!(
            hw.register_read(Register::FpgaFifoControl).unwrap(),
            FIFO_CONTROL_RESET
        );
        hw.fifo_start().unwrap();
        assert_eq!(
            hw.register_read(Register::FpgaFifoControl).unwrap(),
            FIFO_CONTROL_RUN
        );
        hw.fifo_reset().unwrap();
        assert_eq!(
            hw.register_read(Register::FpgaFifoControl).unwrap(),
            FIFO_CONTROL_RUN | FIFO_CONTROL_RESET
        );
        hw.fifo_stop().unwrap();
        assert_eq!(hw.register_read(Register::FpgaFifoControl).unwrap(), 0);
    }

    #[test]
    fn rejected_register_never_reads_back_a_zero_write() {
        let mut hw = SimulatedHydrophone::new();
        hw.faults().reject_register(Register::FpgaBitDepth);
        hw.register_write(Register::FpgaBitDepth, 0).unwrap();
        hw.sync().unwrap();
        assert_ne!(hw.register_read(Register::FpgaBitDepth).unwrap(), 0);
    }

    #[test]
    fn fifo_start_requires_configuration() {
        let mut hw = SimulatedHydrophone::new();
        assert!(matches!(hw.fifo_start(), Err(HydroError::Transport(_))));
    }

    #[test]
    fn first_word_after_start_is_junk_then_samples_follow() {
        let (mut hw, g) = configured(24, 3);
        hw.fifo_start().unwrap();

        let mut junk = [0u8; STORED_BYTES_PER_SAMPLE];
        hw.transfer_block(&mut junk).unwrap();
        assert_eq!(junk, COLD_START_JUNK);

        let mut block = vec![0u8; g.block_bytes()];
        hw.transfer_block(&mut block).unwrap();
        for (i, word) in block.chunks_exact(4).take(9).enumerate() {
            let word: [u8; 4] = word.try_into().unwrap();
            let expected = synthetic_sample((i / 3) as u64, i % 3, BitDepth::TwentyFour);
            assert_eq!(unpack_wire_sample(word, BitDepth::TwentyFour), expected);
            assert_eq!(word[3], 0, "padding byte must be zero");
        }
    }

    #[test]
    fn block_budget_limits_data_ready() {
        let (mut hw, g) = configured(16, 4);
        hw.faults().limit_blocks(2);
        hw.fifo_start().unwrap();
        let mut junk = [0u8; 4];
        hw.transfer_block(&mut junk).unwrap();

        let mut block = vec![0u8; g.block_bytes()];
        for _ in 0..2 {
            assert!(hw.data_ready().unwrap());
            hw.transfer_block(&mut block).unwrap();
        }
        assert!(!hw.data_ready().unwrap());
    }

    #[test]
    fn overflow_latches_after_byte_threshold_and_clears_on_reset() {
        let (mut hw, g) = configured(16, 4);
        hw.faults().overflow_after_bytes(g.block_bytes() as u64);
        hw.fifo_start().unwrap();

        let mut block = vec![0u8; g.block_bytes()];
        assert!(!hw.overflow_asserted().unwrap());
        hw.transfer_block(&mut block).unwrap(); // junk word + partial block
        hw.transfer_block(&mut block).unwrap();
        assert!(hw.overflow_asserted().unwrap());

        hw.fifo_reset().unwrap();
        assert!(!hw.overflow_asserted().unwrap());
        assert_eq!(hw.bytes_transferred(), 0);
    }

    #[test]
    fn injected_transport_failure() {
        let (mut hw, g) = configured(16, 3);
        hw.faults().fail_transfers_after(1);
        hw.fifo_start().unwrap();
        let mut block = vec![0u8; g.block_bytes()];
        hw.transfer_block(&mut block).unwrap();
        assert!(matches!(
            hw.transfer_block(&mut block),
            Err(HydroError::Transport(_))
        ));
    }

    #[test]
    fn synthetic_samples_stay_in_range() {
        for frame in [0u64, 1, 999, 1 << 40] {
            for ch in 0..4 {
                let s16 = synthetic_sample(frame, ch, BitDepth::Sixteen);
                assert!((i16::MIN as i32..=i16::MAX as i32).contains(&s16));
                let s24 = synthetic_sample(frame, ch, BitDepth::TwentyFour);
                assert!((-(1 << 23)..(1 << 23)).contains(&s24));
            }
        }
    }
}
