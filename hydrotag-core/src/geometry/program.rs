//! ADC / FPGA register program for each supported geometry.
//!
//! Output data rate is exact integer arithmetic on the ADC master clock:
//!
//! ```text
//! rate = ADC_MCLK_HZ / mclk_divider / decimation
//! ```
//!
//! | rate    | divider | decimation | power  |
//! |---------|--------:|-----------:|--------|
//! | 750 Hz  | 32      | 1024       | eco    |
//! | 48 kHz  | 4       | 128        | median |
//! | 96 kHz  | 2       | 128        | fast   |
//! | 192 kHz | 1       | 128        | fast   |

use tracing::{debug, warn};

use super::{BitDepth, FilterType, SampleGeometry, SampleRate};
use crate::error::{HydroError, Result};
use crate::hardware::{HydrophoneHardware, Register};

/// ADC master clock.
pub const ADC_MCLK_HZ: u32 = 24_576_000;

/// Writes per register before the geometry is declared rejected.
pub const MAX_REGISTER_ATTEMPTS: u32 = 3;

/// ADC power mode field (bits 5:4 of `AdcPowerClock`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Eco,
    Median,
    Fast,
}

impl PowerMode {
    const fn bits(self) -> u32 {
        match self {
            PowerMode::Eco => 0b00,
            PowerMode::Median => 0b10,
            PowerMode::Fast => 0b11,
        }
    }
}

/// Decimation / clock-divider / power-mode triple for one rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcTiming {
    pub mclk_divider: u32,
    pub decimation: u32,
    pub power_mode: PowerMode,
}

impl AdcTiming {
    pub const fn for_rate(rate: SampleRate) -> Self {
        match rate {
            SampleRate::Default => AdcTiming {
                mclk_divider: 32,
                decimation: 1024,
                power_mode: PowerMode::Eco,
            },
            SampleRate::Hz48k => AdcTiming {
                mclk_divider: 4,
                decimation: 128,
                power_mode: PowerMode::Median,
            },
            SampleRate::Hz96k => AdcTiming {
                mclk_divider: 2,
                decimation: 128,
                power_mode: PowerMode::Fast,
            },
            SampleRate::Hz192k => AdcTiming {
                mclk_divider: 1,
                decimation: 128,
                power_mode: PowerMode::Fast,
            },
        }
    }

    pub const fn output_rate_hz(&self) -> u32 {
        ADC_MCLK_HZ / self.mclk_divider / self.decimation
    }

    const fn divider_code(&self) -> u32 {
        match self.mclk_divider {
            32 => 0b00,
            4 => 0b01,
            2 => 0b10,
            _ => 0b11,
        }
    }

    const fn decimation_code(&self) -> u32 {
        match self.decimation {
            32 => 0,
            64 => 1,
            128 => 2,
            256 => 3,
            512 => 4,
            _ => 5,
        }
    }
}

const fn filter_bit(filter: FilterType) -> u32 {
    match filter {
        FilterType::Wideband => 0,
        FilterType::Sinc5 => 1 << 3,
    }
}

const fn fifo_depth_code(depth: BitDepth) -> u32 {
    match depth {
        BitDepth::Sixteen => 0,
        BitDepth::TwentyFour => 1,
    }
}

/// Recover the configured rate from the two ADC register values.
pub fn rate_from_registers(power_clock: u32, channel_mode: u32) -> Option<SampleRate> {
    SampleRate::ALL.into_iter().find(|rate| {
        let t = AdcTiming::for_rate(*rate);
        power_clock == power_clock_value(&t) && channel_mode & 0b111 == t.decimation_code()
    })
}

/// Recover the configured depth from the FPGA FIFO width register.
pub fn depth_from_register(value: u32) -> Option<BitDepth> {
    match value {
        0 => Some(BitDepth::Sixteen),
        1 => Some(BitDepth::TwentyFour),
        _ => None,
    }
}

fn power_clock_value(t: &AdcTiming) -> u32 {
    (t.power_mode.bits() << 4) | t.divider_code()
}

/// Ordered register writes that put the front-end into one geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterProgram {
    pub timing: AdcTiming,
    pub writes: Vec<(Register, u32)>,
}

impl RegisterProgram {
    pub fn for_geometry(geometry: &SampleGeometry) -> Self {
        let timing = AdcTiming::for_rate(geometry.sample_rate);
        let writes = vec![
            (Register::AdcPowerClock, power_clock_value(&timing)),
            (
                Register::AdcChannelMode,
                filter_bit(geometry.filter_type) | timing.decimation_code(),
            ),
            (Register::FpgaBitDepth, fifo_depth_code(geometry.bit_depth)),
            (Register::FpgaChannelCount, geometry.channel_count() as u32),
        ];
        Self { timing, writes }
    }

    /// Write every register, verifying each by read-back.
    ///
    /// # Errors
    /// - `HydroError::GeometryRejected` when a register still reads back wrong
    ///   after `MAX_REGISTER_ATTEMPTS` writes.
    /// - Transport errors from the register service propagate unchanged.
    pub fn apply<H: HydrophoneHardware + ?Sized>(&self, hw: &mut H) -> Result<()> {
        for &(register, value) in &self.writes {
            write_verified(hw, register, value)?;
        }
        debug!(
            rate_hz = self.timing.output_rate_hz(),
            registers = self.writes.len(),
            "register program applied"
        );
        Ok(())
    }
}

fn write_verified<H: HydrophoneHardware + ?Sized>(
    hw: &mut H,
    register: Register,
    value: u32,
) -> Result<()> {
    let mut read = 0;
    for attempt in 1..=MAX_REGISTER_ATTEMPTS {
        hw.register_write(register, value)?;
        hw.sync()?;
        read = hw.register_read(register)?;
        if read == value {
            return Ok(());
        }
        warn!(
            ?register,
            addr = register.addr(),
            wrote = value,
            read,
            attempt,
            "register read-back mismatch"
        );
    }
    Err(HydroError::GeometryRejected {
        register,
        wrote: value,
        read,
        attempts: MAX_REGISTER_ATTEMPTS,
    })
}
