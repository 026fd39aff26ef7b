//! Hardware register service and FIFO transport abstraction.
//!
//! The `HydrophoneHardware` trait is the only way the pipeline touches the
//! ADC and the FPGA FIFO controller. The bit-level register protocol lives
//! behind it; the core never drives bus pins itself.
//!
//! `&mut self` everywhere: a register transaction is a multi-step exchange
//! on a shared bus, so all access is serialised through the owning engine.

pub mod simulated;

pub use simulated::{FaultInjector, SimulatedHydrophone};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Named control registers on the ADC and the FPGA FIFO controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Register {
    /// ADC power mode (bits 5:4) and master-clock divider code (bits 1:0).
    AdcPowerClock,
    /// ADC filter select (bit 3) and decimation code (bits 2:0).
    AdcChannelMode,
    /// FPGA FIFO sample width: 0 = 16-bit, 1 = 24-bit.
    FpgaBitDepth,
    /// FPGA FIFO interleave width (number of channels).
    FpgaChannelCount,
    /// FPGA FIFO control: bit 0 = run, bit 1 = reset since last start.
    FpgaFifoControl,
}

impl Register {
    /// Bus address of the register.
    pub const fn addr(self) -> u8 {
        match self {
            Register::AdcPowerClock => 0x04,
            Register::AdcChannelMode => 0x05,
            Register::FpgaBitDepth => 0x40,
            Register::FpgaChannelCount => 0x41,
            Register::FpgaFifoControl => 0x42,
        }
    }
}

/// Contract for the register service plus FIFO transport.
pub trait HydrophoneHardware: Send + 'static {
    /// Write `value` to `reg`.
    fn register_write(&mut self, reg: Register, value: u32) -> Result<()>;

    /// Read the current value of `reg`.
    fn register_read(&mut self, reg: Register) -> Result<u32>;

    /// Latch pending register writes into the devices.
    fn sync(&mut self) -> Result<()>;

    /// Start streaming samples into the FIFO.
    fn fifo_start(&mut self) -> Result<()>;

    /// Stop streaming. Data already in the FIFO stays readable until reset.
    fn fifo_stop(&mut self) -> Result<()>;

    /// Discard FIFO contents and clear the overflow latch.
    fn fifo_reset(&mut self) -> Result<()>;

    /// Read exactly `buf.len()` bytes from the FIFO.
    fn transfer_block(&mut self, buf: &mut [u8]) -> Result<()>;

    /// `true` once at least one block worth of data sits in the FIFO.
    fn data_ready(&mut self) -> Result<bool>;

    /// State of the FIFO overflow line.
    fn overflow_asserted(&mut self) -> Result<bool>;
}

impl<H: HydrophoneHardware + ?Sized> HydrophoneHardware for Box<H> {
    fn register_write(&mut self, reg: Register, value: u32) -> Result<()> {
        (**self).register_write(reg, value)
    }

    fn register_read(&mut self, reg: Register) -> Result<u32> {
        (**self).register_read(reg)
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }

    fn fifo_start(&mut self) -> Result<()> {
        (**self).fifo_start()
    }

    fn fifo_stop(&mut self) -> Result<()> {
        (**self).fifo_stop()
    }

    fn fifo_reset(&mut self) -> Result<()> {
        (**self).fifo_reset()
    }

    fn transfer_block(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).transfer_block(buf)
    }

    fn data_ready(&mut self) -> Result<bool> {
        (**self).data_ready()
    }

    fn overflow_asserted(&mut self) -> Result<bool> {
        (**self).overflow_asserted()
    }
}
