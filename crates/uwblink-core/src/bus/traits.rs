//! Bus and GPIO abstractions.
//!
//! Defines the platform contracts consumed by the framing engine,
//! allowing different implementations (spidev, simulated device, mock).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("GPIO access failed: {0}")]
    Gpio(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Synchronous full-duplex exchange primitive.
///
/// Implementations must:
/// - clock out `tx` while filling `rx` (both have the same length)
/// - treat an empty exchange as a chip-select pulse with no data
/// - be callable from the worker thread only; no internal queuing is needed
pub trait Bus: Send + Sync {
    /// Exchange `tx.len()` bytes in both directions.
    fn exchange(&self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError>;

    /// Drive chip-select independently of any transfer.
    ///
    /// Used to hold the line low across a reset into the boot ROM.
    fn set_chip_select(&self, _active: bool) -> Result<(), BusError> {
        Ok(())
    }
}

/// Optional lines wired on a given board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpioLines {
    /// Ready line (high when the device accepts a transaction).
    pub ready: bool,
    /// Dedicated wake line.
    pub wakeup: bool,
    /// Low-power indicator (EXTON), high while the device is awake.
    pub exton: bool,
}

/// GPIO-level signalling towards the device.
pub trait Gpio: Send + Sync {
    /// Which optional lines are present.
    fn lines(&self) -> GpioLines;

    /// Level of the ready line.
    fn read_ready(&self) -> Result<bool, BusError>;

    /// Drive the wake line.
    fn set_wake(&self, level: bool) -> Result<(), BusError>;

    /// Drive the reset line (true holds the device in reset).
    fn set_reset(&self, level: bool) -> Result<(), BusError>;

    /// Level of the low-power indicator; true while the device is awake.
    fn read_low_power(&self) -> Result<bool, BusError>;

    /// Switch the supply regulators, when the board has any.
    fn set_supply(&self, _on: bool) -> Result<(), BusError> {
        Ok(())
    }
}
