//! Transport layer: the operations a device exposes to its users.

pub mod firmware;
pub mod mock;
pub mod spi;

pub use firmware::{FirmwareFlasher, FirmwareImage, ImageLibrary, NoFirmware, UpdateOutcome};
pub use mock::MockTransport;
pub use spi::SpiTransport;

use crate::error::Result;
use crate::hsspi::Received;
use crate::protocol::{DeviceInfo, FwVersion, MessageType};

/// Send/receive orchestration over one physical link.
///
/// This trait enables:
/// - The HSSPI implementation driving a real or simulated bus
/// - Mock implementation for testing the device and bypass layers
pub trait Transport: Send + Sync {
    /// Take a power reference.
    fn start(&self) -> Result<()>;

    /// Release a power reference.
    fn stop(&self) -> Result<()>;

    /// Hard reset; `bootrom` keeps the device in its boot ROM.
    fn reset(&self, bootrom: bool) -> Result<()>;

    /// Start if `on` and not started, stop if off and started.
    fn power(&self, on: bool) -> Result<()>;

    fn fw_update(
        &self,
        current: Option<FwVersion>,
        device_id: u16,
        name: Option<&str>,
    ) -> Result<UpdateOutcome>;

    /// Write one frame, retrying transient failures.
    ///
    /// No ownership check is done here; see `Device::send`.
    fn send(&self, ty: MessageType, data: &[u8]) -> Result<()>;

    /// Read one frame into `buf`.
    fn recv(&self, buf: &mut [u8]) -> Result<Received>;

    /// Wait for the firmware and read its device information.
    fn probe(&self) -> Result<DeviceInfo>;
}
