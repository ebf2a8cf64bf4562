//! uwblink-core: host side of the HSSPI link to a UWB co-processor.
//!
//! This crate moves typed frames (bootloader, application, core dump, log,
//! trace) between host consumers and a peripheral reachable over SPI, with
//! all bus traffic serialized through one worker thread per device.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Link header, flag bits, message types, UCI packets
//! - **Bus**: Platform bus/GPIO contracts (mock, simulated peripheral)
//! - **HSSPI**: Framing engine (ready wait, pre-read/read, wake-up)
//! - **Worker**: Single thread running interrupts and submitted work
//! - **Transport**: Send/receive orchestration, reset, probing, firmware update
//! - **Dispatch**: Per (type, priority) handler table
//! - **Bypass**: Exclusive pass-through channel
//! - **Device/Notifier**: Registration flow and lifecycle events
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use uwblink_core::{Device, DeviceCore, LinkConfig, NoFirmware, Notifier, SimPeripheral, SpiTransport};
//!
//! let sim = SimPeripheral::new();
//! let config = LinkConfig::default();
//! let core = Arc::new(DeviceCore::new());
//! let transport = SpiTransport::new(
//!     Arc::new(sim.clone()),
//!     Arc::new(sim.clone()),
//!     config.clone(),
//!     core.clone(),
//!     Arc::new(NoFirmware),
//! )
//! .expect("worker thread");
//! sim.attach_irq(transport.irq_handler());
//!
//! let device = Device::new(0, transport, core, config);
//! device.register(&Notifier::new()).expect("registration failed");
//! ```

pub mod bus;
pub mod bypass;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod hsspi;
pub mod notifier;
pub mod power;
pub mod probe;
pub mod protocol;
pub mod state;
pub mod transport;
pub mod worker;

// Re-exports for convenience
pub use bus::{Bus, BusError, Gpio, GpioLines, MockBus, MockGpio, SimPeripheral};
pub use bypass::{Bypass, Listener, OwnerId};
pub use config::LinkConfig;
pub use device::{Device, DeviceCore};
pub use dispatch::{FrameHandler, HandlerTable};
pub use error::{LinkError, Result};
pub use hsspi::{Hsspi, Received};
pub use notifier::{DeviceEvent, DeviceListener, Notifier, TracingListener};
pub use protocol::{DeviceInfo, Frame, FwVersion, LinkHeader, MessageType, Priority};
pub use state::DeviceState;
pub use transport::{
    FirmwareFlasher, FirmwareImage, ImageLibrary, MockTransport, NoFirmware, SpiTransport,
    Transport, UpdateOutcome,
};
pub use worker::{CancelToken, Worker, WorkerOptions};
