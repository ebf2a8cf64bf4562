//! Protocol module - HSSPI link-layer and UCI definitions.

pub mod constants;
pub mod header;
pub mod message;
pub mod uci;

pub use constants::*;
pub use header::{HeaderError, LinkHeader};
pub use message::{Frame, MessageType, Priority};
pub use uci::{DeviceInfo, FwVersion};
