//! Error taxonomy shared by every layer of the link.

use thiserror::Error;

use crate::bus::BusError;
use crate::protocol::HeaderError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LinkError>;

#[derive(Error, Debug)]
pub enum LinkError {
    /// Device asleep or transiently unavailable (flags read back as 0x00/0xFF).
    #[error("Device busy")]
    Busy,

    /// Ready signal never came, or the device refused the exchange.
    #[error("Device not ready")]
    NotReady,

    #[error("Protocol mismatch: pre-read announced {announced} bytes, read returned {actual}")]
    ProtocolMismatch { announced: usize, actual: usize },

    #[error("No handler for message type {0}")]
    Unsupported(u8),

    #[error("Operation not permitted for this owner")]
    PermissionDenied,

    #[error("Channel already open")]
    AlreadyOpen,

    #[error("Channel not opened")]
    NotOpened,

    #[error("Handler slot already occupied")]
    AlreadyExists,

    #[error("Handler not found")]
    NotFound,

    #[error("Interrupted while waiting")]
    Cancelled,

    #[error("Message too large: {len} bytes, capacity {capacity}")]
    MessageTooLarge { len: usize, capacity: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("No data available")]
    NoData,

    #[error("Timed out")]
    Timeout,

    #[error("Device answered with status 0x{0:02X}")]
    Uci(u8),

    #[error("Worker thread stopped")]
    WorkerStopped,

    #[error("Header error: {0}")]
    Header(#[from] HeaderError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

impl LinkError {
    /// Errors the orchestrator recovers from locally with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::Busy | LinkError::NotReady | LinkError::ProtocolMismatch { .. }
        )
    }
}
