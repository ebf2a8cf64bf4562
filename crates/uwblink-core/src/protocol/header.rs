//! HSSPI link header.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Link header (4 bytes) sent in front of every exchange.
///
/// The host fills `flags` with `HOST_FLAG_*` bits and the device answers in
/// the same exchange with `SOC_FLAG_*` bits. `ty` is the message type of the
/// frame carried by the data phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkHeader {
    pub flags: u8,
    pub ty: u8,
    pub length: u16,
}

impl LinkHeader {
    pub const SIZE: usize = 4;

    pub fn new(flags: u8, ty: u8, length: u16) -> Self {
        Self { flags, ty, length }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = Vec::with_capacity(Self::SIZE);
        // Writes into a Vec cannot fail.
        let _ = buf.write_u8(self.flags);
        let _ = buf.write_u8(self.ty);
        let _ = buf.write_u16::<LittleEndian>(self.length);
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, HeaderError> {
        if data.len() < Self::SIZE {
            return Err(HeaderError::BufferTooSmall {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            flags: cursor.read_u8()?,
            ty: cursor.read_u8()?,
            length: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// True when the device did not drive the bus (asleep or held in reset).
    pub fn is_asleep(&self) -> bool {
        SOC_FLAGS_ASLEEP.contains(&self.flags)
    }

    /// Device reports a frame waiting with a non-zero length.
    pub fn announces_data(&self) -> bool {
        self.has(SOC_FLAG_ODW) && self.length != 0
    }

    /// Firmware is ready, as opposed to the boot ROM answering in its place.
    pub fn firmware_ready(&self) -> bool {
        self.has(SOC_FLAG_RDY) && !self.has(SOC_FLAG_BOOTROM_RDY)
    }
}
