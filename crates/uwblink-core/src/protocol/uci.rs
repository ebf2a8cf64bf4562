//! Minimal UCI framing used while probing the device.
//!
//! Only the core group commands needed to reset the firmware and read its
//! identity are covered; everything else is opaque payload for consumers.

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::Cursor;

pub const UCI_PACKET_HEADER_SIZE: usize = 4;

pub const UCI_MT_COMMAND: u16 = 1;
pub const UCI_MT_RESPONSE: u16 = 2;
pub const UCI_MT_NOTIFICATION: u16 = 3;

pub const UCI_GID_CORE: u16 = 0;

pub const UCI_OID_CORE_DEVICE_RESET: u16 = 0;
pub const UCI_OID_CORE_DEVICE_STATUS: u16 = 1;
pub const UCI_OID_CORE_GET_DEVICE_INFO: u16 = 2;

pub const UCI_STATUS_OK: u8 = 0x00;
pub const UCI_STATUS_REJECTED: u8 = 0x01;
pub const UCI_STATUS_SYNTAX_ERROR: u8 = 0x03;
pub const UCI_STATUS_MESSAGE_RETRY: u8 = 0x0A;

pub const UCI_DEVICE_STATE_READY: u8 = 0x01;
pub const UCI_DEVICE_STATE_ACTIVE: u8 = 0x02;
pub const UCI_DEVICE_STATE_ERROR: u8 = 0xFF;

/// Packs message type, group and opcode into the first two header bytes.
pub const fn mt_gid_oid(mt: u16, gid: u16, oid: u16) -> u16 {
    mt << 13 | gid << 8 | oid
}

pub const DEVICE_RESET_RSP: u16 =
    mt_gid_oid(UCI_MT_RESPONSE, UCI_GID_CORE, UCI_OID_CORE_DEVICE_RESET);
pub const GET_DEVICE_INFO_RSP: u16 =
    mt_gid_oid(UCI_MT_RESPONSE, UCI_GID_CORE, UCI_OID_CORE_GET_DEVICE_INFO);
pub const DEVICE_STATUS_NTF: u16 =
    mt_gid_oid(UCI_MT_NOTIFICATION, UCI_GID_CORE, UCI_OID_CORE_DEVICE_STATUS);

fn packet(id: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(UCI_PACKET_HEADER_SIZE + payload.len());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(0);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out
}

/// CORE_DEVICE_RESET command (reset config 0).
pub fn device_reset_cmd() -> Vec<u8> {
    packet(
        mt_gid_oid(UCI_MT_COMMAND, UCI_GID_CORE, UCI_OID_CORE_DEVICE_RESET),
        &[0],
    )
}

/// CORE_GET_DEVICE_INFO command (no payload).
pub fn device_info_cmd() -> Vec<u8> {
    packet(
        mt_gid_oid(UCI_MT_COMMAND, UCI_GID_CORE, UCI_OID_CORE_GET_DEVICE_INFO),
        &[],
    )
}

/// Builds a response or notification packet, as the firmware would.
pub fn build_packet(id: u16, payload: &[u8]) -> Vec<u8> {
    packet(id, payload)
}

/// One UCI packet found inside a transport frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UciPacket<'a> {
    pub id: u16,
    pub payload: &'a [u8],
}

/// Splits a frame into complete UCI packets.
///
/// Returns the packets and the number of trailing bytes that did not form a
/// complete packet.
pub fn split_packets(mut data: &[u8]) -> (Vec<UciPacket<'_>>, usize) {
    let mut packets = Vec::new();
    while data.len() >= UCI_PACKET_HEADER_SIZE {
        let payload_len = data[3] as usize;
        if data.len() < UCI_PACKET_HEADER_SIZE + payload_len {
            break;
        }
        let id = BigEndian::read_u16(&data[..2]);
        let end = UCI_PACKET_HEADER_SIZE + payload_len;
        packets.push(UciPacket {
            id,
            payload: &data[UCI_PACKET_HEADER_SIZE..end],
        });
        data = &data[end..];
    }
    (packets, data.len())
}

/// Running firmware version as reported in the vendor data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FwVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub rc: u8,
    pub build_id: u64,
    pub oem_major: u8,
    pub oem_minor: u8,
    pub oem_patch: u8,
}

impl FwVersion {
    /// Compares everything but the OEM triplet.
    pub fn differs(&self, other: &FwVersion) -> bool {
        self.major != other.major
            || self.minor != other.minor
            || self.patch != other.patch
            || self.rc != other.rc
            || self.build_id != other.build_id
    }
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.rc != 0 || self.build_id != 0 {
            write!(f, "rc{}_{}", self.rc, self.build_id)?;
        }
        if self.oem_major != 0 || self.oem_minor != 0 || self.oem_patch != 0 {
            write!(
                f,
                " (OEM version: {}.{}.{})",
                self.oem_major, self.oem_minor, self.oem_patch
            )?;
        }
        Ok(())
    }
}

/// Payload of a successful CORE_GET_DEVICE_INFO response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub uci_version: u16,
    pub mac_version: u16,
    pub phy_version: u16,
    pub uci_test_version: u16,
    pub vendor_data: Vec<u8>,
}

impl DeviceInfo {
    /// Fixed part: four versions and the vendor length byte.
    pub const FIXED_SIZE: usize = 9;
    /// Vendor data layout of the production firmware.
    pub const VENDOR_FULL_SIZE: usize = 52;
    /// Vendor data layout of the reduced firmware.
    pub const VENDOR_SHORT_SIZE: usize = 12;

    /// Parses the response payload without its leading status byte.
    ///
    /// Vendor data shorter than announced is kept truncated. Returns `None`
    /// when the fixed part is missing.
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < Self::FIXED_SIZE {
            return None;
        }
        let mut cursor = Cursor::new(body);
        let uci_version = cursor.read_u16::<LittleEndian>().ok()?;
        let mac_version = cursor.read_u16::<LittleEndian>().ok()?;
        let phy_version = cursor.read_u16::<LittleEndian>().ok()?;
        let uci_test_version = cursor.read_u16::<LittleEndian>().ok()?;
        let vendor_length = cursor.read_u8().ok()? as usize;
        let rest = &body[Self::FIXED_SIZE..];
        let vendor_data = rest[..vendor_length.min(rest.len())].to_vec();
        Some(Self {
            uci_version,
            mac_version,
            phy_version,
            uci_test_version,
            vendor_data,
        })
    }

    /// Serializes back into a response body, status byte excluded.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_SIZE + self.vendor_data.len());
        for v in [
            self.uci_version,
            self.mac_version,
            self.phy_version,
            self.uci_test_version,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.push(self.vendor_data.len() as u8);
        out.extend_from_slice(&self.vendor_data);
        out
    }

    /// Decodes the running firmware version and the device id.
    pub fn firmware(&self) -> Option<(FwVersion, u16)> {
        let vd = &self.vendor_data;
        if vd.len() >= Self::VENDOR_FULL_SIZE {
            let version = FwVersion {
                major: vd[0],
                minor: vd[1],
                patch: vd[2],
                rc: vd[3],
                build_id: LittleEndian::read_u64(&vd[4..12]),
                oem_major: vd[12],
                oem_minor: vd[13],
                oem_patch: vd[14],
            };
            Some((version, LittleEndian::read_u16(&vd[47..49])))
        } else if vd.len() >= Self::VENDOR_SHORT_SIZE {
            let version = FwVersion {
                major: vd[10],
                minor: vd[9],
                patch: vd[8],
                ..Default::default()
            };
            Some((version, LittleEndian::read_u16(&vd[0..2])))
        } else {
            None
        }
    }
}

/// Splits a packed UCI version into its major.minor.patch triplet.
pub fn version_triplet(v: u16) -> (u16, u16, u16) {
    (v >> 8, (v >> 4) & 0xF, v & 0xF)
}
