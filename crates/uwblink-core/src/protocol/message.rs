//! Message types, priorities and the received frame.

use std::fmt;

use crate::error::LinkError;

/// Logical channel carried in the `ty` byte of the link header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Reserved = 0,
    Bootloader = 1,
    Application = 2,
    CoreDump = 3,
    Log = 4,
    Trace = 5,
}

impl MessageType {
    pub const COUNT: usize = 6;

    pub const ALL: [MessageType; Self::COUNT] = [
        MessageType::Reserved,
        MessageType::Bootloader,
        MessageType::Application,
        MessageType::CoreDump,
        MessageType::Log,
        MessageType::Trace,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for MessageType {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(LinkError::Unsupported(value))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Reserved => write!(f, "reserved"),
            MessageType::Bootloader => write!(f, "bootloader"),
            MessageType::Application => write!(f, "application"),
            MessageType::CoreDump => write!(f, "coredump"),
            MessageType::Log => write!(f, "log"),
            MessageType::Trace => write!(f, "trace"),
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.to_string().eq_ignore_ascii_case(s))
            .ok_or(LinkError::InvalidArgument("unknown message type"))
    }
}

/// Handler priority. High shadows Normal for the same message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High = 0,
    Normal = 1,
}

impl Priority {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// An inbound frame handed over to exactly one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ty: MessageType,
    /// Device flags seen in the header of the read exchange.
    pub flags: u8,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(ty: MessageType, flags: u8, data: Vec<u8>) -> Self {
        Self { ty, flags, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_from_wire() {
        assert_eq!(MessageType::try_from(2).unwrap(), MessageType::Application);
        assert_eq!(MessageType::try_from(5).unwrap(), MessageType::Trace);
        assert!(matches!(
            MessageType::try_from(6),
            Err(LinkError::Unsupported(6))
        ));
    }

    #[test]
    fn test_message_type_parse_name() {
        assert_eq!("Log".parse::<MessageType>().unwrap(), MessageType::Log);
        assert_eq!(
            "application".parse::<MessageType>().unwrap(),
            MessageType::Application
        );
        assert!("uci2".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_indices_are_dense() {
        for (i, ty) in MessageType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i);
        }
        assert_eq!(Priority::High.index(), 0);
        assert_eq!(Priority::Normal.index(), 1);
    }
}
