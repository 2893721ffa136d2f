//! Interface types and their priority channels.
//!
//! The low nibble of header byte 0 names the interface a frame belongs to.
//! Each interface maps to exactly one of three priority channels; the
//! mapping is fixed and identical in both directions.

use std::fmt;

use serde::Serialize;

use crate::error::{FrameError, Result};

/// Interface a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum InterfaceType {
    /// Reserved. Never valid on the wire.
    Invalid = 0,
    Station = 1,
    AccessPoint = 2,
    /// Control-plane RPC to the coprocessor.
    Serial = 3,
    /// Bluetooth HCI.
    Hci = 4,
    /// Events generated by the transport itself.
    Private = 5,
    /// Throughput test traffic.
    Test = 6,
    Ethernet = 7,
    /// Keep-alive filler. Only ever seen on dummy frames.
    Max = 8,
}

impl InterfaceType {
    /// Every interface that can carry a real frame.
    pub const DATA: [InterfaceType; 7] = [
        InterfaceType::Station,
        InterfaceType::AccessPoint,
        InterfaceType::Serial,
        InterfaceType::Hci,
        InterfaceType::Private,
        InterfaceType::Test,
        InterfaceType::Ethernet,
    ];

    /// Parse the 4-bit wire value.
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(InterfaceType::Invalid),
            1 => Ok(InterfaceType::Station),
            2 => Ok(InterfaceType::AccessPoint),
            3 => Ok(InterfaceType::Serial),
            4 => Ok(InterfaceType::Hci),
            5 => Ok(InterfaceType::Private),
            6 => Ok(InterfaceType::Test),
            7 => Ok(InterfaceType::Ethernet),
            8 => Ok(InterfaceType::Max),
            other => Err(FrameError::UnknownInterface(other)),
        }
    }

    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Priority channel this interface travels on.
    ///
    /// Serial and private traffic is control, HCI is voice, and everything
    /// else is bulk.
    pub fn priority(self) -> Priority {
        match self {
            InterfaceType::Serial | InterfaceType::Private => Priority::Control,
            InterfaceType::Hci => Priority::Voice,
            _ => Priority::Bulk,
        }
    }

    /// Whether real frames may carry this interface.
    pub fn carries_data(self) -> bool {
        !matches!(self, InterfaceType::Invalid | InterfaceType::Max)
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            InterfaceType::Invalid => "INVALID",
            InterfaceType::Station => "STA",
            InterfaceType::AccessPoint => "AP",
            InterfaceType::Serial => "SERIAL",
            InterfaceType::Hci => "HCI",
            InterfaceType::Private => "PRIV",
            InterfaceType::Test => "TEST",
            InterfaceType::Ethernet => "ETH",
            InterfaceType::Max => "DUMMY",
        }
    }

    /// Parse a name as printed by [`InterfaceType::name`], case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        InterfaceType::DATA
            .into_iter()
            .chain([InterfaceType::Invalid, InterfaceType::Max])
            .find(|ty| ty.name() == upper)
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One of the three priority channels, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Control = 0,
    Voice = 1,
    Bulk = 2,
}

impl Priority {
    /// Channels in service order.
    pub const ALL: [Priority; 3] = [Priority::Control, Priority::Voice, Priority::Bulk];

    /// Array index for per-channel tables.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Priority::Control => "control",
            Priority::Voice => "voice",
            Priority::Bulk => "bulk",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_mapping() {
        assert_eq!(InterfaceType::Serial.priority(), Priority::Control);
        assert_eq!(InterfaceType::Private.priority(), Priority::Control);
        assert_eq!(InterfaceType::Hci.priority(), Priority::Voice);
        for ty in [
            InterfaceType::Station,
            InterfaceType::AccessPoint,
            InterfaceType::Test,
            InterfaceType::Ethernet,
        ] {
            assert_eq!(ty.priority(), Priority::Bulk, "{ty}");
        }
    }

    #[test]
    fn raw_values_roundtrip() {
        for raw in 0..=8 {
            assert_eq!(InterfaceType::from_raw(raw).unwrap().raw(), raw);
        }
        assert!(matches!(
            InterfaceType::from_raw(9),
            Err(FrameError::UnknownInterface(9))
        ));
    }

    #[test]
    fn names_parse_back() {
        assert_eq!(InterfaceType::from_name("hci"), Some(InterfaceType::Hci));
        assert_eq!(InterfaceType::from_name("STA"), Some(InterfaceType::Station));
        assert_eq!(InterfaceType::from_name("bogus"), None);
    }

    #[test]
    fn only_data_interfaces_carry_frames() {
        assert!(!InterfaceType::Invalid.carries_data());
        assert!(!InterfaceType::Max.carries_data());
        assert!(InterfaceType::DATA.iter().all(|ty| ty.carries_data()));
    }

    #[test]
    fn priorities_order_highest_first() {
        assert!(Priority::Control < Priority::Voice);
        assert!(Priority::Voice < Priority::Bulk);
        assert_eq!(Priority::ALL.map(Priority::index), [0, 1, 2]);
    }
}
