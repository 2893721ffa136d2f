//! Private events sent by the transport itself.
//!
//! An event payload is `event_type (1B) | event_len (1B) | TLVs`, where each
//! TLV is `tag (1B) | len (1B) | value`. The only event emitted today is
//! INIT, which advertises the slave's capabilities once at startup.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::Frame;
use crate::error::{FrameError, Result};
use crate::iface::InterfaceType;

/// `pkt_type` of a private frame carrying an event.
pub const PACKET_TYPE_EVENT: u8 = 0x33;

/// Event type of the startup capability event.
pub const EVENT_INIT: u8 = 0x22;

/// TLV tags of the INIT event.
pub mod tag {
    pub const CAPABILITY: u8 = 0x11;
    pub const CHIP_ID: u8 = 0x12;
    pub const RAW_TP_TEST: u8 = 0x13;
    pub const RX_QUEUE_SIZE: u8 = 0x14;
    pub const TX_QUEUE_SIZE: u8 = 0x15;
    pub const CAPABILITY_EXT: u8 = 0x16;
    pub const FIRMWARE_VERSION: u8 = 0x17;
}

/// Capability bits of the [`tag::CAPABILITY`] TLV.
pub mod cap {
    pub const WLAN_SDIO: u8 = 0x01;
    pub const BT_UART: u8 = 0x02;
    pub const BT_SDIO: u8 = 0x04;
    pub const BLE_ONLY: u8 = 0x08;
    pub const BR_EDR_ONLY: u8 = 0x10;
    pub const WLAN_SPI: u8 = 0x20;
    pub const BT_SPI: u8 = 0x40;
    pub const CHECKSUM_ENABLED: u8 = 0x80;
}

/// Firmware version, packed on the wire as `major << 16 | minor << 8 | patch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    pub fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn packed(self) -> u32 {
        (u32::from(self.major) << 16) | (u32::from(self.minor) << 8) | u32::from(self.patch)
    }

    pub fn from_packed(packed: u32) -> Self {
        Self {
            major: (packed >> 16) as u8,
            minor: (packed >> 8) as u8,
            patch: packed as u8,
        }
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// What the slave tells the host at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlaveCapabilities {
    pub chip_id: u8,
    /// Bitwise OR of [`cap`] bits.
    pub capabilities: u8,
    /// Extended capability word, sent only when present.
    pub extended_capabilities: Option<u32>,
    pub raw_tp_test: u8,
    pub rx_queue_size: u8,
    pub tx_queue_size: u8,
    pub firmware_version: FirmwareVersion,
}

impl SlaveCapabilities {
    /// Encode as an INIT event payload.
    pub fn to_event_payload(&self) -> Bytes {
        let mut tlvs = BytesMut::with_capacity(32);
        put_tlv(&mut tlvs, tag::CHIP_ID, &[self.chip_id]);
        put_tlv(&mut tlvs, tag::CAPABILITY, &[self.capabilities]);
        put_tlv(&mut tlvs, tag::RAW_TP_TEST, &[self.raw_tp_test]);
        put_tlv(&mut tlvs, tag::RX_QUEUE_SIZE, &[self.rx_queue_size]);
        put_tlv(&mut tlvs, tag::TX_QUEUE_SIZE, &[self.tx_queue_size]);
        if let Some(ext) = self.extended_capabilities {
            put_tlv(&mut tlvs, tag::CAPABILITY_EXT, &ext.to_le_bytes());
        }
        put_tlv(
            &mut tlvs,
            tag::FIRMWARE_VERSION,
            &self.firmware_version.packed().to_le_bytes(),
        );

        let mut payload = BytesMut::with_capacity(2 + tlvs.len());
        payload.put_u8(EVENT_INIT);
        payload.put_u8(tlvs.len() as u8);
        payload.put_slice(&tlvs);
        payload.freeze()
    }

    /// The private frame carrying the INIT event.
    pub fn to_frame(&self) -> Frame {
        Frame::new(InterfaceType::Private, self.to_event_payload()).with_pkt_type(PACKET_TYPE_EVENT)
    }

    /// Parse an INIT event payload. Unknown tags are skipped.
    pub fn from_event_payload(payload: &[u8]) -> Result<Self> {
        let [event_type, event_len, rest @ ..] = payload else {
            return Err(FrameError::Tlv("event header truncated".into()));
        };
        if *event_type != EVENT_INIT {
            return Err(FrameError::Tlv(format!(
                "expected INIT event {EVENT_INIT:#04x}, got {event_type:#04x}"
            )));
        }
        let data = rest.get(..usize::from(*event_len)).ok_or_else(|| {
            FrameError::Tlv(format!(
                "event_len {event_len} exceeds {} payload bytes",
                rest.len()
            ))
        })?;

        let mut caps = SlaveCapabilities {
            chip_id: 0,
            capabilities: 0,
            extended_capabilities: None,
            raw_tp_test: 0,
            rx_queue_size: 0,
            tx_queue_size: 0,
            firmware_version: FirmwareVersion::default(),
        };
        for tlv in TlvIter::new(data) {
            let tlv = tlv?;
            match tlv.tag {
                tag::CHIP_ID => caps.chip_id = tlv.byte()?,
                tag::CAPABILITY => caps.capabilities = tlv.byte()?,
                tag::RAW_TP_TEST => caps.raw_tp_test = tlv.byte()?,
                tag::RX_QUEUE_SIZE => caps.rx_queue_size = tlv.byte()?,
                tag::TX_QUEUE_SIZE => caps.tx_queue_size = tlv.byte()?,
                tag::CAPABILITY_EXT => caps.extended_capabilities = Some(tlv.word()?),
                tag::FIRMWARE_VERSION => {
                    caps.firmware_version = FirmwareVersion::from_packed(tlv.word()?)
                }
                other => tracing::debug!(tag = other, "skipping unknown TLV"),
            }
        }
        Ok(caps)
    }

    pub fn has(&self, bit: u8) -> bool {
        self.capabilities & bit == bit
    }
}

fn put_tlv(dst: &mut BytesMut, tag: u8, value: &[u8]) {
    dst.put_u8(tag);
    dst.put_u8(value.len() as u8);
    dst.put_slice(value);
}

/// One tag-length-value entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub value: &'a [u8],
}

impl Tlv<'_> {
    fn byte(&self) -> Result<u8> {
        match self.value {
            [b] => Ok(*b),
            _ => Err(self.bad_len(1)),
        }
    }

    fn word(&self) -> Result<u32> {
        let bytes: [u8; 4] = self.value.try_into().map_err(|_| self.bad_len(4))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn bad_len(&self, want: usize) -> FrameError {
        FrameError::Tlv(format!(
            "tag {:#04x}: expected {want} bytes, got {}",
            self.tag,
            self.value.len()
        ))
    }
}

/// Iterator over a TLV list. Yields an error once, then stops, on truncation.
pub struct TlvIter<'a> {
    data: &'a [u8],
}

impl<'a> TlvIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<Tlv<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.data;
        match data {
            [] => None,
            [tag, len, rest @ ..] if rest.len() >= usize::from(*len) => {
                let (value, tail) = rest.split_at(usize::from(*len));
                self.data = tail;
                Some(Ok(Tlv { tag: *tag, value }))
            }
            _ => {
                self.data = &[];
                Some(Err(FrameError::Tlv(format!(
                    "truncated TLV ({} trailing bytes)",
                    data.len()
                ))))
            }
        }
    }
}
