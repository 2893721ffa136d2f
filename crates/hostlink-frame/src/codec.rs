use std::ops::{BitOr, BitOrAssign, Range};

use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};
use crate::iface::InterfaceType;

/// Fixed header size on the wire.
pub const HEADER_SIZE: usize = 12;

/// Default size of one bus buffer, header included.
pub const DEFAULT_BUFFER_SIZE: usize = 1600;

/// Default DMA length alignment in bytes.
pub const DEFAULT_DMA_ALIGNMENT: usize = 4;

/// Interface number stamped on dummy frames.
pub const DUMMY_IF_NUM: u8 = 0x0F;

const CHECKSUM_AT: Range<usize> = 6..8;

/// Header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Flags(u8);

impl Flags {
    /// More fragments of the same packet follow.
    pub const MORE_FRAGMENT: Flags = Flags(0x01);
    /// The frame woke the host.
    pub const WAKEUP: Flags = Flags(0x02);
    /// The host entered power save.
    pub const POWER_SAVE_STARTED: Flags = Flags(0x04);
    /// The host left power save.
    pub const POWER_SAVE_STOPPED: Flags = Flags(0x08);

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.insert(rhs);
    }
}

/// Flow-control command carried in the low two bits of header byte 10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Throttle {
    /// Host may send freely.
    #[default]
    Off,
    /// Host should hold back bulk traffic.
    On,
}

impl Throttle {
    pub fn from_bits(bits: u8) -> Self {
        if bits & 0x03 == 1 {
            Throttle::On
        } else {
            Throttle::Off
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Throttle::Off => 0,
            Throttle::On => 1,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub if_type: InterfaceType,
    /// Interface instance, 4 bits.
    pub if_num: u8,
    pub flags: Flags,
    /// Payload length. Zero marks a dummy frame.
    pub len: u16,
    /// Byte offset of the payload from the start of the frame.
    pub offset: u16,
    pub checksum: u16,
    pub seq_num: u16,
    pub throttle: Throttle,
    pub pkt_type: u8,
}

impl Header {
    pub fn new(if_type: InterfaceType, if_num: u8) -> Self {
        Self {
            if_type,
            if_num,
            flags: Flags::empty(),
            len: 0,
            offset: HEADER_SIZE as u16,
            checksum: 0,
            seq_num: 0,
            throttle: Throttle::Off,
            pkt_type: 0,
        }
    }

    /// Header of a keep-alive frame with no payload.
    pub fn dummy(throttle: Throttle) -> Self {
        Self {
            if_num: DUMMY_IF_NUM,
            offset: 0,
            throttle,
            ..Self::new(InterfaceType::Max, 0)
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.len == 0
    }

    /// Where the payload sits inside the frame.
    pub fn payload_range(&self) -> Range<usize> {
        let start = usize::from(self.offset);
        start..start + usize::from(self.len)
    }

    /// Serialize into the first [`HEADER_SIZE`] bytes of `dst`.
    ///
    /// Wire format (little-endian):
    /// ```text
    /// ┌────────────────┬───────┬─────────┬──────────┬──────────┬─────────┬──────────┬──────────┐
    /// │ if_type|if_num │ flags │ len     │ offset   │ checksum │ seq_num │ throttle │ pkt_type │
    /// │ (1B, 4b|4b)    │ (1B)  │ (2B LE) │ (2B LE)  │ (2B LE)  │ (2B LE) │ (1B)     │ (1B)     │
    /// └────────────────┴───────┴─────────┴──────────┴──────────┴─────────┴──────────┴──────────┘
    /// ```
    pub fn write_to(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < HEADER_SIZE {
            return Err(FrameError::BufferTooSmall { size: dst.len() });
        }
        let mut out = &mut dst[..HEADER_SIZE];
        out.put_u8((self.if_type.raw() & 0x0F) | ((self.if_num & 0x0F) << 4));
        out.put_u8(self.flags.bits());
        out.put_u16_le(self.len);
        out.put_u16_le(self.offset);
        out.put_u16_le(self.checksum);
        out.put_u16_le(self.seq_num);
        out.put_u8(self.throttle.bits());
        out.put_u8(self.pkt_type);
        Ok(())
    }

    /// Parse the header at the start of `src`. Does not validate lengths.
    pub fn parse(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(FrameError::BufferTooSmall { size: src.len() });
        }
        let mut src = &src[..HEADER_SIZE];
        let first = src.get_u8();
        Ok(Self {
            if_type: InterfaceType::from_raw(first & 0x0F)?,
            if_num: first >> 4,
            flags: Flags::from_bits(src.get_u8()),
            len: src.get_u16_le(),
            offset: src.get_u16_le(),
            checksum: src.get_u16_le(),
            seq_num: src.get_u16_le(),
            throttle: Throttle::from_bits(src.get_u8()),
            pkt_type: src.get_u8(),
        })
    }
}

/// Wrapping 16-bit sum of every byte.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// Checksum of an encoded frame, with its checksum field counted as zero.
fn frame_checksum(frame: &[u8]) -> u16 {
    frame[CHECKSUM_AT]
        .iter()
        .fold(checksum(frame), |acc, &b| acc.wrapping_sub(u16::from(b)))
}

/// Round `len` up to a multiple of `align`.
pub fn align_up(len: usize, align: usize) -> usize {
    if align <= 1 {
        len
    } else {
        len.div_ceil(align) * align
    }
}

/// Configuration for the frame codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Bytes per bus buffer, header included. Default: 1600.
    pub buffer_size: usize,
    /// Transfer lengths are padded to this many bytes. Default: 4.
    pub dma_alignment: usize,
    /// Compute checksums on TX and verify them on RX. Default: on.
    pub checksum: bool,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            dma_alignment: DEFAULT_DMA_ALIGNMENT,
            checksum: true,
        }
    }
}

impl FrameConfig {
    /// Largest payload a single frame can carry.
    pub fn max_payload(&self) -> usize {
        self.buffer_size.saturating_sub(HEADER_SIZE)
    }

    /// Size of one pool block: the buffer size rounded to the DMA alignment.
    pub fn block_size(&self) -> usize {
        align_up(self.buffer_size, self.dma_alignment)
    }

    /// Check the settings describe a usable buffer.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.dma_alignment.is_power_of_two() {
            return Err(format!(
                "dma_alignment must be a power of two (got {})",
                self.dma_alignment
            ));
        }
        if self.buffer_size <= HEADER_SIZE {
            return Err(format!(
                "buffer_size must exceed the {HEADER_SIZE}-byte header (got {})",
                self.buffer_size
            ));
        }
        if self.buffer_size > usize::from(u16::MAX) {
            return Err(format!(
                "buffer_size must fit the 16-bit length field (got {})",
                self.buffer_size
            ));
        }
        Ok(())
    }
}

/// Encode one frame into `dst`.
///
/// `header` supplies the routing fields; length, offset and checksum are
/// filled in here. The frame is zero-padded up to the DMA alignment and the
/// padded length is returned.
pub fn encode_frame(
    header: &Header,
    payload: &[u8],
    dst: &mut [u8],
    config: &FrameConfig,
) -> Result<usize> {
    if payload.is_empty() {
        return Err(FrameError::EmptyPayload);
    }
    if !header.if_type.carries_data() {
        return Err(FrameError::UnknownInterface(header.if_type.raw()));
    }

    let total = HEADER_SIZE + payload.len();
    if total > config.buffer_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload(),
        });
    }
    let padded = align_up(total, config.dma_alignment);
    if dst.len() < padded {
        return Err(FrameError::BufferTooSmall { size: dst.len() });
    }

    let header = Header {
        len: payload.len() as u16,
        offset: HEADER_SIZE as u16,
        checksum: 0,
        ..*header
    };
    header.write_to(dst)?;
    dst[HEADER_SIZE..total].copy_from_slice(payload);
    dst[total..padded].fill(0);

    if config.checksum {
        let sum = checksum(&dst[..total]);
        dst[CHECKSUM_AT].copy_from_slice(&sum.to_le_bytes());
    }
    Ok(padded)
}

/// Write a dummy header into `dst`.
pub fn encode_dummy(dst: &mut [u8], throttle: Throttle) -> Result<()> {
    Header::dummy(throttle).write_to(dst)
}

/// Flags byte of a received buffer, read before any validation.
pub fn peek_flags(src: &[u8]) -> Flags {
    src.get(1).copied().map(Flags::from_bits).unwrap_or_default()
}

/// Validate a received buffer and return its header.
///
/// Checks run in wire order: a zero length marks a dummy, then the
/// length/offset pair must fit the buffer, then the interface must carry
/// data, then the checksum must match when enabled.
pub fn decode_header(src: &[u8], config: &FrameConfig) -> Result<Header> {
    if src.len() < HEADER_SIZE {
        return Err(FrameError::BufferTooSmall { size: src.len() });
    }
    if u16::from_le_bytes([src[2], src[3]]) == 0 {
        return Err(FrameError::DummyFrame);
    }

    let header = Header::parse(src)?;
    let capacity = src.len().min(config.buffer_size);
    let range = header.payload_range();
    if range.start < HEADER_SIZE || range.end > capacity {
        return Err(FrameError::Malformed {
            len: range.len(),
            offset: range.start,
            capacity,
        });
    }
    if !header.if_type.carries_data() {
        return Err(FrameError::UnknownInterface(header.if_type.raw()));
    }

    if config.checksum {
        let computed = frame_checksum(&src[..range.end]);
        if computed != header.checksum {
            return Err(FrameError::ChecksumMismatch {
                expected: header.checksum,
                computed,
            });
        }
    }
    Ok(header)
}

/// A frame with an owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub if_type: InterfaceType,
    pub if_num: u8,
    pub flags: Flags,
    pub seq_num: u16,
    pub throttle: Throttle,
    pub pkt_type: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(if_type: InterfaceType, payload: impl Into<Bytes>) -> Self {
        Self {
            if_type,
            if_num: 0,
            flags: Flags::empty(),
            seq_num: 0,
            throttle: Throttle::Off,
            pkt_type: 0,
            payload: payload.into(),
        }
    }

    pub fn with_if_num(mut self, if_num: u8) -> Self {
        self.if_num = if_num;
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_pkt_type(mut self, pkt_type: u8) -> Self {
        self.pkt_type = pkt_type;
        self
    }

    pub fn with_seq_num(mut self, seq_num: u16) -> Self {
        self.seq_num = seq_num;
        self
    }

    /// Routing fields as a header template.
    pub fn header(&self) -> Header {
        Header {
            flags: self.flags,
            seq_num: self.seq_num,
            throttle: self.throttle,
            pkt_type: self.pkt_type,
            ..Header::new(self.if_type, self.if_num)
        }
    }

    /// Padded wire size of this frame.
    pub fn wire_size(&self, config: &FrameConfig) -> usize {
        align_up(HEADER_SIZE + self.payload.len(), config.dma_alignment)
    }

    pub fn encode(&self, dst: &mut [u8], config: &FrameConfig) -> Result<usize> {
        encode_frame(&self.header(), &self.payload, dst, config)
    }

    pub fn decode(src: &[u8], config: &FrameConfig) -> Result<Self> {
        let header = decode_header(src, config)?;
        Ok(Self {
            if_type: header.if_type,
            if_num: header.if_num,
            flags: header.flags,
            seq_num: header.seq_num,
            throttle: header.throttle,
            pkt_type: header.pkt_type,
            payload: Bytes::copy_from_slice(&src[header.payload_range()]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> Vec<u8> {
        vec![0u8; DEFAULT_BUFFER_SIZE]
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let config = FrameConfig::default();
        let mut buf = buffer();
        let frame = Frame::new(InterfaceType::Station, &b"hello, hostlink!"[..])
            .with_if_num(2)
            .with_seq_num(41)
            .with_flags(Flags::MORE_FRAGMENT);

        let written = frame.encode(&mut buf, &config).unwrap();
        assert_eq!(written, frame.wire_size(&config));
        assert_eq!(written % DEFAULT_DMA_ALIGNMENT, 0);

        let decoded = Frame::decode(&buf, &config).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_header_layout() {
        let config = FrameConfig::default();
        let mut buf = buffer();
        let mut header = Header::new(InterfaceType::Serial, 1);
        header.flags = Flags::WAKEUP;
        header.seq_num = 0x0203;
        header.throttle = Throttle::On;
        header.pkt_type = 0x33;

        encode_frame(&header, &[1, 2, 3], &mut buf, &config).unwrap();

        assert_eq!(buf[0], 0x13);
        assert_eq!(buf[1], 0x02);
        assert_eq!(&buf[2..4], &[3, 0]);
        assert_eq!(&buf[4..6], &[12, 0]);
        assert_eq!(&buf[8..10], &[0x03, 0x02]);
        assert_eq!(buf[10], 1);
        assert_eq!(buf[11], 0x33);
        assert_eq!(&buf[12..15], &[1, 2, 3]);
    }

    #[test]
    fn test_checksum_value() {
        let config = FrameConfig::default();
        let mut buf = buffer();
        encode_frame(
            &Header::new(InterfaceType::Serial, 0),
            &[1, 2, 3],
            &mut buf,
            &config,
        )
        .unwrap();
        // header bytes 3 + 3 + 12, payload bytes 1 + 2 + 3
        assert_eq!(&buf[6..8], &[24, 0]);
    }

    #[test]
    fn test_padding_is_zeroed() {
        let config = FrameConfig::default();
        let mut buf = vec![0xAAu8; 32];
        let written = encode_frame(
            &Header::new(InterfaceType::Hci, 0),
            &[9; 5],
            &mut buf,
            &config,
        )
        .unwrap();
        assert_eq!(written, 20);
        assert_eq!(&buf[17..20], &[0, 0, 0]);
        assert_eq!(buf[20], 0xAA);
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let config = FrameConfig::default();
        let mut buf = buffer();
        Frame::new(InterfaceType::Station, vec![5u8; 64])
            .encode(&mut buf, &config)
            .unwrap();
        buf[HEADER_SIZE + 10] ^= 0x40;

        let result = decode_header(&buf, &config);
        assert!(matches!(result, Err(FrameError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_checksum_disabled_skips_verification() {
        let config = FrameConfig {
            checksum: false,
            ..FrameConfig::default()
        };
        let mut buf = buffer();
        Frame::new(InterfaceType::Station, vec![5u8; 8])
            .encode(&mut buf, &config)
            .unwrap();
        assert_eq!(&buf[6..8], &[0, 0]);
        buf[HEADER_SIZE] = 0;

        assert!(decode_header(&buf, &config).is_ok());
    }

    #[test]
    fn test_dummy_is_rejected() {
        let config = FrameConfig::default();
        let mut buf = buffer();
        encode_dummy(&mut buf, Throttle::On).unwrap();
        assert_eq!(buf[0], 0xF8);
        assert_eq!(buf[10], 1);
        assert!(matches!(
            decode_header(&buf, &config),
            Err(FrameError::DummyFrame)
        ));

        // An all-zero buffer from an idle host is also a dummy.
        assert!(matches!(
            decode_header(&buffer(), &config),
            Err(FrameError::DummyFrame)
        ));
    }

    #[test]
    fn test_length_past_buffer_is_malformed() {
        let config = FrameConfig::default();
        let mut buf = buffer();
        let mut header = Header::new(InterfaceType::Station, 0);
        header.len = 1590;
        header.write_to(&mut buf).unwrap();

        assert!(matches!(
            decode_header(&buf, &config),
            Err(FrameError::Malformed { .. })
        ));
    }

    #[test]
    fn test_offset_inside_header_is_malformed() {
        let config = FrameConfig::default();
        let mut buf = buffer();
        let mut header = Header::new(InterfaceType::Station, 0);
        header.len = 4;
        header.offset = 4;
        header.write_to(&mut buf).unwrap();

        assert!(matches!(
            decode_header(&buf, &config),
            Err(FrameError::Malformed { offset: 4, .. })
        ));
    }

    #[test]
    fn test_unknown_interface_is_rejected() {
        let config = FrameConfig::default();
        let mut buf = buffer();
        Frame::new(InterfaceType::Station, &b"x"[..])
            .encode(&mut buf, &config)
            .unwrap();
        buf[0] = 0x0B;
        assert!(matches!(
            decode_header(&buf, &config),
            Err(FrameError::UnknownInterface(11))
        ));
    }

    #[test]
    fn test_payload_too_large() {
        let config = FrameConfig::default();
        let mut buf = buffer();
        let result = encode_frame(
            &Header::new(InterfaceType::Station, 0),
            &vec![0u8; config.max_payload() + 1],
            &mut buf,
            &config,
        );
        assert!(matches!(
            result,
            Err(FrameError::PayloadTooLarge { size: 1589, max: 1588 })
        ));

        let fits = encode_frame(
            &Header::new(InterfaceType::Station, 0),
            &vec![0u8; config.max_payload()],
            &mut buf,
            &config,
        );
        assert_eq!(fits.unwrap(), DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_empty_payload() {
        let mut buf = buffer();
        let result = encode_frame(
            &Header::new(InterfaceType::Station, 0),
            &[],
            &mut buf,
            &FrameConfig::default(),
        );
        assert!(matches!(result, Err(FrameError::EmptyPayload)));
    }

    #[test]
    fn test_peek_flags_ignores_validity() {
        let mut buf = buffer();
        buf[1] = Flags::POWER_SAVE_STARTED.bits();
        assert!(peek_flags(&buf).contains(Flags::POWER_SAVE_STARTED));
        assert_eq!(peek_flags(&[]), Flags::empty());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(13, 4), 16);
        assert_eq!(align_up(16, 4), 16);
        assert_eq!(align_up(13, 1), 13);
        assert_eq!(align_up(1600, 64), 1600);
        assert_eq!(align_up(1601, 64), 1664);
    }

    #[test]
    fn test_config_validation() {
        assert!(FrameConfig::default().validate().is_ok());
        let bad_align = FrameConfig {
            dma_alignment: 3,
            ..FrameConfig::default()
        };
        assert!(bad_align.validate().is_err());
        let tiny = FrameConfig {
            buffer_size: HEADER_SIZE,
            ..FrameConfig::default()
        };
        assert!(tiny.validate().is_err());
    }

    #[test]
    fn test_config_from_json_defaults() {
        let config: FrameConfig = serde_json::from_str(r#"{"checksum": false}"#).unwrap();
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(!config.checksum);
    }
}
