//! Wire framing shared by both ends of the hostlink bus.
//!
//! Every transfer carries one frame: a fixed 12-byte little-endian header
//! followed by the payload, padded to the bus DMA alignment. The header tags
//! the frame with its interface type, which decides the priority channel it
//! travels on, and carries an additive checksum over header and payload.
//!
//! A frame with a zero payload length is a dummy: it keeps the bus pumped
//! and is never delivered.

pub mod codec;
pub mod error;
pub mod event;
pub mod iface;

pub use codec::{
    align_up, checksum, decode_header, encode_dummy, encode_frame, peek_flags, Flags, Frame,
    FrameConfig, Header, Throttle, DEFAULT_BUFFER_SIZE, DEFAULT_DMA_ALIGNMENT, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use event::{FirmwareVersion, SlaveCapabilities, Tlv, TlvIter};
pub use iface::{InterfaceType, Priority};
