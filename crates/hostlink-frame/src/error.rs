/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The buffer cannot even hold a header.
    #[error("buffer too small for a frame header ({size} bytes)")]
    BufferTooSmall { size: usize },

    /// The frame does not fit in one bus buffer.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Real frames must carry at least one payload byte.
    #[error("empty payload")]
    EmptyPayload,

    /// Zero-length keep-alive frame; never delivered.
    #[error("dummy frame")]
    DummyFrame,

    /// Recomputed checksum differs from the header.
    #[error("checksum mismatch (header {expected:#06x}, computed {computed:#06x})")]
    ChecksumMismatch { expected: u16, computed: u16 },

    /// Length and offset do not describe a frame inside the buffer.
    #[error("malformed frame (len {len}, offset {offset}, capacity {capacity})")]
    Malformed {
        len: usize,
        offset: usize,
        capacity: usize,
    },

    /// The interface type nibble does not name a known interface.
    #[error("unknown interface type {0}")]
    UnknownInterface(u8),

    /// A private-event TLV list could not be parsed.
    #[error("bad event payload: {0}")]
    Tlv(String),
}

pub type Result<T> = std::result::Result<T, FrameError>;
