use std::time::Duration;

use hostlink_frame::Priority;

/// Errors that can occur in SPI transport operations.
#[derive(Debug, thiserror::Error)]
pub enum SpiError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] hostlink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] hostlink_frame::FrameError),

    /// The priority queue for this frame is full.
    #[error("{priority} queue full")]
    QueueFull { priority: Priority },

    /// The transport is draining or torn down.
    #[error("transport inactive")]
    Inactive,

    /// The transport was already started.
    #[error("transport already started")]
    AlreadyStarted,

    /// Pools or queues could not be created.
    #[error("out of memory at init: {0}")]
    OutOfMemoryAtInit(String),

    /// Configuration rejected by validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Blocking operation timed out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Frames must carry at least one payload byte.
    #[error("empty payload")]
    EmptyPayload,

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SpiError>;
