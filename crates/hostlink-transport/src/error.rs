use std::time::Duration;

/// Errors that can occur at the pool, bus or GPIO boundary.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Every block of the pool is currently handed out.
    #[error("{pool} pool exhausted")]
    PoolExhausted { pool: &'static str },

    /// Backing storage for a pool could not be reserved.
    #[error("failed to allocate {blocks} blocks for {pool} pool")]
    AllocationFailed { pool: &'static str, blocks: usize },

    /// No transaction is loaded, or the driver queue has no room.
    #[error("bus not ready for a transfer")]
    BusNotReady,

    /// The driver reported a failed exchange.
    #[error("bus transaction failed: {0}")]
    BusTransactionFailed(String),

    /// A bounded wait expired.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The bus has been shut down.
    #[error("transport shut down")]
    Shutdown,

    /// Invalid sizing or line configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
