//! Lowest layer of hostlink: memory and hardware boundaries.
//!
//! - [`pool`]: fixed-block allocators for wire buffers and transaction
//!   descriptors, safe to call from completion context
//! - [`bus`]: the SPI slave driver boundary (queue a transaction, collect
//!   its result, completion notifications)
//! - [`gpio`]: output lines and edge interrupts used for the handshake
//! - [`sim`]: an in-memory peripheral and host controller for tests
//!
//! Everything else in hostlink builds on the [`Pool`], [`SlaveBus`] and
//! [`Gpio`] types provided here.

pub mod bus;
pub mod error;
pub mod gpio;
pub mod pool;

#[cfg(feature = "sim")]
pub mod sim;

pub use bus::{BusEvents, SlaveBus, Transaction, TransactionDesc};
pub use error::{Result, TransportError};
pub use gpio::{Edge, EdgeHandler, Gpio, Level, Line};
pub use pool::{Block, BufferPool, Pool, Pooled, WireBuffer};

#[cfg(feature = "sim")]
pub use sim::{SimBus, SimGpio, SimHost};
