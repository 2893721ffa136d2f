//! Slave side of the hostlink SPI transport.
//!
//! [`SpiTransport`] multiplexes three priority channels onto one full-duplex
//! bus. It keeps a transaction armed at all times, coordinates with the host
//! over the Handshake and DataReady lines, and tells the host to back off
//! through the throttle field when bulk RX fills up.

pub mod config;
pub mod error;
pub mod flow;
pub mod mux;
mod pump;
pub mod signal;
pub mod startup;
pub mod stats;
pub mod transport;

pub use config::{
    CapabilityConfig, DeassertPolicy, LineConfig, Polarity, QueueDepths, SpiConfig,
    DEFAULT_FIRMWARE_VERSION,
};
pub use error::{Result, SpiError};
pub use flow::FlowControl;
pub use mux::{Multiplexer, PriorityQueues, RxFrame};
pub use signal::{SignalState, Signals};
pub use stats::{Drops, PerPriority, StatsSnapshot};
pub use transport::{LinkState, PowerSaveEvent, PowerSaveHandler, SpiTransport};
