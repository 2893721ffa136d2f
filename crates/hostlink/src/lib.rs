//! Slave-side SPI transport for host/coprocessor links.
//!
//! hostlink carries several logical streams (station data, Bluetooth HCI,
//! a serial control channel and transport events) over one full-duplex SPI
//! bus, with strict priority between them and in-band flow control.
//!
//! # Crate Structure
//!
//! - [`transport`]: Buffer pools, bus and GPIO boundaries, simulated bus
//! - [`frame`]: Wire header, checksum and capability events
//! - [`spi`]: The transaction pump (behind `spi` feature)

/// Re-export transport types.
pub mod transport {
    pub use hostlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use hostlink_frame::*;
}

/// Re-export SPI pump types (requires `spi` feature).
#[cfg(feature = "spi")]
pub mod spi {
    pub use hostlink_spi::*;
}
