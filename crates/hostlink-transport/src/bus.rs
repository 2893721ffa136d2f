use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::pool::{Block, Pooled, WireBuffer};

/// Pairs one TX and one RX buffer for a single full-duplex exchange.
///
/// Descriptors come from their own [`Pool`](crate::Pool) so that arming a
/// transaction never touches the general-purpose heap.
#[derive(Debug, Default)]
pub struct TransactionDesc {
    tx: Option<WireBuffer>,
    rx: Option<WireBuffer>,
    length: usize,
    fault: Option<String>,
}

/// A descriptor checked out of the descriptor pool.
pub type Transaction = Pooled<TransactionDesc>;

impl Block for TransactionDesc {
    fn clear(&mut self) {
        self.tx = None;
        self.rx = None;
        self.length = 0;
        self.fault = None;
    }

    fn recycle(&mut self) {
        self.clear();
    }
}

impl TransactionDesc {
    /// Attach the buffers for the next exchange. `length` is in bytes.
    pub fn bind(&mut self, tx: WireBuffer, rx: WireBuffer, length: usize) {
        self.tx = Some(tx);
        self.rx = Some(rx);
        self.length = length;
        self.fault = None;
    }

    /// Number of bytes clocked in each direction.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Outgoing bytes, if a TX buffer is attached.
    pub fn tx(&self) -> Option<&[u8]> {
        self.tx.as_deref().map(|buf| &buf[..])
    }

    /// Incoming bytes, if an RX buffer is attached.
    pub fn rx(&self) -> Option<&[u8]> {
        self.rx.as_deref().map(|buf| &buf[..])
    }

    /// Mutable access to the RX buffer for the driver to fill.
    pub fn rx_mut(&mut self) -> Option<&mut [u8]> {
        self.rx.as_deref_mut().map(|buf| &mut buf[..])
    }

    /// Detach the TX buffer.
    pub fn take_tx(&mut self) -> Option<WireBuffer> {
        self.tx.take()
    }

    /// Detach the RX buffer.
    pub fn take_rx(&mut self) -> Option<WireBuffer> {
        self.rx.take()
    }

    /// Mark the exchange as failed at the driver level.
    pub fn set_fault(&mut self, reason: impl Into<String>) {
        self.fault = Some(reason.into());
    }

    /// Driver-level failure recorded for this exchange.
    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }
}

/// Notifications raised by a bus driver from its completion context.
///
/// Implementations must be short and must not block: they run with
/// interrupt-like latency constraints.
pub trait BusEvents: Send + Sync {
    /// A transaction is loaded and the peripheral can accept a transfer.
    fn transaction_ready(&self);

    /// The host finished clocking the loaded transaction.
    fn transaction_done(&self);
}

/// Slave-side SPI driver boundary.
pub trait SlaveBus: Send + Sync {
    /// Install the completion-context callbacks.
    fn set_events(&self, events: Arc<dyn BusEvents>);

    /// Queue a transaction for the host to clock.
    fn queue_transaction(&self, transaction: Transaction) -> Result<()>;

    /// Wait up to `timeout` for the next completed transaction.
    fn transaction_result(&self, timeout: Duration) -> Result<Transaction>;

    /// Pull back every transaction the host has not clocked yet.
    fn cancel_pending(&self) -> Vec<Transaction>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferPool, Pool};

    #[test]
    fn bind_and_teardown_releases_buffers_individually() {
        let buffers = BufferPool::with_block_size("wire", 2, 8).unwrap();
        let descs = Pool::new("trans", 1, TransactionDesc::default).unwrap();

        let mut trans = descs.acquire(true).unwrap();
        trans.bind(
            buffers.acquire(true).unwrap(),
            buffers.acquire(true).unwrap(),
            8,
        );
        assert_eq!(buffers.in_use(), 2);
        assert_eq!(trans.length(), 8);
        assert_eq!(trans.tx().map(<[u8]>::len), Some(8));

        let rx = trans.take_rx().unwrap();
        drop(trans);
        assert_eq!(descs.in_use(), 0);
        assert_eq!(buffers.in_use(), 1);
        drop(rx);
        assert_eq!(buffers.in_use(), 0);
    }

    #[test]
    fn dropping_a_bound_descriptor_returns_its_buffers() {
        let buffers = BufferPool::with_block_size("wire", 2, 8).unwrap();
        let descs = Pool::new("trans", 1, TransactionDesc::default).unwrap();

        let mut trans = descs.acquire(false).unwrap();
        trans.bind(
            buffers.acquire(false).unwrap(),
            buffers.acquire(false).unwrap(),
            8,
        );
        trans.set_fault("aborted");
        drop(trans);

        assert_eq!(buffers.in_use(), 0);
        let reused = descs.acquire(false).unwrap();
        assert!(reused.tx().is_none());
        assert!(reused.fault().is_none());
    }

    #[test]
    fn clear_resets_fault() {
        let mut desc = TransactionDesc::default();
        desc.set_fault("crc");
        assert_eq!(desc.fault(), Some("crc"));
        desc.clear();
        assert!(desc.fault().is_none());
    }
}
