//! The transaction pump.
//!
//! One transaction is armed on the bus at all times while the transport is
//! active. When the host clocks it, the worker arms the next one first and
//! only then processes what came back. Outgoing data is taken from the TX
//! queues in priority order; with nothing queued a dummy frame is sent and
//! DataReady drops.
//!
//! Arming takes the RX buffer and the descriptor before popping a TX frame,
//! so a pool shortage never strands a real frame. A failed arm is retried on
//! the next poll tick.

use std::sync::atomic::Ordering;
use std::time::Instant;

use hostlink_frame::{decode_header, encode_dummy, peek_flags, Flags, FrameError, Header};
use hostlink_transport::{Transaction, TransportError, WireBuffer};
use tracing::{debug, error, info, trace, warn};

use crate::config::DeassertPolicy;
use crate::error::{Result, SpiError};
use crate::mux::RxFrame;
use crate::stats::DropReason;
use crate::transport::{Inner, PowerSaveEvent};

impl Inner {
    /// Worker loop. Returns once draining completes or the bus closes.
    pub(crate) fn run(&self) {
        info!("pump worker started");
        let poll = self.config.poll_interval();
        loop {
            if self.is_draining() && self.drain_complete() {
                break;
            }
            match self.bus.transaction_result(poll) {
                Ok(trans) => self.on_complete(trans),
                Err(TransportError::Timeout(_)) => {
                    if !self.is_draining() && self.rearm_pending.swap(false, Ordering::AcqRel) {
                        debug!("retrying arm");
                        self.arm_next();
                    }
                }
                Err(TransportError::Shutdown) => break,
                Err(err) => warn!(error = %err, "waiting for transaction result failed"),
            }
        }
        info!("pump worker stopped");
    }

    fn drain_complete(&self) -> bool {
        if self.in_flight.load(Ordering::Acquire) == 0 {
            return true;
        }
        self.drain_deadline
            .lock()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Arm the startup event as the first transaction.
    pub(crate) fn arm_startup(&self) -> Result<()> {
        let Some(frame) = self.startup.take_frame(self.next_seq()) else {
            return Ok(());
        };
        let mut buf = self.buffers.acquire(true)?;
        frame.encode(&mut buf, &self.config.frame)?;
        self.try_arm(Some(buf))?;
        self.signals.set_data_ready(true);
        info!(
            chip_id = self.startup.capabilities().chip_id,
            capabilities = self.startup.capabilities().capabilities,
            firmware = %self.startup.capabilities().firmware_version,
            "startup event armed"
        );
        Ok(())
    }

    fn on_complete(&self, trans: Transaction) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        if self.config.deassert_policy == DeassertPolicy::OnChipSelect {
            self.await_chip_select_release();
        }
        if !self.is_draining() {
            self.arm_next();
        }
        self.finish(trans);
    }

    fn await_chip_select_release(&self) {
        let poll = self.config.poll_interval();
        while !self.signals.wait_chip_select_released(poll) {
            if self.is_draining() {
                return;
            }
            trace!("waiting for chip-select release");
        }
    }

    /// Arm the next transaction, recording a retry on failure.
    pub(crate) fn arm_next(&self) {
        let Err(err) = self.try_arm(None) else {
            return;
        };
        self.rearm_pending.store(true, Ordering::Release);
        match err {
            SpiError::Transport(TransportError::PoolExhausted { pool }) => {
                self.stats.pool_exhausted();
                error!(pool, "pool exhausted; arm deferred");
            }
            err => {
                self.stats.bus_failure();
                error!(error = %err, "failed to arm transaction");
            }
        }
    }

    /// Bind buffers into a descriptor and hand it to the bus. `preset`
    /// replaces the queue lookup.
    fn try_arm(&self, preset: Option<WireBuffer>) -> Result<()> {
        let rx = self.buffers.acquire(false)?;
        let mut trans = self.descriptors.acquire(true)?;
        let tx = match preset {
            Some(buf) => buf,
            None => self.next_tx()?,
        };

        trans.bind(tx, rx, self.config.frame.block_size());
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self.bus.queue_transaction(trans) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(err.into());
        }
        Ok(())
    }

    fn next_tx(&self) -> Result<WireBuffer> {
        if let Some(slot) = self.mux.dequeue_tx_next() {
            return Ok(slot.buf);
        }

        let mut dummy = self.buffers.acquire(true)?;
        encode_dummy(&mut dummy, self.flow.throttle())?;
        self.signals.set_data_ready(false);

        // A producer may have queued between the pop and the line drop.
        if let Some(slot) = self.mux.dequeue_tx_next() {
            self.signals.set_data_ready(true);
            return Ok(slot.buf);
        }
        Ok(dummy)
    }

    /// Tear down a completed transaction and deliver what it carried.
    fn finish(&self, mut trans: Transaction) {
        if let Some(reason) = trans.fault() {
            self.stats.bus_failure();
            warn!(reason, "bus transaction failed");
            drop(trans.take_tx());
            drop(trans.take_rx());
            return;
        }

        if let Some(tx) = trans.take_tx() {
            match Header::parse(&tx) {
                Ok(header) if !header.is_dummy() => {
                    self.stats.frame_sent(header.if_type.priority());
                    trace!(if_type = %header.if_type, seq = header.seq_num, "frame sent");
                }
                _ => self.stats.dummy_sent(),
            }
        }
        let rx = trans.take_rx();
        drop(trans);

        if let Some(rx) = rx {
            self.process_rx(rx);
        }
    }

    fn process_rx(&self, rx: WireBuffer) {
        let flags = peek_flags(&rx);
        if flags.contains(Flags::POWER_SAVE_STARTED) {
            self.notify(PowerSaveEvent::Started);
        } else if flags.contains(Flags::POWER_SAVE_STOPPED) {
            self.notify(PowerSaveEvent::Stopped);
        }

        match decode_header(&rx, &self.config.frame) {
            Ok(header) => self.deliver(RxFrame::new(header, rx)),
            Err(FrameError::DummyFrame) => self.stats.dummy_received(),
            Err(err @ FrameError::ChecksumMismatch { .. }) => {
                self.stats.dropped(DropReason::Checksum);
                warn!(error = %err, "dropping received frame");
            }
            Err(err) => {
                self.stats.dropped(DropReason::Malformed);
                debug!(error = %err, "dropping received frame");
            }
        }
    }

    fn deliver(&self, frame: RxFrame) {
        let priority = frame.priority();
        let if_type = frame.if_type();
        let seq = frame.header().seq_num;
        match self
            .mux
            .enqueue_rx(frame, self.config.rx_block_timeout())
        {
            Ok(_) => {
                self.stats.frame_received(priority);
                trace!(%if_type, %priority, seq, "frame received");
            }
            Err(_) => self.stats.dropped(DropReason::Overrun),
        }
        self.update_flow();
    }
}
