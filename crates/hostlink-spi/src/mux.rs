//! Three-level priority queues, one set per direction.
//!
//! Each priority is a bounded FIFO. Dequeue always drains control before
//! voice before bulk. Only bulk producers may wait for space. A full control
//! or voice queue is logged as an error.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Select, Sender};
use hostlink_frame::{Frame, Header, InterfaceType, Priority};
use hostlink_transport::WireBuffer;

use crate::config::QueueDepths;
use crate::error::{Result, SpiError};

/// Bounded FIFOs indexed by [`Priority`].
pub struct PriorityQueues<T> {
    direction: &'static str,
    senders: [Sender<T>; 3],
    receivers: [Receiver<T>; 3],
}

impl<T> PriorityQueues<T> {
    pub fn new(direction: &'static str, depths: &QueueDepths) -> Self {
        let [control, voice, bulk] =
            Priority::ALL.map(|priority| crossbeam_channel::bounded(depths.get(priority)));
        Self {
            direction,
            senders: [control.0, voice.0, bulk.0],
            receivers: [control.1, voice.1, bulk.1],
        }
    }

    /// Push onto one queue, waiting up to `wait` for space. A zero wait
    /// fails at once. The item comes back on failure.
    pub fn push(&self, priority: Priority, item: T, wait: Duration) -> std::result::Result<(), T> {
        let sender = &self.senders[priority.index()];
        if wait.is_zero() {
            sender.try_send(item).map_err(|err| err.into_inner())
        } else {
            sender
                .send_timeout(item, wait)
                .map_err(|err| err.into_inner())
        }
    }

    /// Highest-priority item, without waiting.
    pub fn pop_next(&self) -> Option<(Priority, T)> {
        Priority::ALL.into_iter().find_map(|priority| {
            self.receivers[priority.index()]
                .try_recv()
                .ok()
                .map(|item| (priority, item))
        })
    }

    /// Highest-priority item, waiting until one arrives, `timeout` expires
    /// or `shutdown` disconnects.
    pub fn pop_wait(
        &self,
        timeout: Option<Duration>,
        shutdown: &Receiver<()>,
    ) -> Result<(Priority, T)> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if let Some(found) = self.pop_next() {
                return Ok(found);
            }

            let mut select = Select::new();
            for receiver in &self.receivers {
                select.recv(receiver);
            }
            let stop = select.recv(shutdown);
            let ready = match deadline {
                Some(deadline) => select.ready_deadline(deadline).ok(),
                None => Some(select.ready()),
            };
            match ready {
                Some(index) if index == stop => return Err(SpiError::Inactive),
                Some(_) => continue,
                None => return Err(SpiError::Timeout(timeout.unwrap_or_default())),
            }
        }
    }

    pub fn len(&self, priority: Priority) -> usize {
        self.receivers[priority.index()].len()
    }

    pub fn capacity(&self, priority: Priority) -> usize {
        self.receivers[priority.index()].capacity().unwrap_or(0)
    }

    pub fn total_len(&self) -> usize {
        self.receivers.iter().map(Receiver::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.iter().all(Receiver::is_empty)
    }

    /// Drop everything queued. Returns how many items were dropped.
    pub fn clear(&self) -> usize {
        self.receivers
            .iter()
            .map(|receiver| receiver.try_iter().count())
            .sum()
    }
}

impl<T> fmt::Debug for PriorityQueues<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueues")
            .field("direction", &self.direction)
            .field("lens", &Priority::ALL.map(|priority| self.len(priority)))
            .finish()
    }
}

/// An encoded outgoing frame waiting for the bus.
///
/// The bus always clocks a full block, so only the buffer travels.
#[derive(Debug)]
pub struct TxSlot {
    pub buf: WireBuffer,
    pub if_type: InterfaceType,
}

/// A validated frame received from the host.
///
/// Holds the bus buffer it arrived in; dropping the frame returns the buffer
/// to the pool.
pub struct RxFrame {
    header: Header,
    buf: WireBuffer,
}

impl RxFrame {
    /// `header` must come from validating `buf`.
    pub(crate) fn new(header: Header, buf: WireBuffer) -> Self {
        Self { header, buf }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn if_type(&self) -> InterfaceType {
        self.header.if_type
    }

    pub fn if_num(&self) -> u8 {
        self.header.if_num
    }

    pub fn priority(&self) -> Priority {
        self.header.if_type.priority()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header.payload_range()]
    }

    /// Copy into an owned [`Frame`], releasing nothing.
    pub fn to_frame(&self) -> Frame {
        Frame {
            if_type: self.header.if_type,
            if_num: self.header.if_num,
            flags: self.header.flags,
            seq_num: self.header.seq_num,
            throttle: self.header.throttle,
            pkt_type: self.header.pkt_type,
            payload: Bytes::copy_from_slice(self.payload()),
        }
    }
}

impl fmt::Debug for RxFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxFrame")
            .field("if_type", &self.header.if_type)
            .field("if_num", &self.header.if_num)
            .field("seq_num", &self.header.seq_num)
            .field("len", &self.header.len)
            .finish()
    }
}

/// TX and RX priority queues, routed by interface type.
#[derive(Debug)]
pub struct Multiplexer {
    tx: PriorityQueues<TxSlot>,
    rx: PriorityQueues<RxFrame>,
}

impl Multiplexer {
    pub fn new(tx_depths: &QueueDepths, rx_depths: &QueueDepths) -> Self {
        Self {
            tx: PriorityQueues::new("tx", tx_depths),
            rx: PriorityQueues::new("rx", rx_depths),
        }
    }

    /// Queue an encoded frame. `bulk_wait` bounds the wait on a full bulk
    /// queue; control and voice never wait.
    pub fn enqueue_tx(&self, slot: TxSlot, bulk_wait: Duration) -> Result<Priority> {
        let priority = slot.if_type.priority();
        push_routed(&self.tx, priority, slot, bulk_wait)
    }

    /// Next frame to send, control first.
    pub fn dequeue_tx_next(&self) -> Option<TxSlot> {
        self.tx.pop_next().map(|(_, slot)| slot)
    }

    /// Deliver a received frame to its queue.
    pub fn enqueue_rx(&self, frame: RxFrame, bulk_wait: Duration) -> Result<Priority> {
        let priority = frame.priority();
        push_routed(&self.rx, priority, frame, bulk_wait)
    }

    /// Next received frame, control first, waiting as [`PriorityQueues::pop_wait`].
    pub fn dequeue_rx(&self, timeout: Option<Duration>, shutdown: &Receiver<()>) -> Result<RxFrame> {
        self.rx
            .pop_wait(timeout, shutdown)
            .map(|(_, frame)| frame)
    }

    pub fn try_dequeue_rx(&self) -> Option<RxFrame> {
        self.rx.pop_next().map(|(_, frame)| frame)
    }

    pub fn tx_queues(&self) -> &PriorityQueues<TxSlot> {
        &self.tx
    }

    pub fn rx_queues(&self) -> &PriorityQueues<RxFrame> {
        &self.rx
    }

    /// Drop everything queued in both directions.
    pub fn clear(&self) -> usize {
        self.tx.clear() + self.rx.clear()
    }
}

fn push_routed<T>(
    queues: &PriorityQueues<T>,
    priority: Priority,
    item: T,
    bulk_wait: Duration,
) -> Result<Priority> {
    let wait = if priority == Priority::Bulk {
        bulk_wait
    } else {
        Duration::ZERO
    };
    match queues.push(priority, item, wait) {
        Ok(()) => Ok(priority),
        Err(_dropped) => {
            if priority == Priority::Bulk {
                tracing::debug!(direction = queues.direction, %priority, "queue full");
            } else {
                tracing::error!(
                    direction = queues.direction,
                    %priority,
                    capacity = queues.capacity(priority),
                    "priority queue full"
                );
            }
            Err(SpiError::QueueFull { priority })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depths(n: usize) -> QueueDepths {
        QueueDepths {
            control: n,
            voice: n,
            bulk: n,
        }
    }

    #[test]
    fn pops_in_priority_order_and_fifo_within() {
        let queues = PriorityQueues::new("tx", &depths(4));
        queues.push(Priority::Bulk, "b1", Duration::ZERO).unwrap();
        queues.push(Priority::Voice, "v1", Duration::ZERO).unwrap();
        queues.push(Priority::Bulk, "b2", Duration::ZERO).unwrap();
        queues.push(Priority::Control, "c1", Duration::ZERO).unwrap();
        queues.push(Priority::Voice, "v2", Duration::ZERO).unwrap();

        let order: Vec<_> = std::iter::from_fn(|| queues.pop_next().map(|(_, s)| s)).collect();
        assert_eq!(order, ["c1", "v1", "v2", "b1", "b2"]);
        assert!(queues.is_empty());
    }

    #[test]
    fn full_queue_returns_item() {
        let queues = PriorityQueues::new("tx", &depths(1));
        queues.push(Priority::Bulk, 1, Duration::ZERO).unwrap();
        assert_eq!(queues.push(Priority::Bulk, 2, Duration::ZERO), Err(2));
        assert_eq!(
            queues.push(Priority::Bulk, 3, Duration::from_millis(10)),
            Err(3)
        );
        assert_eq!(queues.len(Priority::Bulk), 1);
        assert_eq!(queues.capacity(Priority::Bulk), 1);
    }

    #[test]
    fn bulk_pressure_does_not_block_control() {
        let queues = PriorityQueues::new("tx", &depths(2));
        queues.push(Priority::Bulk, 0, Duration::ZERO).unwrap();
        queues.push(Priority::Bulk, 1, Duration::ZERO).unwrap();
        assert!(queues.push(Priority::Bulk, 2, Duration::ZERO).is_err());
        queues.push(Priority::Control, 9, Duration::ZERO).unwrap();
        assert_eq!(queues.pop_next(), Some((Priority::Control, 9)));
    }

    #[test]
    fn pop_wait_wakes_on_push_from_another_thread() {
        let queues = std::sync::Arc::new(PriorityQueues::new("rx", &depths(2)));
        let (_keep, shutdown) = crossbeam_channel::bounded::<()>(0);

        let producer = {
            let queues = std::sync::Arc::clone(&queues);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queues.push(Priority::Voice, 7u8, Duration::ZERO).unwrap();
            })
        };

        let got = queues
            .pop_wait(Some(Duration::from_secs(5)), &shutdown)
            .unwrap();
        assert_eq!(got, (Priority::Voice, 7));
        producer.join().unwrap();
    }

    #[test]
    fn pop_wait_times_out() {
        let queues: PriorityQueues<u8> = PriorityQueues::new("rx", &depths(1));
        let (_keep, shutdown) = crossbeam_channel::bounded::<()>(0);
        let err = queues
            .pop_wait(Some(Duration::from_millis(10)), &shutdown)
            .unwrap_err();
        assert!(matches!(err, SpiError::Timeout(_)));
    }

    #[test]
    fn pop_wait_returns_inactive_on_shutdown() {
        let queues: PriorityQueues<u8> = PriorityQueues::new("rx", &depths(1));
        let (stop, shutdown) = crossbeam_channel::bounded::<()>(0);
        drop(stop);
        let err = queues.pop_wait(None, &shutdown).unwrap_err();
        assert!(matches!(err, SpiError::Inactive));
    }

    #[test]
    fn clear_drops_everything() {
        let queues = PriorityQueues::new("rx", &depths(3));
        for priority in Priority::ALL {
            queues.push(priority, 0, Duration::ZERO).unwrap();
        }
        assert_eq!(queues.total_len(), 3);
        assert_eq!(queues.clear(), 3);
        assert!(queues.is_empty());
    }
}
