//! In-memory SPI slave peripheral, GPIO bank and host controller.
//!
//! [`SimBus`] behaves like a slave SPI driver with a small transaction queue:
//! one transaction is loaded into the peripheral at a time, `transaction_ready`
//! fires when it is loaded and `transaction_done` fires when the host has
//! clocked it. Completed descriptors come back through a bounded channel.
//!
//! [`SimGpio`] keeps line levels and delivers chip-select edges to the
//! registered interrupt handlers. [`SimHost`] plays the host controller: it
//! waits for Handshake, asserts chip-select, clocks a full-duplex transfer and
//! releases chip-select.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::trace;

use crate::bus::{BusEvents, SlaveBus, Transaction};
use crate::error::{Result, TransportError};
use crate::gpio::{Edge, EdgeHandler, Gpio, Level, Line};

/// GPIO bank with host-drivable inputs.
pub struct SimGpio {
    state: Mutex<GpioState>,
    changed: Condvar,
}

struct GpioState {
    levels: HashMap<Line, Level>,
    transitions: HashMap<Line, usize>,
    handlers: Vec<(Line, Edge, Arc<EdgeHandler>)>,
}

impl SimGpio {
    /// Outputs start low; chip-select idles high (pulled up, deasserted).
    pub fn new() -> Arc<Self> {
        let levels = HashMap::from([
            (Line::Handshake, Level::Low),
            (Line::DataReady, Level::Low),
            (Line::ChipSelect, Level::High),
        ]);
        Arc::new(Self {
            state: Mutex::new(GpioState {
                levels,
                transitions: HashMap::new(),
                handlers: Vec::new(),
            }),
            changed: Condvar::new(),
        })
    }

    /// Drive an input line from the host side and fire matching interrupts.
    pub fn drive(&self, line: Line, level: Level) {
        let handlers: Vec<Arc<EdgeHandler>> = {
            let mut state = self.state.lock();
            let previous = state.levels.insert(line, level).unwrap_or(Level::Low);
            self.changed.notify_all();
            state
                .handlers
                .iter()
                .filter(|(l, edge, _)| *l == line && edge.matches(previous, level))
                .map(|(_, _, handler)| Arc::clone(handler))
                .collect()
        };

        // Handlers run outside the lock; they typically drive output lines.
        for handler in handlers {
            handler(level);
        }
    }

    /// Wait until `line` reads `level`. Returns `false` on timeout.
    pub fn wait_for(&self, line: Line, level: Level, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.levels.get(&line) == Some(&level) {
                return true;
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.levels.get(&line) == Some(&level);
            }
        }
    }

    /// How many times `line` changed level through [`Gpio::set_level`].
    pub fn transitions(&self, line: Line) -> usize {
        self.state
            .lock()
            .transitions
            .get(&line)
            .copied()
            .unwrap_or(0)
    }
}

impl Gpio for SimGpio {
    fn set_level(&self, line: Line, level: Level) {
        let mut state = self.state.lock();
        let previous = state.levels.insert(line, level);
        if previous != Some(level) {
            *state.transitions.entry(line).or_insert(0) += 1;
            trace!(?line, ?level, "line changed");
        }
        self.changed.notify_all();
    }

    fn level(&self, line: Line) -> Level {
        self.state
            .lock()
            .levels
            .get(&line)
            .copied()
            .unwrap_or(Level::Low)
    }

    fn configure_interrupt(&self, line: Line, edge: Edge, handler: EdgeHandler) -> Result<()> {
        if line != Line::ChipSelect {
            return Err(TransportError::InvalidConfig(format!(
                "{line:?} is an output line; interrupts are only available on chip-select"
            )));
        }
        self.state
            .lock()
            .handlers
            .push((line, edge, Arc::new(handler)));
        Ok(())
    }
}

impl fmt::Debug for SimGpio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimGpio")
            .field("levels", &state.levels)
            .field("handlers", &state.handlers.len())
            .finish()
    }
}

/// Slave SPI peripheral with a bounded driver queue.
pub struct SimBus {
    state: Mutex<BusState>,
    events: RwLock<Option<Arc<dyn BusEvents>>>,
    done_tx: Sender<Transaction>,
    done_rx: Receiver<Transaction>,
    queue_size: usize,
}

#[derive(Default)]
struct BusState {
    loaded: Option<Transaction>,
    queued: VecDeque<Transaction>,
    clocked: u64,
}

impl SimBus {
    /// A peripheral accepting up to `queue_size` outstanding transactions.
    pub fn new(queue_size: usize) -> Arc<Self> {
        let queue_size = queue_size.max(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded(queue_size);
        Arc::new(Self {
            state: Mutex::new(BusState::default()),
            events: RwLock::new(None),
            done_tx,
            done_rx,
            queue_size,
        })
    }

    /// Whether a transaction is loaded and waiting for the host.
    pub fn is_loaded(&self) -> bool {
        self.state.lock().loaded.is_some()
    }

    /// Transactions queued or loaded but not yet clocked.
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.queued.len() + usize::from(state.loaded.is_some())
    }

    /// Transfers clocked since creation.
    pub fn clocked(&self) -> u64 {
        self.state.lock().clocked
    }

    fn events(&self) -> Option<Arc<dyn BusEvents>> {
        self.events.read().clone()
    }

    /// Exchange bytes with the loaded transaction.
    fn clock(&self, host_tx: &[u8], fault: Option<&str>) -> Result<Vec<u8>> {
        let (completed, out, next_loaded) = {
            let mut state = self.state.lock();
            let mut trans = state.loaded.take().ok_or(TransportError::BusNotReady)?;

            let length = trans.length();
            let out = trans
                .tx()
                .map(|tx| tx[..length.min(tx.len())].to_vec())
                .unwrap_or_default();
            if let Some(rx) = trans.rx_mut() {
                let n = host_tx.len().min(rx.len()).min(length);
                rx[..n].copy_from_slice(&host_tx[..n]);
            }
            if let Some(reason) = fault {
                trans.set_fault(reason);
            }

            state.loaded = state.queued.pop_front();
            state.clocked += 1;
            (trans, out, state.loaded.is_some())
        };

        let events = self.events();
        if let Some(events) = &events {
            events.transaction_done();
        }

        if let Err(err) = self.done_tx.try_send(completed) {
            let reason = match err {
                TrySendError::Full(_) => "completion queue full",
                TrySendError::Disconnected(_) => "completion queue closed",
            };
            return Err(TransportError::BusTransactionFailed(reason.to_string()));
        }

        if next_loaded {
            if let Some(events) = &events {
                events.transaction_ready();
            }
        }

        trace!(bytes = out.len(), "transfer clocked");
        Ok(out)
    }
}

impl SlaveBus for SimBus {
    fn set_events(&self, events: Arc<dyn BusEvents>) {
        *self.events.write() = Some(events);
    }

    fn queue_transaction(&self, transaction: Transaction) -> Result<()> {
        let loaded_now = {
            let mut state = self.state.lock();
            let outstanding = state.queued.len() + usize::from(state.loaded.is_some());
            if outstanding >= self.queue_size {
                return Err(TransportError::BusNotReady);
            }
            if state.loaded.is_none() {
                state.loaded = Some(transaction);
                true
            } else {
                state.queued.push_back(transaction);
                false
            }
        };

        if loaded_now {
            if let Some(events) = self.events() {
                events.transaction_ready();
            }
        }
        Ok(())
    }

    fn transaction_result(&self, timeout: Duration) -> Result<Transaction> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(trans) => Ok(trans),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Shutdown),
        }
    }

    fn cancel_pending(&self) -> Vec<Transaction> {
        let mut state = self.state.lock();
        let mut pending: Vec<Transaction> = state.loaded.take().into_iter().collect();
        pending.extend(state.queued.drain(..));
        pending
    }
}

impl fmt::Debug for SimBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimBus")
            .field("queue_size", &self.queue_size)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// The host side of a simulated link.
#[derive(Debug, Clone)]
pub struct SimHost {
    bus: Arc<SimBus>,
    gpio: Arc<SimGpio>,
    handshake_active: Level,
    data_ready_active: Level,
}

impl SimHost {
    /// Host expecting active-high Handshake and DataReady lines.
    pub fn new(bus: Arc<SimBus>, gpio: Arc<SimGpio>) -> Self {
        Self {
            bus,
            gpio,
            handshake_active: Level::High,
            data_ready_active: Level::High,
        }
    }

    /// Override the levels that mean "asserted".
    pub fn with_active_levels(mut self, handshake: Level, data_ready: Level) -> Self {
        self.handshake_active = handshake;
        self.data_ready_active = data_ready;
        self
    }

    /// Whether the slave currently asserts Handshake.
    pub fn handshake(&self) -> bool {
        self.gpio.level(Line::Handshake) == self.handshake_active
    }

    /// Whether the slave currently asserts DataReady.
    pub fn data_ready(&self) -> bool {
        self.gpio.level(Line::DataReady) == self.data_ready_active
    }

    /// Wait until the slave asserts Handshake.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        if self
            .gpio
            .wait_for(Line::Handshake, self.handshake_active, timeout)
        {
            Ok(())
        } else {
            Err(TransportError::Timeout(timeout))
        }
    }

    /// One full exchange: wait for Handshake, assert chip-select, clock,
    /// release chip-select. Returns the bytes the slave sent.
    pub fn exchange(&self, host_tx: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.exchange_inner(host_tx, None, timeout)
    }

    /// Like [`exchange`](Self::exchange), but the peripheral reports a
    /// driver-level failure for the transfer.
    pub fn exchange_faulted(
        &self,
        host_tx: &[u8],
        reason: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.exchange_inner(host_tx, Some(reason), timeout)
    }

    /// Assert chip-select without clocking.
    pub fn select(&self) {
        self.gpio.drive(Line::ChipSelect, Level::Low);
    }

    /// Release chip-select.
    pub fn deselect(&self) {
        self.gpio.drive(Line::ChipSelect, Level::High);
    }

    /// Clock the loaded transaction without touching chip-select or waiting
    /// for Handshake.
    pub fn clock(&self, host_tx: &[u8]) -> Result<Vec<u8>> {
        self.bus.clock(host_tx, None)
    }

    fn exchange_inner(
        &self,
        host_tx: &[u8],
        fault: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.wait_ready(timeout)?;
        self.select();
        let result = self.bus.clock(host_tx, fault);
        self.deselect();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::bus::TransactionDesc;
    use crate::pool::{BufferPool, Pool};

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[derive(Default)]
    struct CountingEvents {
        ready: AtomicUsize,
        done: AtomicUsize,
    }

    impl BusEvents for CountingEvents {
        fn transaction_ready(&self) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }

        fn transaction_done(&self) {
            self.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn transaction(buffers: &BufferPool, descs: &Pool<TransactionDesc>, fill: u8) -> Transaction {
        let mut tx = buffers.acquire(true).unwrap();
        tx.fill(fill);
        let mut trans = descs.acquire(true).unwrap();
        trans.bind(tx, buffers.acquire(true).unwrap(), 8);
        trans
    }

    #[test]
    fn clock_exchanges_bytes_and_completes() {
        let buffers = BufferPool::with_block_size("wire", 4, 8).unwrap();
        let descs = Pool::new("trans", 2, TransactionDesc::default).unwrap();
        let bus = SimBus::new(2);
        let events = Arc::new(CountingEvents::default());
        bus.set_events(events.clone());
        let host = SimHost::new(bus.clone(), SimGpio::new());

        bus.queue_transaction(transaction(&buffers, &descs, 0xAA))
            .unwrap();
        assert!(bus.is_loaded());
        assert_eq!(events.ready.load(Ordering::SeqCst), 1);

        let out = host.clock(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(out, vec![0xAA; 8]);
        assert_eq!(events.done.load(Ordering::SeqCst), 1);

        let done = bus.transaction_result(TIMEOUT).unwrap();
        assert_eq!(done.rx().unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bus.clocked(), 1);
    }

    #[test]
    fn queued_transaction_loads_after_completion() {
        let buffers = BufferPool::with_block_size("wire", 6, 8).unwrap();
        let descs = Pool::new("trans", 3, TransactionDesc::default).unwrap();
        let bus = SimBus::new(2);
        let events = Arc::new(CountingEvents::default());
        bus.set_events(events.clone());
        let host = SimHost::new(bus.clone(), SimGpio::new());

        bus.queue_transaction(transaction(&buffers, &descs, 1))
            .unwrap();
        bus.queue_transaction(transaction(&buffers, &descs, 2))
            .unwrap();
        assert_eq!(bus.outstanding(), 2);
        assert!(matches!(
            bus.queue_transaction(transaction(&buffers, &descs, 3)),
            Err(TransportError::BusNotReady)
        ));
        assert_eq!(descs.in_use(), 2);

        assert_eq!(host.clock(&[]).unwrap(), vec![1; 8]);
        assert_eq!(events.ready.load(Ordering::SeqCst), 2);
        assert_eq!(host.clock(&[]).unwrap(), vec![2; 8]);
        assert!(matches!(host.clock(&[]), Err(TransportError::BusNotReady)));
    }

    #[test]
    fn result_times_out_when_nothing_completed() {
        let bus = SimBus::new(1);
        let err = bus
            .transaction_result(Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[test]
    fn cancel_pending_returns_unclocked_transactions() {
        let buffers = BufferPool::with_block_size("wire", 4, 8).unwrap();
        let descs = Pool::new("trans", 2, TransactionDesc::default).unwrap();
        let bus = SimBus::new(2);
        bus.queue_transaction(transaction(&buffers, &descs, 1))
            .unwrap();

        let pending = bus.cancel_pending();
        assert_eq!(pending.len(), 1);
        assert!(!bus.is_loaded());
        drop(pending);
        assert_eq!(buffers.in_use(), 0);
    }

    #[test]
    fn chip_select_edges_reach_handlers() {
        let gpio = SimGpio::new();
        let falls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&falls);
        gpio.configure_interrupt(
            Line::ChipSelect,
            Edge::Falling,
            Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        gpio.drive(Line::ChipSelect, Level::Low);
        gpio.drive(Line::ChipSelect, Level::High);
        gpio.drive(Line::ChipSelect, Level::Low);
        assert_eq!(falls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn interrupts_rejected_on_output_lines() {
        let gpio = SimGpio::new();
        let err = gpio
            .configure_interrupt(Line::Handshake, Edge::Any, Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidConfig(_)));
    }

    #[test]
    fn host_waits_for_handshake() {
        let bus = SimBus::new(1);
        let gpio = SimGpio::new();
        let host = SimHost::new(bus, gpio.clone());
        assert!(matches!(
            host.exchange(&[], Duration::from_millis(10)),
            Err(TransportError::Timeout(_))
        ));

        gpio.set_level(Line::Handshake, Level::High);
        assert!(host.handshake());
        assert_eq!(gpio.transitions(Line::Handshake), 1);
    }
}
