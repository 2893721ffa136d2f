use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use hostlink_frame::{encode_frame, Frame, Header, InterfaceType, Priority, SlaveCapabilities};
use hostlink_transport::{BufferPool, Gpio, Pool, SlaveBus, TransactionDesc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, trace};

use crate::config::SpiConfig;
use crate::error::{Result, SpiError};
use crate::flow::FlowControl;
use crate::mux::{Multiplexer, RxFrame, TxSlot};
use crate::signal::{SignalState, Signals};
use crate::startup::Startup;
use crate::stats::{Stats, StatsSnapshot};

/// Host power-save transitions, taken from received header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerSaveEvent {
    Started,
    Stopped,
}

/// Callback for [`PowerSaveEvent`]s. Runs on the pump worker thread.
pub type PowerSaveHandler = Arc<dyn Fn(PowerSaveEvent) + Send + Sync>;

/// Lifecycle of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LinkState {
    /// Pools and queues exist; frames may be queued but nothing is armed.
    Initialized = 0,
    /// The pump is running.
    Active = 1,
    /// No new transactions are armed; the in-flight one may complete.
    Draining = 2,
    /// Torn down.
    Deinit = 3,
}

impl LinkState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LinkState::Initialized,
            1 => LinkState::Active,
            2 => LinkState::Draining,
            _ => LinkState::Deinit,
        }
    }
}

/// State shared between the handle and the pump worker.
pub(crate) struct Inner {
    pub(crate) config: SpiConfig,
    pub(crate) bus: Arc<dyn SlaveBus>,
    pub(crate) signals: Arc<Signals>,
    pub(crate) buffers: BufferPool,
    pub(crate) descriptors: Pool<TransactionDesc>,
    pub(crate) mux: Multiplexer,
    pub(crate) flow: FlowControl,
    pub(crate) stats: Stats,
    pub(crate) startup: Startup,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) rearm_pending: AtomicBool,
    pub(crate) drain_deadline: Mutex<Option<Instant>>,
    state: AtomicU8,
    seq: AtomicU16,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    event_handler: RwLock<Option<PowerSaveHandler>>,
}

impl Inner {
    pub(crate) fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_draining(&self) -> bool {
        matches!(self.state(), LinkState::Draining | LinkState::Deinit)
    }

    pub(crate) fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn notify(&self, event: PowerSaveEvent) {
        self.stats.power_save_event();
        info!(?event, "host power save");
        let handler = self.event_handler.read().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    /// Re-evaluate throttling from bulk RX occupancy.
    pub(crate) fn update_flow(&self) {
        let rx = self.mux.rx_queues();
        let bulk = Priority::Bulk;
        if let Some(on) = self.flow.update(rx.len(bulk), rx.capacity(bulk)) {
            self.stats.throttle_changed(on);
            info!(
                throttling = on,
                occupied = rx.len(bulk),
                capacity = rx.capacity(bulk),
                "flow control changed"
            );
        }
    }

    fn submit_header(&self, header: Header, payload: &[u8]) -> Result<()> {
        if !matches!(self.state(), LinkState::Initialized | LinkState::Active) {
            return Err(SpiError::Inactive);
        }
        if payload.is_empty() {
            return Err(SpiError::EmptyPayload);
        }

        let mut buf = self.buffers.acquire(false).map_err(|err| {
            self.stats.pool_exhausted();
            error!(error = %err, "no buffer for outgoing frame");
            err
        })?;
        let header = Header {
            throttle: self.flow.throttle(),
            ..header
        };
        let len = encode_frame(&header, payload, &mut buf, &self.config.frame)?;

        let slot = TxSlot {
            buf,
            if_type: header.if_type,
        };
        match self.mux.enqueue_tx(slot, self.config.tx_block_timeout()) {
            Ok(priority) => {
                trace!(
                    if_type = %header.if_type,
                    %priority,
                    seq = header.seq_num,
                    len,
                    "frame queued"
                );
                self.signals.set_data_ready(true);
                Ok(())
            }
            Err(err) => {
                self.stats.tx_queue_full();
                Err(err)
            }
        }
    }
}

/// Slave side of one SPI link.
///
/// Producers call [`submit_frame`](Self::submit_frame) from any thread;
/// consumers pull with [`recv`](Self::recv). A dedicated worker thread keeps
/// one transaction armed on the bus at all times while active.
pub struct SpiTransport {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SpiTransport {
    /// Build pools, queues and line state. Nothing is armed until
    /// [`start`](Self::start).
    pub fn new(config: SpiConfig, bus: Arc<dyn SlaveBus>, gpio: Arc<dyn Gpio>) -> Result<Self> {
        config.validate()?;

        let buffers = BufferPool::with_block_size(
            "wire",
            config.buffer_blocks(),
            config.frame.block_size(),
        )
        .map_err(|err| SpiError::OutOfMemoryAtInit(err.to_string()))?;
        let descriptors = Pool::new(
            "transaction",
            config.descriptor_blocks(),
            TransactionDesc::default,
        )
        .map_err(|err| SpiError::OutOfMemoryAtInit(err.to_string()))?;

        let signals = Signals::new(gpio, &config);
        signals.init()?;
        bus.set_events(signals.clone());

        let flow = FlowControl::new(config.throttle_high_percent, config.throttle_low_percent);
        let startup = Startup::new(config.slave_capabilities());
        let mux = Multiplexer::new(&config.tx_queues, &config.rx_queues);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);

        info!(
            buffers = buffers.capacity(),
            block_size = config.frame.block_size(),
            descriptors = descriptors.capacity(),
            checksum = config.frame.checksum,
            throttle_high = config.throttle_high_percent,
            throttle_low = config.throttle_low_percent,
            policy = ?config.deassert_policy,
            "spi transport initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                bus,
                signals,
                buffers,
                descriptors,
                mux,
                flow,
                stats: Stats::default(),
                startup,
                in_flight: AtomicUsize::new(0),
                rearm_pending: AtomicBool::new(false),
                drain_deadline: Mutex::new(None),
                state: AtomicU8::new(LinkState::Initialized as u8),
                seq: AtomicU16::new(0),
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                shutdown_rx,
                event_handler: RwLock::new(None),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Arm the capability event and start the pump worker.
    pub fn start(&self) -> Result<()> {
        if let Err(current) = self.inner.state.compare_exchange(
            LinkState::Initialized as u8,
            LinkState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return Err(match LinkState::from_u8(current) {
                LinkState::Active => SpiError::AlreadyStarted,
                _ => SpiError::Inactive,
            });
        }

        if let Err(err) = self.inner.arm_startup() {
            self.inner
                .state
                .store(LinkState::Initialized as u8, Ordering::Release);
            return Err(err);
        }

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("hostlink-pump".into())
            .spawn(move || inner.run())
            .map_err(|err| SpiError::OutOfMemoryAtInit(format!("pump worker: {err}")))?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Queue a frame with the next sequence number.
    pub fn submit_frame(&self, if_type: InterfaceType, if_num: u8, payload: &[u8]) -> Result<()> {
        let header = Header {
            seq_num: self.inner.next_seq(),
            ..Header::new(if_type, if_num)
        };
        self.inner.submit_header(header, payload)
    }

    /// Queue a frame keeping its own flags, packet type and sequence number.
    /// The throttle field is always overwritten.
    pub fn submit(&self, frame: &Frame) -> Result<()> {
        self.inner.submit_header(frame.header(), &frame.payload)
    }

    /// Next received frame, control first. Blocks until one arrives or the
    /// transport is torn down.
    pub fn recv(&self) -> Result<RxFrame> {
        self.recv_inner(None)
    }

    /// Like [`recv`](Self::recv) with a bound on the wait.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<RxFrame> {
        self.recv_inner(Some(timeout))
    }

    /// Next received frame if one is queued.
    pub fn try_recv(&self) -> Result<Option<RxFrame>> {
        self.ensure_open()?;
        let frame = self.inner.mux.try_dequeue_rx();
        if frame.is_some() {
            self.inner.update_flow();
        }
        Ok(frame)
    }

    fn recv_inner(&self, timeout: Option<Duration>) -> Result<RxFrame> {
        self.ensure_open()?;
        let frame = self
            .inner
            .mux
            .dequeue_rx(timeout, &self.inner.shutdown_rx)?;
        self.inner.update_flow();
        Ok(frame)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.inner.state() {
            LinkState::Initialized | LinkState::Active => Ok(()),
            LinkState::Draining | LinkState::Deinit => Err(SpiError::Inactive),
        }
    }

    /// Install the power-save callback, replacing any previous one.
    pub fn register_event_handler<F>(&self, handler: F)
    where
        F: Fn(PowerSaveEvent) + Send + Sync + 'static,
    {
        *self.inner.event_handler.write() = Some(Arc::new(handler));
    }

    /// Stop arming, let the in-flight transaction finish (bounded by
    /// `drain_timeout_ms`), then release everything. Blocked consumers
    /// return [`SpiError::Inactive`]. Idempotent.
    pub fn deinit(&self) -> Result<()> {
        let previous = self
            .inner
            .state
            .swap(LinkState::Draining as u8, Ordering::AcqRel);
        match LinkState::from_u8(previous) {
            LinkState::Draining => return Ok(()),
            LinkState::Deinit => {
                self.inner
                    .state
                    .store(LinkState::Deinit as u8, Ordering::Release);
                return Ok(());
            }
            LinkState::Initialized | LinkState::Active => {}
        }
        info!(in_flight = self.inner.in_flight.load(Ordering::Acquire), "draining");

        *self.inner.drain_deadline.lock() =
            Some(Instant::now() + self.inner.config.drain_timeout());
        drop(self.inner.shutdown_tx.lock().take());

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("pump worker panicked");
            }
        }

        let cancelled = self.inner.bus.cancel_pending();
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), "cancelled unclocked transactions");
        }
        drop(cancelled);
        while let Ok(done) = self.inner.bus.transaction_result(Duration::ZERO) {
            drop(done);
        }
        self.inner.in_flight.store(0, Ordering::Release);

        let dropped = self.inner.mux.clear();
        self.inner.signals.deactivate();
        self.inner
            .state
            .store(LinkState::Deinit as u8, Ordering::Release);
        info!(
            dropped_frames = dropped,
            buffers_in_use = self.inner.buffers.in_use(),
            "spi transport deinitialized"
        );
        Ok(())
    }

    pub fn state(&self) -> LinkState {
        self.inner.state()
    }

    pub fn signal_state(&self) -> SignalState {
        self.inner.signals.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn capabilities(&self) -> &SlaveCapabilities {
        self.inner.startup.capabilities()
    }

    pub fn config(&self) -> &SpiConfig {
        &self.inner.config
    }

    pub fn is_throttling(&self) -> bool {
        self.inner.flow.is_throttling()
    }

    pub fn data_ready(&self) -> bool {
        self.inner.signals.data_ready_asserted()
    }

    /// Wire buffers currently checked out of the pool.
    pub fn buffers_in_use(&self) -> usize {
        self.inner.buffers.in_use()
    }

    /// Transaction descriptors currently checked out of the pool.
    pub fn descriptors_in_use(&self) -> usize {
        self.inner.descriptors.in_use()
    }
}

impl Drop for SpiTransport {
    fn drop(&mut self) {
        if self.inner.state() != LinkState::Deinit {
            if let Err(err) = self.deinit() {
                error!(error = %err, "deinit on drop failed");
            }
        }
    }
}

impl fmt::Debug for SpiTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpiTransport")
            .field("state", &self.inner.state())
            .field("signals", &self.inner.signals)
            .field("mux", &self.inner.mux)
            .field("buffers", &self.inner.buffers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use hostlink_frame::{Frame, FrameError};
    use hostlink_transport::{Line, SimBus, SimGpio, SimHost};

    use super::*;

    fn test_config() -> SpiConfig {
        SpiConfig {
            poll_interval_ms: 5,
            drain_timeout_ms: 20,
            ..SpiConfig::default()
        }
    }

    fn transport(config: SpiConfig) -> (SpiTransport, SimHost, Arc<SimBus>) {
        let bus = SimBus::new(config.bus_queue_size);
        let gpio = SimGpio::new();
        let transport = SpiTransport::new(config, bus.clone(), gpio.clone()).unwrap();
        (transport, SimHost::new(bus.clone(), gpio), bus)
    }

    #[test]
    fn new_rejects_invalid_config() {
        let mut config = test_config();
        config.tx_queues.bulk = 0;
        let bus = SimBus::new(3);
        let err = SpiTransport::new(config, bus, SimGpio::new()).unwrap_err();
        assert!(matches!(err, SpiError::InvalidConfig(_)));
    }

    #[test]
    fn nothing_is_armed_before_start() {
        let (transport, host, bus) = transport(test_config());
        assert_eq!(transport.state(), LinkState::Initialized);
        assert!(!bus.is_loaded());
        assert!(!host.handshake());
        assert!(!host.data_ready());
    }

    #[test]
    fn start_arms_startup_event_and_asserts_lines() {
        let (transport, host, bus) = transport(test_config());
        transport.start().unwrap();

        assert_eq!(transport.state(), LinkState::Active);
        assert!(bus.is_loaded());
        assert!(host.handshake());
        assert!(host.data_ready());
        assert_eq!(transport.signal_state(), SignalState::Ready);
        assert!(matches!(transport.start(), Err(SpiError::AlreadyStarted)));
    }

    #[test]
    fn submit_validates_before_queueing() {
        let (transport, _host, _bus) = transport(test_config());
        assert!(matches!(
            transport.submit_frame(InterfaceType::Station, 0, &[]),
            Err(SpiError::EmptyPayload)
        ));
        assert!(matches!(
            transport.submit_frame(InterfaceType::Station, 0, &[0; 2000]),
            Err(SpiError::Frame(FrameError::PayloadTooLarge { .. }))
        ));
        assert!(matches!(
            transport.submit_frame(InterfaceType::Max, 0, b"x"),
            Err(SpiError::Frame(FrameError::UnknownInterface(8)))
        ));
        assert_eq!(transport.buffers_in_use(), 0);
    }

    #[test]
    fn submit_raises_data_ready() {
        let (transport, host, _bus) = transport(test_config());
        transport
            .submit(&Frame::new(InterfaceType::Serial, &b"ping"[..]))
            .unwrap();
        assert!(host.data_ready());
        assert!(transport.data_ready());
        assert_eq!(transport.buffers_in_use(), 1);
    }

    #[test]
    fn deinit_is_idempotent_and_releases_everything() {
        let (transport, host, bus) = transport(test_config());
        transport.start().unwrap();
        transport
            .submit_frame(InterfaceType::Station, 0, b"queued")
            .unwrap();

        transport.deinit().unwrap();
        transport.deinit().unwrap();

        assert_eq!(transport.state(), LinkState::Deinit);
        assert!(!bus.is_loaded());
        assert!(!host.handshake());
        assert!(!host.data_ready());
        assert_eq!(transport.buffers_in_use(), 0);
        assert_eq!(transport.descriptors_in_use(), 0);
        assert!(matches!(
            transport.submit_frame(InterfaceType::Station, 0, b"late"),
            Err(SpiError::Inactive)
        ));
        assert!(matches!(transport.recv(), Err(SpiError::Inactive)));
        assert!(matches!(transport.start(), Err(SpiError::Inactive)));
    }

    #[test]
    fn deinit_before_start() {
        let (transport, _host, _bus) = transport(test_config());
        transport.deinit().unwrap();
        assert_eq!(transport.state(), LinkState::Deinit);
    }

    #[test]
    fn active_low_lines_idle_high() {
        let mut config = test_config();
        config.handshake.polarity = crate::config::Polarity::ActiveLow;
        config.data_ready.polarity = crate::config::Polarity::ActiveLow;
        let bus = SimBus::new(3);
        let gpio = SimGpio::new();
        let transport = SpiTransport::new(config, bus.clone(), gpio.clone()).unwrap();
        assert_eq!(gpio.level(Line::Handshake), hostlink_transport::Level::High);
        assert_eq!(gpio.level(Line::DataReady), hostlink_transport::Level::High);

        transport.start().unwrap();
        let host = SimHost::new(bus, gpio).with_active_levels(
            hostlink_transport::Level::Low,
            hostlink_transport::Level::Low,
        );
        assert!(host.handshake());
        assert!(host.data_ready());
    }
}
