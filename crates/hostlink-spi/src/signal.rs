//! Handshake and DataReady line control.
//!
//! Handshake tells the host a transaction is armed. It rises when the bus
//! driver reports a transaction loaded and falls either when the transaction
//! completes or when chip-select is released, per [`DeassertPolicy`]. It
//! always falls as soon as the host asserts chip-select.
//!
//! DataReady tells the host real frames are waiting. It is latched so the
//! line is only written on a change.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use hostlink_transport::{BusEvents, Edge, Gpio, Level, Line};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{DeassertPolicy, Polarity, SpiConfig};
use crate::error::Result;

/// Handshake state as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalState {
    /// Handshake unasserted; nothing armed.
    Inactive = 0,
    /// Handshake asserted; a transaction is armed.
    Ready = 1,
    /// The host is clocking the armed transaction.
    Transacting = 2,
}

impl SignalState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SignalState::Ready,
            2 => SignalState::Transacting,
            _ => SignalState::Inactive,
        }
    }
}

/// Drives the two output lines and watches chip-select.
pub struct Signals {
    gpio: Arc<dyn Gpio>,
    handshake: Polarity,
    data_ready: Polarity,
    policy: DeassertPolicy,
    state: AtomicU8,
    data_ready_latch: Mutex<bool>,
    cs_released_tx: Sender<()>,
    cs_released_rx: Receiver<()>,
}

impl Signals {
    pub fn new(gpio: Arc<dyn Gpio>, config: &SpiConfig) -> Arc<Self> {
        let (cs_released_tx, cs_released_rx) = crossbeam_channel::bounded(1);
        Arc::new(Self {
            gpio,
            handshake: config.handshake.polarity,
            data_ready: config.data_ready.polarity,
            policy: config.deassert_policy,
            state: AtomicU8::new(SignalState::Inactive as u8),
            data_ready_latch: Mutex::new(false),
            cs_released_tx,
            cs_released_rx,
        })
    }

    /// Drive both lines inactive and hook the chip-select interrupt.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        self.gpio
            .set_level(Line::Handshake, self.handshake.inactive());
        self.gpio
            .set_level(Line::DataReady, self.data_ready.inactive());
        *self.data_ready_latch.lock() = false;
        self.set_state(SignalState::Inactive);
        while self.cs_released_rx.try_recv().is_ok() {}

        let weak = Arc::downgrade(self);
        self.gpio.configure_interrupt(
            Line::ChipSelect,
            Edge::Any,
            Box::new(move |level| {
                if let Some(signals) = weak.upgrade() {
                    signals.on_chip_select(level);
                }
            }),
        )?;
        debug!(
            handshake = ?self.handshake,
            data_ready = ?self.data_ready,
            policy = ?self.policy,
            "signals initialized"
        );
        Ok(())
    }

    /// Drop both lines for teardown.
    pub fn deactivate(&self) {
        self.deassert_handshake();
        self.set_state(SignalState::Inactive);
        self.set_data_ready(false);
    }

    pub fn state(&self) -> SignalState {
        SignalState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn policy(&self) -> DeassertPolicy {
        self.policy
    }

    pub fn handshake_asserted(&self) -> bool {
        self.gpio.level(Line::Handshake) == self.handshake.active()
    }

    pub fn data_ready_asserted(&self) -> bool {
        *self.data_ready_latch.lock()
    }

    /// Drive DataReady if the latched value differs.
    pub fn set_data_ready(&self, asserted: bool) {
        let mut latch = self.data_ready_latch.lock();
        if *latch != asserted {
            *latch = asserted;
            self.gpio
                .set_level(Line::DataReady, self.data_ready.level(asserted));
            trace!(asserted, "data ready");
        }
    }

    /// Wait until chip-select has been released after a transfer.
    /// Returns `false` if `timeout` passes first.
    pub fn wait_chip_select_released(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.cs_released_rx.recv_timeout(remaining).is_err() {
                return false;
            }
            // Stale release from a select with no transfer.
            if self.gpio.level(Line::ChipSelect) == Level::High {
                return true;
            }
        }
    }

    fn assert_handshake(&self) {
        self.gpio
            .set_level(Line::Handshake, self.handshake.active());
    }

    fn deassert_handshake(&self) {
        self.gpio
            .set_level(Line::Handshake, self.handshake.inactive());
    }

    fn set_state(&self, state: SignalState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn on_chip_select(&self, level: Level) {
        match level {
            Level::Low => {
                self.deassert_handshake();
                self.set_state(SignalState::Transacting);
                trace!("chip-select asserted");
            }
            Level::High => {
                if self.policy == DeassertPolicy::OnChipSelect {
                    if self.state() == SignalState::Transacting {
                        self.set_state(SignalState::Inactive);
                    }
                    let _ = self.cs_released_tx.try_send(());
                }
                trace!("chip-select released");
            }
        }
    }
}

impl BusEvents for Signals {
    fn transaction_ready(&self) {
        self.assert_handshake();
        self.set_state(SignalState::Ready);
    }

    fn transaction_done(&self) {
        match self.policy {
            DeassertPolicy::OnTransactionEnd => {
                self.deassert_handshake();
                self.set_state(SignalState::Inactive);
            }
            DeassertPolicy::OnChipSelect => self.set_state(SignalState::Transacting),
        }
    }
}

impl fmt::Debug for Signals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signals")
            .field("state", &self.state())
            .field("policy", &self.policy)
            .field("data_ready", &self.data_ready_asserted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use hostlink_transport::SimGpio;

    use super::*;

    fn signals(config: &SpiConfig) -> (Arc<SimGpio>, Arc<Signals>) {
        let gpio = SimGpio::new();
        let signals = Signals::new(gpio.clone(), config);
        signals.init().unwrap();
        (gpio, signals)
    }

    #[test]
    fn init_drives_lines_inactive_for_polarity() {
        let mut config = SpiConfig::default();
        config.handshake.polarity = Polarity::ActiveLow;
        let (gpio, signals) = signals(&config);

        assert_eq!(gpio.level(Line::Handshake), Level::High);
        assert_eq!(gpio.level(Line::DataReady), Level::Low);
        assert!(!signals.handshake_asserted());
        assert_eq!(signals.state(), SignalState::Inactive);
    }

    #[test]
    fn handshake_follows_transaction_lifecycle() {
        let (gpio, signals) = signals(&SpiConfig::default());

        signals.transaction_ready();
        assert_eq!(gpio.level(Line::Handshake), Level::High);
        assert_eq!(signals.state(), SignalState::Ready);

        signals.transaction_done();
        assert_eq!(gpio.level(Line::Handshake), Level::Low);
        assert_eq!(signals.state(), SignalState::Inactive);
    }

    #[test]
    fn chip_select_assert_drops_handshake() {
        let (gpio, signals) = signals(&SpiConfig::default());
        signals.transaction_ready();

        gpio.drive(Line::ChipSelect, Level::Low);
        assert!(!signals.handshake_asserted());
        assert_eq!(signals.state(), SignalState::Transacting);
    }

    #[test]
    fn deferred_policy_waits_for_chip_select_release() {
        let config = SpiConfig {
            deassert_policy: DeassertPolicy::OnChipSelect,
            ..SpiConfig::default()
        };
        let (gpio, signals) = signals(&config);
        signals.transaction_ready();
        gpio.drive(Line::ChipSelect, Level::Low);
        signals.transaction_done();
        assert_eq!(signals.state(), SignalState::Transacting);
        assert!(!signals.wait_chip_select_released(Duration::from_millis(10)));

        gpio.drive(Line::ChipSelect, Level::High);
        assert!(signals.wait_chip_select_released(Duration::from_millis(100)));
        assert_eq!(signals.state(), SignalState::Inactive);
    }

    #[test]
    fn immediate_policy_never_signals_release() {
        let (gpio, signals) = signals(&SpiConfig::default());
        gpio.drive(Line::ChipSelect, Level::Low);
        gpio.drive(Line::ChipSelect, Level::High);
        assert!(!signals.wait_chip_select_released(Duration::from_millis(10)));
    }

    #[test]
    fn data_ready_is_latched() {
        let mut config = SpiConfig::default();
        config.data_ready.polarity = Polarity::ActiveLow;
        let (gpio, signals) = signals(&config);
        let initial = gpio.transitions(Line::DataReady);

        signals.set_data_ready(true);
        signals.set_data_ready(true);
        assert_eq!(gpio.level(Line::DataReady), Level::Low);
        assert_eq!(gpio.transitions(Line::DataReady), initial + 1);

        signals.set_data_ready(false);
        signals.set_data_ready(false);
        assert_eq!(gpio.level(Line::DataReady), Level::High);
        assert_eq!(gpio.transitions(Line::DataReady), initial + 2);
    }
}
