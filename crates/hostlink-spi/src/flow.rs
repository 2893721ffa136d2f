//! Occupancy-driven throttling with hysteresis.

use std::sync::atomic::{AtomicBool, Ordering};

use hostlink_frame::Throttle;

/// Tracks whether the host should be told to back off.
///
/// Throttling starts when occupancy rises above `high` percent of capacity
/// and stops only when it falls below `low` percent. With `high == 0` it
/// never starts.
#[derive(Debug)]
pub struct FlowControl {
    high_percent: u8,
    low_percent: u8,
    throttling: AtomicBool,
}

impl FlowControl {
    pub fn new(high_percent: u8, low_percent: u8) -> Self {
        Self {
            high_percent,
            low_percent,
            throttling: AtomicBool::new(false),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.high_percent != 0
    }

    pub fn is_throttling(&self) -> bool {
        self.throttling.load(Ordering::Acquire)
    }

    /// Value to stamp into outgoing headers.
    pub fn throttle(&self) -> Throttle {
        if self.is_throttling() {
            Throttle::On
        } else {
            Throttle::Off
        }
    }

    /// Feed the current occupancy. Returns the new state if it changed.
    pub fn update(&self, occupied: usize, capacity: usize) -> Option<bool> {
        if !self.is_enabled() || capacity == 0 {
            return None;
        }
        let scaled = occupied * 100;
        if scaled > usize::from(self.high_percent) * capacity {
            self.transition(true)
        } else if scaled < usize::from(self.low_percent) * capacity {
            self.transition(false)
        } else {
            None
        }
    }

    fn transition(&self, on: bool) -> Option<bool> {
        let was = self.throttling.swap(on, Ordering::AcqRel);
        (was != on).then_some(on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hysteresis_band_holds_state() {
        let flow = FlowControl::new(80, 20);
        assert_eq!(flow.update(0, 20), None);
        assert_eq!(flow.update(16, 20), None); // exactly 80%
        assert!(!flow.is_throttling());

        assert_eq!(flow.update(17, 20), Some(true)); // 85%
        assert_eq!(flow.throttle(), Throttle::On);

        assert_eq!(flow.update(5, 20), None); // 25%
        assert!(flow.is_throttling());

        assert_eq!(flow.update(3, 20), Some(false)); // 15%
        assert_eq!(flow.throttle(), Throttle::Off);
    }

    #[test]
    fn repeated_updates_report_one_transition() {
        let flow = FlowControl::new(50, 10);
        assert_eq!(flow.update(9, 10), Some(true));
        assert_eq!(flow.update(10, 10), None);
        assert_eq!(flow.update(0, 10), Some(false));
        assert_eq!(flow.update(0, 10), None);
    }

    #[test]
    fn disabled_never_throttles() {
        let flow = FlowControl::disabled();
        assert_eq!(flow.update(100, 100), None);
        assert_eq!(flow.throttle(), Throttle::Off);
        assert!(!flow.is_enabled());
    }
}
