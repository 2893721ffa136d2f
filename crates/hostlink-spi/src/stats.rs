//! Packet counters.

use std::sync::atomic::{AtomicU64, Ordering};

use hostlink_frame::Priority;
use serde::Serialize;

/// Live counters, updated from the worker and producer contexts.
#[derive(Debug, Default)]
pub struct Stats {
    tx_frames: [AtomicU64; 3],
    tx_dummy: AtomicU64,
    tx_queue_full: AtomicU64,
    rx_frames: [AtomicU64; 3],
    rx_dummy: AtomicU64,
    drop_checksum: AtomicU64,
    drop_malformed: AtomicU64,
    drop_overrun: AtomicU64,
    throttle_on: AtomicU64,
    throttle_off: AtomicU64,
    pool_exhausted: AtomicU64,
    bus_failures: AtomicU64,
    power_save_events: AtomicU64,
}

/// Why a received buffer was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Checksum,
    Malformed,
    Overrun,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl Stats {
    pub fn frame_sent(&self, priority: Priority) {
        bump(&self.tx_frames[priority.index()]);
    }

    pub fn dummy_sent(&self) {
        bump(&self.tx_dummy);
    }

    pub fn tx_queue_full(&self) {
        bump(&self.tx_queue_full);
    }

    pub fn frame_received(&self, priority: Priority) {
        bump(&self.rx_frames[priority.index()]);
    }

    pub fn dummy_received(&self) {
        bump(&self.rx_dummy);
    }

    pub fn dropped(&self, reason: DropReason) {
        bump(match reason {
            DropReason::Checksum => &self.drop_checksum,
            DropReason::Malformed => &self.drop_malformed,
            DropReason::Overrun => &self.drop_overrun,
        });
    }

    pub fn throttle_changed(&self, on: bool) {
        bump(if on { &self.throttle_on } else { &self.throttle_off });
    }

    pub fn pool_exhausted(&self) {
        bump(&self.pool_exhausted);
    }

    pub fn bus_failure(&self) {
        bump(&self.bus_failures);
    }

    pub fn power_save_event(&self) {
        bump(&self.power_save_events);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx: PerPriority::read(&self.tx_frames),
            tx_dummy: read(&self.tx_dummy),
            tx_queue_full: read(&self.tx_queue_full),
            rx: PerPriority::read(&self.rx_frames),
            rx_dummy: read(&self.rx_dummy),
            dropped: Drops {
                checksum: read(&self.drop_checksum),
                malformed: read(&self.drop_malformed),
                overrun: read(&self.drop_overrun),
            },
            throttle_on: read(&self.throttle_on),
            throttle_off: read(&self.throttle_off),
            pool_exhausted: read(&self.pool_exhausted),
            bus_failures: read(&self.bus_failures),
            power_save_events: read(&self.power_save_events),
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Real frames clocked out to the host.
    pub tx: PerPriority,
    pub tx_dummy: u64,
    /// Submissions refused because their queue was full.
    pub tx_queue_full: u64,
    /// Frames delivered to RX queues.
    pub rx: PerPriority,
    pub rx_dummy: u64,
    pub dropped: Drops,
    pub throttle_on: u64,
    pub throttle_off: u64,
    pub pool_exhausted: u64,
    pub bus_failures: u64,
    pub power_save_events: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PerPriority {
    pub control: u64,
    pub voice: u64,
    pub bulk: u64,
}

impl PerPriority {
    fn read(counters: &[AtomicU64; 3]) -> Self {
        Self {
            control: read(&counters[Priority::Control.index()]),
            voice: read(&counters[Priority::Voice.index()]),
            bulk: read(&counters[Priority::Bulk.index()]),
        }
    }

    pub fn get(&self, priority: Priority) -> u64 {
        match priority {
            Priority::Control => self.control,
            Priority::Voice => self.voice,
            Priority::Bulk => self.bulk,
        }
    }

    pub fn total(&self) -> u64 {
        self.control + self.voice + self.bulk
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Drops {
    pub checksum: u64,
    pub malformed: u64,
    pub overrun: u64,
}
