//! Runtime configuration for the SPI transport.
//!
//! Every variant the slave supports (line polarity, handshake deassertion
//! policy, checksum on/off, queue depths) is a field here and is chosen when
//! the transport is built.

use std::path::Path;
use std::time::Duration;

use hostlink_frame::event::cap;
use hostlink_frame::{FirmwareVersion, FrameConfig, Priority, SlaveCapabilities};
use hostlink_transport::Level;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SpiError};

/// Firmware version advertised when none is configured.
pub const DEFAULT_FIRMWARE_VERSION: FirmwareVersion = FirmwareVersion {
    major: 0,
    minor: 1,
    patch: 0,
};

/// Which level means "asserted" on an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    #[default]
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    pub fn active(self) -> Level {
        match self {
            Polarity::ActiveHigh => Level::High,
            Polarity::ActiveLow => Level::Low,
        }
    }

    pub fn inactive(self) -> Level {
        match self {
            Polarity::ActiveHigh => Level::Low,
            Polarity::ActiveLow => Level::High,
        }
    }

    pub fn level(self, asserted: bool) -> Level {
        if asserted {
            self.active()
        } else {
            self.inactive()
        }
    }
}

/// Settings for one output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfig {
    pub polarity: Polarity,
}

/// When Handshake drops after a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeassertPolicy {
    /// As soon as the bus driver reports the transaction complete.
    #[default]
    OnTransactionEnd,
    /// Once chip-select is released. The next transaction is armed only
    /// after the release is observed.
    OnChipSelect,
}

/// Depth of each priority queue in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDepths {
    pub control: usize,
    pub voice: usize,
    pub bulk: usize,
}

impl Default for QueueDepths {
    fn default() -> Self {
        Self {
            control: 20,
            voice: 20,
            bulk: 20,
        }
    }
}

impl QueueDepths {
    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::Control => self.control,
            Priority::Voice => self.voice,
            Priority::Bulk => self.bulk,
        }
    }

    pub fn total(&self) -> usize {
        self.control + self.voice + self.bulk
    }
}

/// Inputs for the capability record sent at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub chip_id: u8,
    /// Advertise WLAN over SPI.
    pub wlan: bool,
    /// Advertise Bluetooth over SPI.
    pub bluetooth: bool,
    /// Raw throughput test mode advertised to the host.
    pub raw_tp_test: u8,
    pub extended_capabilities: Option<u32>,
    pub firmware_version: FirmwareVersion,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            chip_id: 0,
            wlan: true,
            bluetooth: true,
            raw_tp_test: 0,
            extended_capabilities: None,
            firmware_version: DEFAULT_FIRMWARE_VERSION,
        }
    }
}

/// Configuration for [`SpiTransport`](crate::SpiTransport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpiConfig {
    pub frame: FrameConfig,
    pub tx_queues: QueueDepths,
    pub rx_queues: QueueDepths,
    /// Transactions the bus driver can hold. Sizes the pools.
    pub bus_queue_size: usize,
    /// Bulk RX occupancy (percent) above which throttling starts. 0 disables.
    pub throttle_high_percent: u8,
    /// Bulk RX occupancy (percent) below which throttling stops.
    pub throttle_low_percent: u8,
    pub handshake: LineConfig,
    pub data_ready: LineConfig,
    pub deassert_policy: DeassertPolicy,
    /// How long a producer may wait on a full bulk TX queue. 0 fails at once.
    pub tx_block_timeout_ms: u64,
    /// How long the worker may wait on a full bulk RX queue before dropping.
    pub rx_block_timeout_ms: u64,
    /// Worker wake-up interval for retries and cancellation.
    pub poll_interval_ms: u64,
    /// How long teardown waits for the in-flight transaction.
    pub drain_timeout_ms: u64,
    pub capabilities: CapabilityConfig,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            tx_queues: QueueDepths::default(),
            rx_queues: QueueDepths::default(),
            bus_queue_size: 3,
            throttle_high_percent: 80,
            throttle_low_percent: 60,
            handshake: LineConfig::default(),
            data_ready: LineConfig::default(),
            deassert_policy: DeassertPolicy::OnTransactionEnd,
            tx_block_timeout_ms: 0,
            rx_block_timeout_ms: 100,
            poll_interval_ms: 50,
            drain_timeout_ms: 500,
            capabilities: CapabilityConfig::default(),
        }
    }
}

impl SpiConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SpiConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read [`from_json`](Self::from_json) input from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| {
            SpiError::InvalidConfig(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.frame.validate().map_err(SpiError::InvalidConfig)?;

        for (direction, depths) in [("tx", &self.tx_queues), ("rx", &self.rx_queues)] {
            for priority in Priority::ALL {
                if depths.get(priority) == 0 {
                    return Err(SpiError::InvalidConfig(format!(
                        "{direction} {priority} queue depth must be non-zero"
                    )));
                }
            }
        }
        if self.bus_queue_size == 0 {
            return Err(SpiError::InvalidConfig(
                "bus_queue_size must be non-zero".into(),
            ));
        }
        if self.throttle_high_percent > 100 {
            return Err(SpiError::InvalidConfig(format!(
                "throttle_high_percent must be at most 100 (got {})",
                self.throttle_high_percent
            )));
        }
        if self.throttle_high_percent != 0 && self.throttle_low_percent >= self.throttle_high_percent
        {
            return Err(SpiError::InvalidConfig(format!(
                "throttle_low_percent ({}) must be below throttle_high_percent ({})",
                self.throttle_low_percent, self.throttle_high_percent
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(SpiError::InvalidConfig(
                "poll_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Blocks in the wire buffer pool: every queue slot in both directions,
    /// a TX and RX buffer per bus slot, and one spare.
    pub fn buffer_blocks(&self) -> usize {
        self.tx_queues.total() + self.rx_queues.total() + self.bus_queue_size * 2 + 1
    }

    /// Blocks in the transaction descriptor pool.
    pub fn descriptor_blocks(&self) -> usize {
        self.bus_queue_size + 1
    }

    pub fn tx_block_timeout(&self) -> Duration {
        Duration::from_millis(self.tx_block_timeout_ms)
    }

    pub fn rx_block_timeout(&self) -> Duration {
        Duration::from_millis(self.rx_block_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// The record advertised to the host at startup.
    pub fn slave_capabilities(&self) -> SlaveCapabilities {
        let caps = &self.capabilities;
        let mut bits = 0;
        if caps.wlan {
            bits |= cap::WLAN_SPI;
        }
        if caps.bluetooth {
            bits |= cap::BT_SPI;
        }
        if self.frame.checksum {
            bits |= cap::CHECKSUM_ENABLED;
        }
        SlaveCapabilities {
            chip_id: caps.chip_id,
            capabilities: bits,
            extended_capabilities: caps.extended_capabilities,
            raw_tp_test: caps.raw_tp_test,
            rx_queue_size: saturate(self.rx_queues.bulk),
            tx_queue_size: saturate(self.tx_queues.bulk),
            firmware_version: caps.firmware_version,
        }
    }
}

fn saturate(depth: usize) -> u8 {
    u8::try_from(depth).unwrap_or(u8::MAX)
}
