//! One-shot capability announcement.
//!
//! The first frame the host reads after activation is a private INIT event
//! describing the slave. It is built once and never resent.

use std::sync::atomic::{AtomicBool, Ordering};

use hostlink_frame::{Frame, SlaveCapabilities};

#[derive(Debug)]
pub struct Startup {
    capabilities: SlaveCapabilities,
    sent: AtomicBool,
}

impl Startup {
    pub fn new(capabilities: SlaveCapabilities) -> Self {
        Self {
            capabilities,
            sent: AtomicBool::new(false),
        }
    }

    pub fn capabilities(&self) -> &SlaveCapabilities {
        &self.capabilities
    }

    /// Whether the event has been handed out.
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    /// The INIT event frame, the first time only.
    pub fn take_frame(&self, seq_num: u16) -> Option<Frame> {
        if self.sent.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(self.capabilities.to_frame().with_seq_num(seq_num))
    }
}
