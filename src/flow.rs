use crate::buffer::InterfaceType;
use crate::frame::ThrottleCommand;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use tracing::debug;

pub const DEFAULT_THROTTLE_HIGH_THRESHOLD: u8 = 80;
pub const DEFAULT_THROTTLE_LOW_THRESHOLD: u8 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub throttled: bool,
    pub commanded: bool,
    pub watermark: bool,
    pub last_queue_load: u8,
    pub transitions: u64,
}

/// Shared throttle indicator. Written from slave events on the RX side,
/// read by the TX pump before every send.
///
/// Two inputs are OR-ed: the explicit command in inbound frame headers and
/// the high/low watermark on the slave's reported queue load.
#[derive(Debug)]
pub struct FlowControl {
    commanded: AtomicBool,
    watermark: AtomicBool,
    high: u8,
    low: u8,
    last_load: AtomicU8,
    transitions: AtomicU64,
}

impl FlowControl {
    pub fn new(high_threshold: u8, low_threshold: u8) -> Self {
        Self {
            commanded: AtomicBool::new(false),
            watermark: AtomicBool::new(false),
            high: high_threshold,
            low: low_threshold,
            last_load: AtomicU8::new(0),
            transitions: AtomicU64::new(0),
        }
    }

    pub fn is_throttled(&self) -> bool {
        self.commanded.load(Ordering::Acquire) || self.watermark.load(Ordering::Acquire)
    }

    /// Whether traffic on `if_type` must wait. Control traffic is never held.
    pub fn holds(&self, if_type: InterfaceType) -> bool {
        if_type.is_data() && self.is_throttled()
    }

    pub fn apply_command(&self, command: ThrottleCommand) {
        let on = match command {
            ThrottleCommand::NoChange => return,
            ThrottleCommand::On => true,
            ThrottleCommand::Off => false,
        };
        self.set(&self.commanded, on, "header");
    }

    pub fn report_queue_load(&self, percent: u8) {
        self.last_load.store(percent, Ordering::Relaxed);
        if percent >= self.high {
            self.set(&self.watermark, true, "watermark");
        } else if percent <= self.low {
            self.set(&self.watermark, false, "watermark");
        }
    }

    /// Clear both inputs, e.g. when the link is re-established.
    pub fn reset(&self) {
        self.commanded.store(false, Ordering::Release);
        self.watermark.store(false, Ordering::Release);
        self.last_load.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            throttled: self.is_throttled(),
            commanded: self.commanded.load(Ordering::Acquire),
            watermark: self.watermark.load(Ordering::Acquire),
            last_queue_load: self.last_load.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
        }
    }

    fn set(&self, input: &AtomicBool, on: bool, source: &'static str) {
        let before = self.is_throttled();
        if input.swap(on, Ordering::AcqRel) != on {
            let after = self.is_throttled();
            if before != after {
                self.transitions.fetch_add(1, Ordering::Relaxed);
                debug!(source, throttled = after, "flow control changed");
            }
        }
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_HIGH_THRESHOLD, DEFAULT_THROTTLE_LOW_THRESHOLD)
    }
}
