use crate::stats::TransportStats;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest single raw-throughput payload the generator produces.
pub const RAW_TP_MAX_PAYLOAD: usize = 1460;

/// Test payload: a repeating byte ramp starting at `start`.
pub fn pattern(size: usize, start: u8) -> Vec<u8> {
    (0..size).map(|i| start.wrapping_add(i as u8)).collect()
}

/// Summary of one raw-throughput run in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTpReport {
    pub frames: u64,
    pub bytes: u64,
    /// Frames the generator could not queue.
    pub rejected: u64,
    pub elapsed_ms: u64,
    pub throughput_mbps: f64,
}

impl RawTpReport {
    pub fn new(frames: u64, bytes: u64, rejected: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let throughput_mbps = if secs > 0.0 {
            (bytes as f64 * 8.0) / secs / 1_000_000.0
        } else {
            0.0
        };
        Self {
            frames,
            bytes,
            rejected,
            elapsed_ms: elapsed.as_millis() as u64,
            throughput_mbps,
        }
    }

    /// Inbound raw-throughput traffic seen between two stats snapshots.
    pub fn inbound(before: &TransportStats, after: &TransportStats, elapsed: Duration) -> Self {
        Self::new(
            after.raw_tp_rx_frames.saturating_sub(before.raw_tp_rx_frames),
            after.raw_tp_rx_bytes.saturating_sub(before.raw_tp_rx_bytes),
            0,
            elapsed,
        )
    }
}
