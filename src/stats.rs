use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! link_counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Live link counters, shared by the pumps and the lifecycle
        /// controller. Survive teardown so a caller can inspect a dead link.
        #[derive(Debug, Default)]
        pub struct LinkStats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`LinkStats`].
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct TransportStats {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl LinkStats {
            pub fn snapshot(&self) -> TransportStats {
                TransportStats {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

link_counters! {
    /// Buffers accepted into the outbound bank.
    tx_queued,
    tx_sent,
    tx_bytes,
    tx_send_errors,
    /// Sends rejected because their outbound queue was full.
    tx_queue_full,
    tx_throttle_requeues,
    /// Data buffers discarded after exhausting throttle retries.
    tx_throttle_drops,
    rx_frames,
    rx_bytes,
    rx_bad_frames,
    rx_queue_full,
    rx_dispatched,
    rx_no_channel,
    rx_priv,
    rx_priv_unexpected,
    /// Zero-length frames that only carried a throttle command.
    rx_flow_only,
    rx_bus_errors,
    raw_tp_tx_frames,
    raw_tp_rx_frames,
    raw_tp_rx_bytes,
    power_save_timeouts,
    buffers_created,
    buffers_released,
}

pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, amount: u64) {
    counter.fetch_add(amount, Ordering::Relaxed);
}

impl TransportStats {
    /// Buffers the link layer created but has not released yet.
    pub fn buffers_outstanding(&self) -> u64 {
        self.buffers_created.saturating_sub(self.buffers_released)
    }
}
