use serde::{Deserialize, Serialize};

// Default rates are zero: faults only happen when a test or the simulator
// asks for them.
const DEFAULT_SEND_FAILURE_PERCENT: f32 = 0.0;
const DEFAULT_DROP_PERCENT: f32 = 0.0;
const DEFAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// A fault applied to one bus transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusFault {
    /// The driver reports an I/O error and nothing reaches the far end.
    FailSend,
    /// The driver reports success but the frame is lost on the wire.
    Drop,
}

/// Configuration for bus fault injection behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusFaultConfig {
    pub enabled: bool,
    pub send_failure_percent: f32,
    pub drop_percent: f32,
    pub seed: u64,
}

impl Default for BusFaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            send_failure_percent: DEFAULT_SEND_FAILURE_PERCENT,
            drop_percent: DEFAULT_DROP_PERCENT,
            seed: DEFAULT_SEED,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusFaultStats {
    pub transfers_seen: u64,
    pub send_failures_injected: u64,
    pub drops_injected: u64,
}

/// Deterministic per-transfer fault source for the loopback bus.
#[derive(Debug)]
pub struct BusFaultInjector {
    config: BusFaultConfig,
    stats: BusFaultStats,
    rng_state: u64,
}

impl BusFaultInjector {
    pub fn new(config: BusFaultConfig) -> Self {
        let rng_state = config.seed;
        Self {
            config,
            stats: BusFaultStats::default(),
            rng_state,
        }
    }

    /// Decide the fate of the next transfer.
    pub fn next_fault(&mut self) -> Option<BusFault> {
        if !self.config.enabled {
            return None;
        }
        self.stats.transfers_seen += 1;

        if self.roll(self.config.send_failure_percent) {
            self.stats.send_failures_injected += 1;
            return Some(BusFault::FailSend);
        }
        if self.roll(self.config.drop_percent) {
            self.stats.drops_injected += 1;
            return Some(BusFault::Drop);
        }
        None
    }

    pub fn get_stats(&self) -> &BusFaultStats {
        &self.stats
    }

    pub fn get_config(&self) -> &BusFaultConfig {
        &self.config
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }

    fn roll(&mut self, rate_percent: f32) -> bool {
        if rate_percent <= 0.0 {
            return false;
        }
        if rate_percent >= 100.0 {
            return true;
        }
        self.random_float() < rate_percent / 100.0
    }

    fn next_random(&mut self) -> u64 {
        // Linear Congruential Generator: X(n+1) = (aX(n) + c) mod m
        self.rng_state = self.rng_state.wrapping_mul(1664525).wrapping_add(1013904223);
        self.rng_state
    }

    fn random_float(&mut self) -> f32 {
        (self.next_random() as f32) / (u64::MAX as f32)
    }
}

impl Default for BusFaultInjector {
    fn default() -> Self {
        Self::new(BusFaultConfig::default())
    }
}
