#![allow(dead_code)]

use hostlink::bus::{Bus, BusKind, LoopbackBus};
use hostlink::sim::{SimulatedSlave, SlaveHandle, SlaveProfile};
use hostlink::{Transport, TransportConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Harness {
    pub transport: Transport,
    pub bus: Arc<LoopbackBus>,
    pub slave: SlaveHandle,
}

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> TransportConfig {
    TransportConfig {
        handshake_timeout_ms: 1000,
        power_save_ack_timeout_ms: 200,
        receive_timeout_ms: 10,
        pump_wait_timeout_ms: Some(20),
        ..TransportConfig::default()
    }
}

pub fn harness_with(kind: BusKind, config: TransportConfig, profile: SlaveProfile) -> Harness {
    let (bus, slave_end) = LoopbackBus::pair(kind);
    let bus = Arc::new(bus);
    let slave = SimulatedSlave::spawn(slave_end, profile);
    let transport = Transport::new(Arc::clone(&bus) as Arc<dyn Bus>, config);
    Harness { transport, bus, slave }
}

pub fn harness() -> Harness {
    harness_with(BusKind::Spi, fast_config(), SlaveProfile::for_bus(BusKind::Spi))
}

/// A harness whose transport has completed setup.
pub async fn connected() -> Harness {
    let h = harness();
    h.transport.setup(|_| {}).await.expect("setup");
    h
}

pub async fn wait_until<F>(timeout_ms: u64, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Counter bumped by a release callback.
pub fn release_counter() -> (Arc<AtomicUsize>, impl FnOnce(hostlink::OwnerToken) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let hook = Arc::clone(&count);
    (count, move |_| {
        hook.fetch_add(1, Ordering::SeqCst);
    })
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}
