//! In-memory bus pair. The host end implements [`Bus`]; the [`SlaveEnd`]
//! is driven by a simulated slave or directly by tests.

use super::{Bus, BusError, BusFault, BusFaultInjector, BusFuture, BusKind};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::trace;

const LOOPBACK_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameDirection {
    HostToSlave,
    SlaveToHost,
}

/// One frame as it crossed the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedFrame {
    pub index: u64,
    pub direction: FrameDirection,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct Capture {
    frames: Mutex<Vec<CapturedFrame>>,
    next_index: AtomicU64,
}

impl Capture {
    fn record(&self, direction: FrameDirection, bytes: &[u8]) {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CapturedFrame {
                index,
                direction,
                bytes: bytes.to_vec(),
            });
    }

    fn snapshot(&self, direction: Option<FrameDirection>) -> Vec<CapturedFrame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|f| direction.map_or(true, |d| f.direction == d))
            .cloned()
            .collect()
    }
}

/// Host side of an in-memory bus.
pub struct LoopbackBus {
    kind: BusKind,
    to_slave: mpsc::Sender<Vec<u8>>,
    from_slave: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    initialized: AtomicBool,
    ready: AtomicBool,
    not_ready_polls: AtomicU32,
    capture: Arc<Capture>,
    faults: Mutex<Option<BusFaultInjector>>,
    init_count: AtomicU32,
    deinit_count: AtomicU32,
}

/// Slave side of an in-memory bus.
pub struct SlaveEnd {
    kind: BusKind,
    from_host: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    to_host: mpsc::Sender<Vec<u8>>,
    capture: Arc<Capture>,
}

impl LoopbackBus {
    pub fn pair(kind: BusKind) -> (LoopbackBus, SlaveEnd) {
        let (to_slave, from_host) = mpsc::channel(LOOPBACK_CHANNEL_DEPTH);
        let (to_host, from_slave) = mpsc::channel(LOOPBACK_CHANNEL_DEPTH);
        let capture = Arc::new(Capture::default());

        let host = LoopbackBus {
            kind,
            to_slave,
            from_slave: AsyncMutex::new(from_slave),
            initialized: AtomicBool::new(false),
            ready: AtomicBool::new(true),
            not_ready_polls: AtomicU32::new(0),
            capture: Arc::clone(&capture),
            faults: Mutex::new(None),
            init_count: AtomicU32::new(0),
            deinit_count: AtomicU32::new(0),
        };
        let slave = SlaveEnd {
            kind,
            from_host: AsyncMutex::new(from_host),
            to_host,
            capture,
        };
        (host, slave)
    }

    /// Force readiness on or off.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Report not-ready for the next `polls` readiness queries.
    pub fn ready_after_polls(&self, polls: u32) {
        self.not_ready_polls.store(polls, Ordering::SeqCst);
    }

    pub fn set_fault_injector(&self, injector: Option<BusFaultInjector>) {
        *self.faults.lock().unwrap_or_else(PoisonError::into_inner) = injector;
    }

    pub fn captured(&self, direction: Option<FrameDirection>) -> Vec<CapturedFrame> {
        self.capture.snapshot(direction)
    }

    pub fn init_count(&self) -> u32 {
        self.init_count.load(Ordering::SeqCst)
    }

    pub fn deinit_count(&self) -> u32 {
        self.deinit_count.load(Ordering::SeqCst)
    }

    fn next_fault(&self) -> Option<BusFault> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .and_then(BusFaultInjector::next_fault)
    }
}

impl Bus for LoopbackBus {
    fn kind(&self) -> BusKind {
        self.kind
    }

    fn init(&self) -> BusFuture<'_, Result<(), BusError>> {
        Box::pin(async move {
            self.initialized.store(true, Ordering::SeqCst);
            self.init_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn deinit(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            self.initialized.store(false, Ordering::SeqCst);
            self.deinit_count.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn send<'a>(&'a self, frame: &'a [u8]) -> BusFuture<'a, Result<usize, BusError>> {
        Box::pin(async move {
            if !self.initialized.load(Ordering::SeqCst) {
                return Err(BusError::NotReady);
            }
            let max = self.max_frame_size();
            if frame.len() > max {
                return Err(BusError::FrameTooLarge { len: frame.len(), max });
            }

            match self.next_fault() {
                Some(BusFault::FailSend) => {
                    return Err(BusError::Io("injected send failure".into()));
                }
                Some(BusFault::Drop) => {
                    trace!(len = frame.len(), "loopback frame dropped");
                    return Ok(frame.len());
                }
                None => {}
            }

            self.capture.record(FrameDirection::HostToSlave, frame);
            self.to_slave
                .send(frame.to_vec())
                .await
                .map_err(|_| BusError::Disconnected)?;
            Ok(frame.len())
        })
    }

    fn receive<'a>(
        &'a self,
        buf: &'a mut [u8],
        timeout: Duration,
    ) -> BusFuture<'a, Result<usize, BusError>> {
        Box::pin(async move {
            let mut rx = self.from_slave.lock().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Err(_) => Ok(0),
                Ok(None) => Err(BusError::Disconnected),
                Ok(Some(frame)) => {
                    if frame.len() > buf.len() {
                        return Err(BusError::FrameTooLarge {
                            len: frame.len(),
                            max: buf.len(),
                        });
                    }
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(frame.len())
                }
            }
        })
    }

    fn is_tx_ready(&self) -> bool {
        let pending = self
            .not_ready_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return false;
        }
        self.initialized.load(Ordering::SeqCst) && self.ready.load(Ordering::SeqCst)
    }

    fn is_rx_ready(&self) -> bool {
        self.initialized.load(Ordering::SeqCst) && self.ready.load(Ordering::SeqCst)
    }
}

impl SlaveEnd {
    pub fn kind(&self) -> BusKind {
        self.kind
    }

    /// Next frame written by the host, or `None` once the host end is gone.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.from_host.lock().await.recv().await
    }

    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Deliver a frame to the host.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), BusError> {
        self.capture.record(FrameDirection::SlaveToHost, &frame);
        self.to_host
            .send(frame)
            .await
            .map_err(|_| BusError::Disconnected)
    }

    pub fn captured(&self, direction: Option<FrameDirection>) -> Vec<CapturedFrame> {
        self.capture.snapshot(direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusFaultConfig;

    #[tokio::test]
    async fn test_frames_cross_both_ways() {
        let (host, slave) = LoopbackBus::pair(BusKind::Spi);
        host.init().await.unwrap();

        assert_eq!(host.send(&[1, 2, 3]).await, Ok(3));
        assert_eq!(slave.recv().await, Some(vec![1, 2, 3]));

        slave.send(vec![4, 5]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = host.receive(&mut buf, Duration::from_millis(50)).await.unwrap();
        assert_eq!(&buf[..n], &[4, 5]);

        let captured = host.captured(None);
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0].direction, FrameDirection::HostToSlave);
        assert_eq!(captured[1].direction, FrameDirection::SlaveToHost);
    }

    #[tokio::test]
    async fn test_send_requires_init() {
        let (host, _slave) = LoopbackBus::pair(BusKind::Sdio);
        assert_eq!(host.send(&[0]).await, Err(BusError::NotReady));
    }

    #[tokio::test]
    async fn test_receive_timeout_returns_zero() {
        let (host, _slave) = LoopbackBus::pair(BusKind::Uart);
        host.init().await.unwrap();
        let mut buf = [0u8; 8];
        let n = host.receive(&mut buf, Duration::from_millis(5)).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_ready_after_polls() {
        let (host, _slave) = LoopbackBus::pair(BusKind::Usb);
        host.init().await.unwrap();
        host.ready_after_polls(2);
        assert!(!host.is_tx_ready());
        assert!(!host.is_tx_ready());
        assert!(host.is_tx_ready());
    }

    #[tokio::test]
    async fn test_injected_send_failure() {
        let (host, slave) = LoopbackBus::pair(BusKind::Spi);
        host.init().await.unwrap();
        host.set_fault_injector(Some(BusFaultInjector::new(BusFaultConfig {
            enabled: true,
            send_failure_percent: 100.0,
            ..BusFaultConfig::default()
        })));

        assert!(matches!(host.send(&[1]).await, Err(BusError::Io(_))));
        assert!(slave.recv_timeout(Duration::from_millis(5)).await.is_none());
    }
}
