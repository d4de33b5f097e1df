//! Transport lifecycle controller and the public send path.
//!
//! A [`Transport`] owns one bus. `setup` brings the link up in order (bus
//! init, queue banks, channel registry, pumps, handshake) and `teardown`
//! unwinds exactly what was created. Everything created by `setup` lives in
//! a [`Link`] shared with the pump tasks.

use crate::buffer::{BufferHandle, InterfaceType, OwnerToken};
use crate::bus::{Bus, BusError};
use crate::channel::{ChannelError, ChannelId, ChannelInfo, ChannelReceiver, ChannelRegistry};
use crate::config::{ConfigError, TransportConfig};
use crate::control::{ControlError, ControlMessage, RawTpDirection};
use crate::flow::{FlowControl, FlowSnapshot};
use crate::frame::{FrameError, HEADER_LEN};
use crate::handshake::{HandshakeError, HandshakeNegotiator, HandshakeState, NegotiatedLink};
use crate::power_save::{Begin, PowerSaveCoordinator, PowerSaveError, PowerSaveOutcome, PowerSaveState, Transition};
use crate::pump::Pumps;
use crate::queue::{Priority, PriorityBank, QueueError};
use crate::raw_tp::{self, RawTpReport};
use crate::stats::{inc, LinkStats, TransportStats};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is already set up")]
    AlreadySetUp,
    #[error("transport is not set up")]
    NotSetUp,
    #[error("link not ready, handshake is {0}")]
    NotReady(HandshakeState),
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("interface {0} is reserved for the link layer")]
    ReservedInterface(InterfaceType),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("host-to-slave raw throughput not negotiated (negotiated {0})")]
    RawTpNotNegotiated(RawTpDirection),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    PowerSave(#[from] PowerSaveError),
}

impl TransportError {
    pub fn is_queue_full(&self) -> bool {
        matches!(self, TransportError::Queue(err) if err.is_full())
    }

    /// The caller's buffer, when the error handed it back.
    pub fn into_handle(self) -> Option<BufferHandle> {
        match self {
            TransportError::Queue(err) => Some(err.into_handle()),
            _ => None,
        }
    }
}

/// One outbound buffer plus an optional explicit priority.
#[derive(Debug)]
pub struct SendRequest {
    handle: BufferHandle,
    priority: Option<Priority>,
}

impl SendRequest {
    /// Copy `data` into link-layer memory.
    pub fn copy_from(if_type: InterfaceType, if_num: u8, data: &[u8]) -> Self {
        Self::owned(if_type, if_num, data.to_vec())
    }

    pub fn owned(if_type: InterfaceType, if_num: u8, data: Vec<u8>) -> Self {
        Self::from_handle(BufferHandle::copy_owned(if_type, if_num, data))
    }

    /// Send caller memory without copying. `release` runs with `token` once
    /// the frame has been written or dropped.
    pub fn zero_copy<F>(if_type: InterfaceType, if_num: u8, data: Arc<[u8]>, token: OwnerToken, release: F) -> Self
    where
        F: FnOnce(OwnerToken) + Send + Sync + 'static,
    {
        Self::from_handle(BufferHandle::zero_copy(if_type, if_num, data, token, release))
    }

    pub fn from_handle(handle: BufferHandle) -> Self {
        Self { handle, priority: None }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn if_type(&self) -> InterfaceType {
        self.handle.if_type()
    }

    pub fn len(&self) -> usize {
        self.handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }
}

/// Everything `setup` creates, shared between the controller and the pumps.
pub(crate) struct Link {
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) config: TransportConfig,
    pub(crate) stats: Arc<LinkStats>,
    pub(crate) tx: PriorityBank,
    pub(crate) rx: PriorityBank,
    pub(crate) registry: ChannelRegistry,
    pub(crate) flow: FlowControl,
    pub(crate) handshake: HandshakeNegotiator,
    pub(crate) power_save: PowerSaveCoordinator,
    tx_seq: AtomicU16,
    checksum: AtomicBool,
}

impl Link {
    fn new(bus: Arc<dyn Bus>, config: TransportConfig, stats: Arc<LinkStats>) -> Self {
        let handshake = HandshakeNegotiator::new(bus.kind(), config.slave_config());
        let power_save = PowerSaveCoordinator::new(config.power_save_ack_timeout(), Arc::clone(&stats));
        Self {
            tx: PriorityBank::new("tx", config.priority_queues, config.queue_depth),
            rx: PriorityBank::new("rx", config.priority_queues, config.queue_depth),
            registry: ChannelRegistry::new(),
            flow: FlowControl::new(config.throttle_high_threshold, config.throttle_low_threshold),
            handshake,
            power_save,
            tx_seq: AtomicU16::new(0),
            checksum: AtomicBool::new(config.checksum_enabled),
            bus,
            config,
            stats,
        }
    }

    pub(crate) fn next_tx_seq(&self) -> u16 {
        self.tx_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn checksum_enabled(&self) -> bool {
        self.checksum.load(Ordering::Relaxed)
    }

    /// Count a buffer into the link and arrange for its release to be
    /// counted too.
    pub(crate) fn track(&self, handle: BufferHandle) -> BufferHandle {
        inc(&self.stats.buffers_created);
        let stats = Arc::clone(&self.stats);
        handle.on_release(move |_| inc(&stats.buffers_released))
    }

    pub(crate) fn apply_negotiated(&self, negotiated: &NegotiatedLink) {
        self.checksum
            .store(self.config.checksum_enabled && negotiated.checksum, Ordering::Relaxed);
    }

    fn max_payload(&self) -> usize {
        self.bus.max_frame_size().saturating_sub(HEADER_LEN)
    }

    fn enqueue_tx(&self, priority: Priority, handle: BufferHandle) -> Result<(), TransportError> {
        match self.tx.enqueue(priority, handle) {
            Ok(()) => {
                inc(&self.stats.tx_queued);
                Ok(())
            }
            Err(err) => {
                if err.is_full() {
                    inc(&self.stats.tx_queue_full);
                }
                Err(err.into())
            }
        }
    }

    /// Queue a private-control message at the highest priority.
    fn enqueue_control(&self, message: &ControlMessage) -> Result<(), TransportError> {
        let payload = message.encode()?;
        let handle = self.track(BufferHandle::copy_owned(InterfaceType::Priv, 0, payload));
        self.enqueue_tx(Priority::HIGHEST, handle)
    }

    fn require_confirmed(&self) -> Result<(), TransportError> {
        match self.handshake.state() {
            HandshakeState::Confirmed => Ok(()),
            other => Err(TransportError::NotReady(other)),
        }
    }

    fn send(&self, request: SendRequest) -> Result<(), TransportError> {
        let if_type = request.if_type();
        if if_type.is_reserved() {
            return Err(TransportError::ReservedInterface(if_type));
        }
        self.require_confirmed()?;

        let max = self.max_payload();
        if request.len() > max {
            return Err(TransportError::PayloadTooLarge { len: request.len(), max });
        }

        let priority = request
            .priority
            .unwrap_or_else(|| Priority::for_interface(if_type, self.tx.priorities()));
        self.enqueue_tx(priority, self.track(request.handle))
    }

    /// Reset per-handshake state, announce the host and wait for the slave.
    async fn negotiate(&self) -> Result<NegotiatedLink, TransportError> {
        let attempt = self
            .bus
            .ensure_ready(self.config.bus_ready_max_retries, self.config.bus_ready_interval())
            .await?;
        debug!(attempt, "bus ready");

        self.handshake.reset();
        self.flow.reset();
        self.checksum.store(self.config.checksum_enabled, Ordering::Relaxed);

        // SENT before the request can reach the slave, so a fast response
        // is never taken for a stray one.
        self.handshake.mark_sent()?;
        self.enqueue_control(&self.handshake.request())?;

        let negotiated = self.handshake.wait(self.config.handshake_timeout()).await?;
        self.apply_negotiated(&negotiated);
        Ok(negotiated)
    }
}

/// Which setup steps have completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupProgress {
    pub bus_initialized: bool,
    pub banks_created: bool,
    pub registry_ready: bool,
    pub pumps_started: bool,
    pub handshake_confirmed: bool,
}

#[derive(Default)]
struct Lifecycle {
    progress: SetupProgress,
    pumps: Option<Pumps>,
}

/// Point-in-time view of the whole transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportStatus {
    pub progress: SetupProgress,
    pub handshake: HandshakeState,
    pub negotiated: Option<NegotiatedLink>,
    pub power_save: PowerSaveState,
    pub flow: Option<FlowSnapshot>,
    pub tx_queued_now: usize,
    pub rx_queued_now: usize,
    pub channels: Vec<ChannelInfo>,
    pub stats: TransportStats,
}

/// Host-side link layer over one bus.
pub struct Transport {
    bus: Arc<dyn Bus>,
    config: TransportConfig,
    stats: Arc<LinkStats>,
    lifecycle: AsyncMutex<Lifecycle>,
    link: RwLock<Option<Arc<Link>>>,
}

impl Transport {
    pub fn new(bus: Arc<dyn Bus>, config: TransportConfig) -> Self {
        Self {
            bus,
            config,
            stats: Arc::new(LinkStats::default()),
            lifecycle: AsyncMutex::new(Lifecycle::default()),
            link: RwLock::new(None),
        }
    }

    pub fn get_config(&self) -> &TransportConfig {
        &self.config
    }

    fn current_link(&self) -> Result<Arc<Link>, TransportError> {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotSetUp)
    }

    /// Bring the link up. `up` runs only once the handshake is confirmed;
    /// on any failure everything created so far is unwound.
    pub async fn setup<F>(&self, up: F) -> Result<NegotiatedLink, TransportError>
    where
        F: FnOnce(&NegotiatedLink),
    {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.progress != SetupProgress::default() {
            return Err(TransportError::AlreadySetUp);
        }
        self.config.validate()?;

        info!(bus = %self.bus.kind(), "setting up transport");
        match self.bring_up(&mut lifecycle).await {
            Ok(negotiated) => {
                info!(chip = %negotiated.chip, raw_tp = %negotiated.raw_tp, "transport up");
                up(&negotiated);
                Ok(negotiated)
            }
            Err(err) => {
                error!(error = %err, progress = ?lifecycle.progress, "transport setup failed");
                self.unwind(&mut lifecycle).await;
                Err(err)
            }
        }
    }

    async fn bring_up(&self, lifecycle: &mut Lifecycle) -> Result<NegotiatedLink, TransportError> {
        self.bus.init().await?;
        lifecycle.progress.bus_initialized = true;

        let link = Arc::new(Link::new(Arc::clone(&self.bus), self.config.clone(), Arc::clone(&self.stats)));
        lifecycle.progress.banks_created = true;
        lifecycle.progress.registry_ready = true;
        *self.link.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&link));

        lifecycle.pumps = Some(Pumps::spawn(&link));
        lifecycle.progress.pumps_started = true;

        let negotiated = link.negotiate().await?;
        lifecycle.progress.handshake_confirmed = true;
        Ok(negotiated)
    }

    /// Release whatever setup created, in reverse order. Safe to call at
    /// any point, any number of times.
    pub async fn teardown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.progress == SetupProgress::default() {
            debug!("teardown with nothing set up");
            return;
        }
        info!("tearing down transport");
        self.unwind(&mut lifecycle).await;
    }

    async fn unwind(&self, lifecycle: &mut Lifecycle) {
        lifecycle.progress.handshake_confirmed = false;

        if let Some(pumps) = lifecycle.pumps.take() {
            pumps.stop().await;
        }
        lifecycle.progress.pumps_started = false;

        let link = self.link.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(link) = link {
            let channels = link.registry.clear();
            let tx = link.tx.drain_all();
            let rx = link.rx.drain_all();
            link.tx.close();
            link.rx.close();
            link.power_save.reset();
            debug!(channels, tx, rx, "released queued buffers");
        }
        lifecycle.progress.registry_ready = false;
        lifecycle.progress.banks_created = false;

        if lifecycle.progress.bus_initialized {
            self.bus.deinit().await;
            lifecycle.progress.bus_initialized = false;
        }
    }

    /// Re-run bus readiness and the handshake on an established transport,
    /// keeping queues, pumps and channels.
    pub async fn reconfigure(&self) -> Result<NegotiatedLink, TransportError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.progress.pumps_started {
            return Err(TransportError::NotSetUp);
        }
        let link = self.current_link()?;

        info!("reconfiguring transport");
        lifecycle.progress.handshake_confirmed = false;
        let negotiated = link.negotiate().await.map_err(|err| {
            warn!(error = %err, "reconfigure failed");
            err
        })?;
        lifecycle.progress.handshake_confirmed = true;
        Ok(negotiated)
    }

    /// Queue one outbound buffer. Never blocks.
    ///
    /// A full queue hands the buffer back inside the error; every other
    /// rejection releases it.
    pub fn send(&self, request: SendRequest) -> Result<(), TransportError> {
        self.current_link()?.send(request)
    }

    pub fn register_channel(
        &self,
        if_type: InterfaceType,
        secure: bool,
        receiver: Arc<dyn ChannelReceiver>,
    ) -> Result<ChannelHandle, TransportError> {
        let link = self.current_link()?;
        let id = link.registry.register(if_type, secure, receiver)?;
        Ok(ChannelHandle {
            id,
            link: Arc::downgrade(&link),
        })
    }

    pub fn deregister_channel(&self, channel: &ChannelHandle) -> Result<(), TransportError> {
        let link = self.current_link()?;
        link.registry.deregister(channel.id)?;
        Ok(())
    }

    pub async fn request_power_save_start(&self) -> Result<PowerSaveOutcome, TransportError> {
        self.power_save(Transition::Suspend).await
    }

    pub async fn request_power_save_stop(&self) -> Result<PowerSaveOutcome, TransportError> {
        self.power_save(Transition::Resume).await
    }

    async fn power_save(&self, transition: Transition) -> Result<PowerSaveOutcome, TransportError> {
        let link = self.current_link()?;
        link.require_confirmed()?;

        match link.power_save.begin(transition) {
            Begin::Done(outcome) => Ok(outcome),
            Begin::Send(request) => {
                if let Err(err) = link.enqueue_control(&request) {
                    link.power_save.abort(transition);
                    return Err(err);
                }
                Ok(link.power_save.wait_ack(transition).await?)
            }
        }
    }

    /// Queue `count` Test-interface frames of `size` bytes and wait for the
    /// outbound bank to drain.
    pub async fn raw_tp_send(&self, count: usize, size: usize) -> Result<RawTpReport, TransportError> {
        let link = self.current_link()?;
        link.require_confirmed()?;
        let negotiated = link.handshake.negotiated().map(|n| n.raw_tp).unwrap_or_default();
        if !negotiated.host_to_slave() {
            return Err(TransportError::RawTpNotNegotiated(negotiated));
        }
        if size == 0 {
            return Err(TransportError::InvalidArgument("raw throughput frames need a payload"));
        }
        let max = link.max_payload().min(raw_tp::RAW_TP_MAX_PAYLOAD);
        if size > max {
            return Err(TransportError::PayloadTooLarge { len: size, max });
        }

        let priority = Priority::for_interface(InterfaceType::Test, link.tx.priorities());
        let backoff = link.config.throttle_backoff();
        let started = Instant::now();
        let (mut frames, mut rejected) = (0u64, 0u64);

        for i in 0..count {
            let mut handle = link.track(BufferHandle::copy_owned(
                InterfaceType::Test,
                0,
                raw_tp::pattern(size, i as u8),
            ));
            let mut attempts = 0;
            loop {
                match link.enqueue_tx(priority, handle) {
                    Ok(()) => {
                        frames += 1;
                        break;
                    }
                    Err(err) if err.is_queue_full() && attempts < link.config.max_throttle_retries => {
                        attempts += 1;
                        handle = match err.into_handle() {
                            Some(handle) => handle,
                            None => {
                                rejected += 1;
                                break;
                            }
                        };
                        tokio::time::sleep(backoff).await;
                    }
                    Err(err) => {
                        rejected += 1;
                        debug!(error = %err, "raw throughput frame not queued");
                        break;
                    }
                }
            }
        }

        let deadline = started + link.config.handshake_timeout();
        while !link.tx.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(backoff).await;
        }

        let report = RawTpReport::new(frames, frames * size as u64, rejected, started.elapsed());
        info!(frames, rejected, mbps = report.throughput_mbps, "raw throughput run finished");
        Ok(report)
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.current_link()
            .map_or(HandshakeState::Idle, |link| link.handshake.state())
    }

    pub fn negotiated(&self) -> Option<NegotiatedLink> {
        self.current_link().ok().and_then(|link| link.handshake.negotiated())
    }

    pub fn power_save_state(&self) -> PowerSaveState {
        self.current_link()
            .map_or(PowerSaveState::Active, |link| link.power_save.state())
    }

    pub fn is_throttled(&self) -> bool {
        self.current_link().map_or(false, |link| link.flow.is_throttled())
    }

    pub async fn progress(&self) -> SetupProgress {
        self.lifecycle.lock().await.progress
    }

    pub async fn status(&self) -> TransportStatus {
        let progress = self.progress().await;
        let link = self.current_link().ok();
        TransportStatus {
            progress,
            handshake: self.handshake_state(),
            negotiated: self.negotiated(),
            power_save: self.power_save_state(),
            flow: link.as_ref().map(|link| link.flow.snapshot()),
            tx_queued_now: link.as_ref().map_or(0, |link| link.tx.len()),
            rx_queued_now: link.as_ref().map_or(0, |link| link.rx.len()),
            channels: link.as_ref().map_or_else(Vec::new, |link| link.registry.channels()),
            stats: self.stats(),
        }
    }
}

/// A registered channel. Transmits on its interface type through the link
/// it was registered on.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    link: Weak<Link>,
}

impl ChannelHandle {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn if_type(&self) -> InterfaceType {
        self.id.if_type
    }

    fn live_link(&self) -> Result<Arc<Link>, TransportError> {
        let link = self.link.upgrade().ok_or(TransportError::NotSetUp)?;
        if !link.registry.contains(self.id) {
            return Err(ChannelError::NotFound(self.id).into());
        }
        Ok(link)
    }

    pub fn transmit(&self, if_num: u8, data: &[u8]) -> Result<(), TransportError> {
        self.live_link()?
            .send(SendRequest::copy_from(self.id.if_type, if_num, data))
    }

    pub fn transmit_zero_copy<F>(
        &self,
        if_num: u8,
        data: Arc<[u8]>,
        token: OwnerToken,
        release: F,
    ) -> Result<(), TransportError>
    where
        F: FnOnce(OwnerToken) + Send + Sync + 'static,
    {
        let request = SendRequest::zero_copy(self.id.if_type, if_num, data, token, release);
        self.live_link()?.send(request)
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("bus", &self.bus.kind())
            .field("tx", &self.tx)
            .field("rx", &self.rx)
            .field("handshake", &self.handshake.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusKind, LoopbackBus};
    use crate::control::{Capabilities, ChipId, SlaveInit};
    use crate::frame::{self, FrameHeader};

    fn link_for(kind: BusKind) -> (Arc<Link>, crate::bus::SlaveEnd) {
        let (host, slave) = LoopbackBus::pair(kind);
        let link = Link::new(Arc::new(host), TransportConfig::default(), Arc::new(LinkStats::default()));
        (Arc::new(link), slave)
    }

    fn confirm(link: &Link) {
        link.handshake.mark_sent().unwrap();
        let init = SlaveInit {
            capabilities: Capabilities {
                wlan_spi: true,
                checksum: true,
                ..Capabilities::default()
            },
            chip: ChipId::Esp32,
            ..SlaveInit::default()
        };
        link.handshake.on_slave_init(&init).unwrap().unwrap();
    }

    #[test]
    fn test_send_admission_rules() {
        let (link, _slave) = link_for(BusKind::Spi);

        let err = link.send(SendRequest::copy_from(InterfaceType::Sta, 0, &[1])).unwrap_err();
        assert!(matches!(err, TransportError::NotReady(HandshakeState::Idle)));

        confirm(&link);
        let err = link.send(SendRequest::copy_from(InterfaceType::Priv, 0, &[1])).unwrap_err();
        assert!(matches!(err, TransportError::ReservedInterface(InterfaceType::Priv)));

        let too_big = vec![0u8; BusKind::Spi.max_frame_size() - HEADER_LEN + 1];
        let err = link.send(SendRequest::owned(InterfaceType::Sta, 0, too_big)).unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { .. }));

        link.send(SendRequest::copy_from(InterfaceType::Hci, 0, &[1, 2])).unwrap();
        assert_eq!(link.tx.len_at(Priority::new(1)), 1);
        assert_eq!(link.stats.snapshot().tx_queued, 1);
    }

    #[test]
    fn test_queue_full_returns_handle() {
        let (link, _slave) = link_for(BusKind::Sdio);
        confirm(&link);
        for _ in 0..link.tx.depth() {
            link.send(SendRequest::copy_from(InterfaceType::Sta, 0, &[0])).unwrap();
        }

        let err = link.send(SendRequest::copy_from(InterfaceType::Sta, 0, &[9])).unwrap_err();
        assert!(err.is_queue_full());
        assert_eq!(err.into_handle().unwrap().payload(), &[9]);
        assert_eq!(link.stats.snapshot().tx_queue_full, 1);
    }

    #[test]
    fn test_ingest_counts_bad_and_flow_only_frames() {
        let (link, _slave) = link_for(BusKind::Uart);

        crate::pump::ingest_frame(&link, &[0u8; 3]);
        assert_eq!(link.stats.snapshot().rx_bad_frames, 1);

        let header = FrameHeader::new(InterfaceType::Sta, 0).with_throttle(crate::frame::ThrottleCommand::On);
        let bytes = frame::encode(&header, &[], true).unwrap();
        crate::pump::ingest_frame(&link, &bytes);
        assert!(link.flow.is_throttled());
        assert_eq!(link.stats.snapshot().rx_flow_only, 1);
        assert!(link.rx.is_empty());

        let bytes = frame::encode(&FrameHeader::new(InterfaceType::Hci, 0), &[5], true).unwrap();
        crate::pump::ingest_frame(&link, &bytes);
        assert_eq!(link.rx.len_at(Priority::new(1)), 1);
    }

    #[test]
    fn test_track_counts_releases() {
        let (link, _slave) = link_for(BusKind::Spi);
        let handle = link.track(BufferHandle::copy_owned(InterfaceType::Sta, 0, vec![1]));
        assert_eq!(link.stats.snapshot().buffers_outstanding(), 1);
        drop(handle);
        assert_eq!(link.stats.snapshot().buffers_outstanding(), 0);
    }
}
