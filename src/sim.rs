//! Simulated slave firmware for the far end of a [`LoopbackBus`](crate::bus::LoopbackBus).
//!
//! Answers SLAVE_CONFIG with an INIT response built from its
//! [`SlaveProfile`], acknowledges power-save requests, optionally echoes
//! data frames, counts raw-throughput frames, and can push throttle
//! commands or queue-load reports on demand.

use crate::buffer::InterfaceType;
use crate::bus::{BusError, BusKind, SlaveEnd};
use crate::control::{
    Capabilities, ChipId, ControlMessage, ExtCapabilities, FirmwareVersion, RawTpDirection, SlaveConfig,
    SlaveInit,
};
use crate::frame::{self, FrameHeader, ThrottleCommand};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const DEFAULT_SLAVE_QUEUE_SIZE: u8 = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveProfile {
    pub capabilities: Capabilities,
    pub ext_capabilities: ExtCapabilities,
    pub chip: ChipId,
    /// `None` omits the raw-tp TLV from INIT.
    pub raw_tp: Option<RawTpDirection>,
    pub firmware_version: FirmwareVersion,
    pub rx_queue_size: u8,
    pub tx_queue_size: u8,
    pub active_bus: Option<BusKind>,
    pub respond_to_config: bool,
    pub response_delay_ms: u64,
    pub ack_power_save: bool,
    /// Status echoed in power-save acks. Non-zero rejects the request.
    pub power_save_status: u8,
    pub echo_data: bool,
    pub checksum_enabled: bool,
}

impl SlaveProfile {
    /// A slave that supports WLAN and BT over `bus`.
    pub fn for_bus(bus: BusKind) -> Self {
        let mut capabilities = Capabilities {
            checksum: true,
            ..Capabilities::default()
        };
        let mut ext_capabilities = ExtCapabilities::default();
        match bus {
            BusKind::Sdio => {
                capabilities.wlan_sdio = true;
                capabilities.bt_sdio = true;
            }
            BusKind::Spi => {
                capabilities.wlan_spi = true;
                capabilities.bt_spi = true;
            }
            BusKind::SpiHd => ext_capabilities.wlan_spi_hd = true,
            BusKind::Uart => {
                ext_capabilities.wlan_uart = true;
                capabilities.bt_uart = true;
            }
            BusKind::Usb => {
                ext_capabilities.wlan_usb = true;
                ext_capabilities.bt_usb = true;
            }
        }

        Self {
            capabilities,
            ext_capabilities,
            chip: ChipId::Esp32C6,
            raw_tp: Some(RawTpDirection::Bidirectional),
            firmware_version: FirmwareVersion {
                major: 1,
                minor: 0,
                patch: 0,
            },
            rx_queue_size: DEFAULT_SLAVE_QUEUE_SIZE,
            tx_queue_size: DEFAULT_SLAVE_QUEUE_SIZE,
            active_bus: Some(bus),
            respond_to_config: true,
            response_delay_ms: 0,
            ack_power_save: true,
            power_save_status: 0,
            echo_data: false,
            checksum_enabled: true,
        }
    }

    pub fn init_response(&self) -> SlaveInit {
        SlaveInit {
            capabilities: self.capabilities,
            ext_capabilities: self.ext_capabilities,
            chip: self.chip,
            raw_tp: self.raw_tp,
            rx_queue_size: Some(self.rx_queue_size),
            tx_queue_size: Some(self.tx_queue_size),
            firmware_version: Some(self.firmware_version),
            active_bus: self.active_bus,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveStats {
    pub frames_received: u64,
    pub bad_frames: u64,
    pub configs_received: u64,
    pub power_save_requests: u64,
    pub data_frames: u64,
    pub raw_tp_frames: u64,
    pub raw_tp_bytes: u64,
    pub frames_sent: u64,
}

/// One data frame as the slave saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedData {
    pub if_type: InterfaceType,
    pub if_num: u8,
    pub seq: u16,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

struct SlaveState {
    end: SlaveEnd,
    profile: Mutex<SlaveProfile>,
    stats: Mutex<SlaveStats>,
    last_config: Mutex<Option<SlaveConfig>>,
    received: Mutex<Vec<ReceivedData>>,
    seq: AtomicU16,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SlaveState {
    fn profile(&self) -> SlaveProfile {
        lock(&self.profile).clone()
    }

    async fn send_frame(
        &self,
        if_type: InterfaceType,
        if_num: u8,
        throttle: ThrottleCommand,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let header = FrameHeader::new(if_type, if_num)
            .with_seq(self.seq.fetch_add(1, Ordering::Relaxed))
            .with_throttle(throttle);
        let bytes = frame::encode(&header, payload, self.profile().checksum_enabled)
            .map_err(|err| BusError::Io(err.to_string()))?;
        self.end.send(bytes).await?;
        lock(&self.stats).frames_sent += 1;
        Ok(())
    }

    async fn send_control(&self, message: &ControlMessage) -> Result<(), BusError> {
        let payload = message.encode().map_err(|err| BusError::Io(err.to_string()))?;
        self.send_frame(InterfaceType::Priv, 0, ThrottleCommand::NoChange, &payload)
            .await
    }

    async fn handle_frame(&self, bytes: &[u8]) -> Result<(), BusError> {
        let profile = self.profile();
        lock(&self.stats).frames_received += 1;

        let (header, payload) = match frame::decode(bytes, profile.checksum_enabled) {
            Ok(decoded) => decoded,
            Err(err) => {
                lock(&self.stats).bad_frames += 1;
                warn!(error = %err, "slave dropped bad frame");
                return Ok(());
            }
        };

        match header.if_type {
            InterfaceType::Priv => self.handle_control(&profile, payload).await,
            InterfaceType::Test => {
                let mut stats = lock(&self.stats);
                stats.raw_tp_frames += 1;
                stats.raw_tp_bytes += payload.len() as u64;
                Ok(())
            }
            if_type => {
                lock(&self.stats).data_frames += 1;
                lock(&self.received).push(ReceivedData {
                    if_type,
                    if_num: header.if_num,
                    seq: header.seq,
                    payload: payload.to_vec(),
                });
                if profile.echo_data && matches!(if_type, InterfaceType::Sta | InterfaceType::Ap) {
                    self.send_frame(if_type, header.if_num, ThrottleCommand::NoChange, payload)
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn handle_control(&self, profile: &SlaveProfile, payload: &[u8]) -> Result<(), BusError> {
        let message = match ControlMessage::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                lock(&self.stats).bad_frames += 1;
                warn!(error = %err, "slave dropped malformed control message");
                return Ok(());
            }
        };

        match message {
            ControlMessage::SlaveConfig(config) => {
                lock(&self.stats).configs_received += 1;
                *lock(&self.last_config) = Some(config);
                debug!(expected_chip = %config.expected_chip, "slave config received");
                if profile.respond_to_config {
                    if profile.response_delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(profile.response_delay_ms)).await;
                    }
                    self.send_control(&ControlMessage::SlaveInit(profile.init_response()))
                        .await?;
                }
            }
            ControlMessage::PowerSaveStart { status: None } | ControlMessage::PowerSaveStop { status: None } => {
                lock(&self.stats).power_save_requests += 1;
                if profile.ack_power_save {
                    let status = Some(profile.power_save_status);
                    let ack = match message {
                        ControlMessage::PowerSaveStart { .. } => ControlMessage::PowerSaveStart { status },
                        _ => ControlMessage::PowerSaveStop { status },
                    };
                    self.send_control(&ack).await?;
                }
            }
            other => trace!(?other, "slave ignored control message"),
        }
        Ok(())
    }
}

/// Spawns the slave task.
pub struct SimulatedSlave;

impl SimulatedSlave {
    pub fn spawn(end: SlaveEnd, profile: SlaveProfile) -> SlaveHandle {
        let state = Arc::new(SlaveState {
            end,
            profile: Mutex::new(profile),
            stats: Mutex::new(SlaveStats::default()),
            last_config: Mutex::new(None),
            received: Mutex::new(Vec::new()),
            seq: AtomicU16::new(0),
        });

        let worker = Arc::clone(&state);
        let task = tokio::spawn(async move {
            info!(bus = %worker.end.kind(), "simulated slave running");
            while let Some(bytes) = worker.end.recv().await {
                if let Err(err) = worker.handle_frame(&bytes).await {
                    warn!(error = %err, "simulated slave stopping");
                    break;
                }
            }
        });

        SlaveHandle { state, task }
    }
}

/// Control surface for a running simulated slave. Dropping it stops the
/// slave.
pub struct SlaveHandle {
    state: Arc<SlaveState>,
    task: JoinHandle<()>,
}

impl SlaveHandle {
    pub fn stats(&self) -> SlaveStats {
        lock(&self.state.stats).clone()
    }

    pub fn last_config(&self) -> Option<SlaveConfig> {
        *lock(&self.state.last_config)
    }

    /// Data frames received so far, oldest first.
    pub fn received(&self) -> Vec<ReceivedData> {
        lock(&self.state.received).clone()
    }

    pub fn update_profile<F>(&self, update: F)
    where
        F: FnOnce(&mut SlaveProfile),
    {
        update(&mut lock(&self.state.profile));
    }

    /// Push a throttle command to the host in a zero-length frame.
    pub async fn set_throttle(&self, on: bool) -> Result<(), BusError> {
        let command = if on { ThrottleCommand::On } else { ThrottleCommand::Off };
        self.state.send_frame(InterfaceType::Sta, 0, command, &[]).await
    }

    pub async fn report_queue_load(&self, percent: u8) -> Result<(), BusError> {
        self.state
            .send_control(&ControlMessage::QueueLoad { percent })
            .await
    }

    /// Send a data frame to the host.
    pub async fn send_data(&self, if_type: InterfaceType, if_num: u8, payload: &[u8]) -> Result<(), BusError> {
        self.state
            .send_frame(if_type, if_num, ThrottleCommand::NoChange, payload)
            .await
    }

    pub async fn send_control(&self, message: &ControlMessage) -> Result<(), BusError> {
        self.state.send_control(message).await
    }

    /// Write raw bytes to the host, bypassing framing.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), BusError> {
        self.state.end.send(bytes).await
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for SlaveHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, LoopbackBus};

    async fn read_control(host: &LoopbackBus) -> ControlMessage {
        let mut buf = vec![0u8; host.max_frame_size()];
        let len = host.receive(&mut buf, Duration::from_secs(1)).await.unwrap();
        let (header, payload) = frame::decode(&buf[..len], true).unwrap();
        assert_eq!(header.if_type, InterfaceType::Priv);
        ControlMessage::decode(payload).unwrap()
    }

    fn config_frame(seq: u16) -> Vec<u8> {
        let config = SlaveConfig {
            host_capabilities: Capabilities::default(),
            expected_chip: ChipId::Unrecognized,
            raw_tp_request: RawTpDirection::None,
            throttle_high_threshold: 80,
            throttle_low_threshold: 60,
        };
        let payload = ControlMessage::SlaveConfig(config).encode().unwrap();
        frame::encode(&FrameHeader::new(InterfaceType::Priv, 0).with_seq(seq), &payload, true).unwrap()
    }

    #[test]
    fn test_profile_advertises_its_bus() {
        for kind in [BusKind::Sdio, BusKind::Spi, BusKind::SpiHd, BusKind::Uart, BusKind::Usb] {
            assert!(SlaveProfile::for_bus(kind).init_response().supports_wlan_on(kind));
        }
    }

    #[tokio::test]
    async fn test_slave_answers_config_with_init() {
        let (host, end) = LoopbackBus::pair(BusKind::Spi);
        host.init().await.unwrap();
        let slave = SimulatedSlave::spawn(end, SlaveProfile::for_bus(BusKind::Spi));

        host.send(&config_frame(0)).await.unwrap();
        match read_control(&host).await {
            ControlMessage::SlaveInit(init) => {
                assert_eq!(init.chip, ChipId::Esp32C6);
                assert_eq!(init.active_bus, Some(BusKind::Spi));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(slave.stats().configs_received, 1);
        assert!(slave.last_config().is_some());
    }

    #[tokio::test]
    async fn test_slave_acks_power_save() {
        let (host, end) = LoopbackBus::pair(BusKind::Sdio);
        host.init().await.unwrap();
        let slave = SimulatedSlave::spawn(end, SlaveProfile::for_bus(BusKind::Sdio));

        let payload = ControlMessage::PowerSaveStart { status: None }.encode().unwrap();
        let bytes = frame::encode(&FrameHeader::new(InterfaceType::Priv, 0), &payload, true).unwrap();
        host.send(&bytes).await.unwrap();

        assert_eq!(read_control(&host).await, ControlMessage::PowerSaveStart { status: Some(0) });
        assert_eq!(slave.stats().power_save_requests, 1);
    }

    #[tokio::test]
    async fn test_silent_slave_does_not_respond() {
        let (host, end) = LoopbackBus::pair(BusKind::Uart);
        host.init().await.unwrap();
        let mut profile = SlaveProfile::for_bus(BusKind::Uart);
        profile.respond_to_config = false;
        let slave = SimulatedSlave::spawn(end, profile);

        host.send(&config_frame(0)).await.unwrap();
        let mut buf = vec![0u8; 64];
        let len = host.receive(&mut buf, Duration::from_millis(50)).await.unwrap();
        assert_eq!(len, 0);
        assert_eq!(slave.stats().configs_received, 1);
    }
}
