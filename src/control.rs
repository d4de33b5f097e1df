//! Private-control messages carried on the `Priv` interface.
//!
//! Wire form: `[event_type][body_len][TLV...]`, each TLV `[tag][len][value]`.
//! Internal code only sees the typed structs below; bit positions are
//! confined to `from_bits`/`bits`.

use crate::bus::BusKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::trace;

pub const EVENT_INIT: u8 = 0x22;
pub const EVENT_SLAVE_CONFIG: u8 = 0x23;
pub const EVENT_POWER_SAVE_START: u8 = 0x24;
pub const EVENT_POWER_SAVE_STOP: u8 = 0x25;
pub const EVENT_QUEUE_LOAD: u8 = 0x26;

// INIT tags
pub const TAG_CAPABILITY: u8 = 0x11;
pub const TAG_FIRMWARE_CHIP_ID: u8 = 0x12;
pub const TAG_RAW_TP: u8 = 0x13;
pub const TAG_RX_QUEUE_SIZE: u8 = 0x14;
pub const TAG_TX_QUEUE_SIZE: u8 = 0x15;
pub const TAG_EXT_CAPABILITY: u8 = 0x16;
pub const TAG_FIRMWARE_VERSION: u8 = 0x17;
pub const TAG_ACTIVE_BUS: u8 = 0x18;

// SLAVE_CONFIG tags
pub const TAG_HOST_CAPABILITIES: u8 = 0x44;
pub const TAG_EXPECTED_CHIP: u8 = 0x45;
pub const TAG_RAW_TP_REQUEST: u8 = 0x46;
pub const TAG_THROTTLE_HIGH: u8 = 0x47;
pub const TAG_THROTTLE_LOW: u8 = 0x48;

// Power-save ack and queue load tags
pub const TAG_STATUS: u8 = 0x30;
pub const TAG_QUEUE_LOAD_PERCENT: u8 = 0x31;

const MSG_HEADER_LEN: usize = 2;
const TLV_HEADER_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("control message of {0} bytes is too short")]
    TooShort(usize),
    #[error("unknown control event {0:#04x}")]
    UnknownEvent(u8),
    #[error("control body declares {declared} bytes but {available} are present")]
    BodyTruncated { declared: usize, available: usize },
    #[error("TLV {tag:#04x} runs past the end of the body")]
    TlvTruncated { tag: u8 },
    #[error("TLV {tag:#04x} has invalid length {len}")]
    BadLength { tag: u8, len: usize },
    #[error("event {event:#04x} is missing required TLV {tag:#04x}")]
    MissingTag { event: u8, tag: u8 },
    #[error("control body of {0} bytes exceeds 255")]
    BodyTooLarge(usize),
}

/// Primary capability byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub wlan_sdio: bool,
    pub bt_uart: bool,
    pub bt_sdio: bool,
    pub ble_only: bool,
    pub br_edr_only: bool,
    pub wlan_spi: bool,
    pub bt_spi: bool,
    pub checksum: bool,
}

impl Capabilities {
    pub fn from_bits(bits: u8) -> Self {
        let bit = |n: u8| bits & (1 << n) != 0;
        Self {
            wlan_sdio: bit(0),
            bt_uart: bit(1),
            bt_sdio: bit(2),
            ble_only: bit(3),
            br_edr_only: bit(4),
            wlan_spi: bit(5),
            bt_spi: bit(6),
            checksum: bit(7),
        }
    }

    pub fn bits(&self) -> u8 {
        [
            self.wlan_sdio,
            self.bt_uart,
            self.bt_sdio,
            self.ble_only,
            self.br_edr_only,
            self.wlan_spi,
            self.bt_spi,
            self.checksum,
        ]
        .iter()
        .enumerate()
        .fold(0u8, |acc, (n, set)| if *set { acc | (1 << n) } else { acc })
    }
}

/// Extended capability word, for buses newer than the primary byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtCapabilities {
    pub wlan_uart: bool,
    pub wlan_usb: bool,
    pub wlan_spi_hd: bool,
    pub bt_usb: bool,
}

impl ExtCapabilities {
    pub fn from_bits(bits: u32) -> Self {
        Self {
            wlan_uart: bits & (1 << 0) != 0,
            wlan_usb: bits & (1 << 1) != 0,
            wlan_spi_hd: bits & (1 << 2) != 0,
            bt_usb: bits & (1 << 3) != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        (self.wlan_uart as u32)
            | (self.wlan_usb as u32) << 1
            | (self.wlan_spi_hd as u32) << 2
            | (self.bt_usb as u32) << 3
    }
}

/// Firmware chip identity. Codes outside the known set decode as
/// `Unrecognized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChipId {
    Esp32,
    Esp32S2,
    Esp32C3,
    Esp32S3,
    Esp32C2,
    Esp32C6,
    Esp32C5,
    #[default]
    Unrecognized,
}

impl ChipId {
    pub fn code(self) -> u8 {
        match self {
            ChipId::Esp32 => 0x00,
            ChipId::Esp32S2 => 0x02,
            ChipId::Esp32C3 => 0x05,
            ChipId::Esp32S3 => 0x09,
            ChipId::Esp32C2 => 0x0C,
            ChipId::Esp32C6 => 0x0D,
            ChipId::Esp32C5 => 0x17,
            ChipId::Unrecognized => 0xFF,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => ChipId::Esp32,
            0x02 => ChipId::Esp32S2,
            0x05 => ChipId::Esp32C3,
            0x09 => ChipId::Esp32S3,
            0x0C => ChipId::Esp32C2,
            0x0D => ChipId::Esp32C6,
            0x17 => ChipId::Esp32C5,
            _ => ChipId::Unrecognized,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace('-', "").as_str() {
            "esp32" => Some(ChipId::Esp32),
            "esp32s2" => Some(ChipId::Esp32S2),
            "esp32c3" => Some(ChipId::Esp32C3),
            "esp32s3" => Some(ChipId::Esp32S3),
            "esp32c2" => Some(ChipId::Esp32C2),
            "esp32c6" => Some(ChipId::Esp32C6),
            "esp32c5" => Some(ChipId::Esp32C5),
            "unrecognized" | "any" => Some(ChipId::Unrecognized),
            _ => None,
        }
    }
}

impl fmt::Display for ChipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChipId::Esp32 => "ESP32",
            ChipId::Esp32S2 => "ESP32-S2",
            ChipId::Esp32C3 => "ESP32-C3",
            ChipId::Esp32S3 => "ESP32-S3",
            ChipId::Esp32C2 => "ESP32-C2",
            ChipId::Esp32C6 => "ESP32-C6",
            ChipId::Esp32C5 => "ESP32-C5",
            ChipId::Unrecognized => "unrecognized",
        };
        f.write_str(name)
    }
}

/// Direction(s) in which raw-throughput test traffic may flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RawTpDirection {
    #[default]
    None,
    SlaveToHost,
    HostToSlave,
    Bidirectional,
}

impl RawTpDirection {
    pub fn code(self) -> u8 {
        match self {
            RawTpDirection::None => 0,
            RawTpDirection::SlaveToHost => 1,
            RawTpDirection::HostToSlave => 2,
            RawTpDirection::Bidirectional => 3,
        }
    }

    pub fn from_code(code: u8) -> Self {
        Self::from_flags(code & 0b01 != 0, code & 0b10 != 0)
    }

    fn from_flags(slave_to_host: bool, host_to_slave: bool) -> Self {
        match (slave_to_host, host_to_slave) {
            (false, false) => RawTpDirection::None,
            (true, false) => RawTpDirection::SlaveToHost,
            (false, true) => RawTpDirection::HostToSlave,
            (true, true) => RawTpDirection::Bidirectional,
        }
    }

    pub fn slave_to_host(self) -> bool {
        matches!(self, RawTpDirection::SlaveToHost | RawTpDirection::Bidirectional)
    }

    pub fn host_to_slave(self) -> bool {
        matches!(self, RawTpDirection::HostToSlave | RawTpDirection::Bidirectional)
    }

    /// Directions present in both.
    pub fn intersect(self, other: RawTpDirection) -> Self {
        Self::from_flags(
            self.slave_to_host() && other.slave_to_host(),
            self.host_to_slave() && other.host_to_slave(),
        )
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(RawTpDirection::None),
            "s2h" | "slave-to-host" => Some(RawTpDirection::SlaveToHost),
            "h2s" | "host-to-slave" => Some(RawTpDirection::HostToSlave),
            "both" | "bidirectional" => Some(RawTpDirection::Bidirectional),
            _ => None,
        }
    }
}

impl fmt::Display for RawTpDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RawTpDirection::None => "none",
            RawTpDirection::SlaveToHost => "slave-to-host",
            RawTpDirection::HostToSlave => "host-to-slave",
            RawTpDirection::Bidirectional => "bidirectional",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Slave capability response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SlaveInit {
    pub capabilities: Capabilities,
    pub ext_capabilities: ExtCapabilities,
    pub chip: ChipId,
    /// `None` when the slave did not send the raw-tp TLV.
    pub raw_tp: Option<RawTpDirection>,
    pub rx_queue_size: Option<u8>,
    pub tx_queue_size: Option<u8>,
    pub firmware_version: Option<FirmwareVersion>,
    pub active_bus: Option<BusKind>,
}

impl SlaveInit {
    /// Whether the slave advertises WLAN over `bus`.
    pub fn supports_wlan_on(&self, bus: BusKind) -> bool {
        match bus {
            BusKind::Sdio => self.capabilities.wlan_sdio,
            BusKind::Spi => self.capabilities.wlan_spi,
            BusKind::SpiHd => self.ext_capabilities.wlan_spi_hd,
            BusKind::Uart => self.ext_capabilities.wlan_uart,
            BusKind::Usb => self.ext_capabilities.wlan_usb,
        }
    }
}

/// Host announcement sent at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveConfig {
    pub host_capabilities: Capabilities,
    pub expected_chip: ChipId,
    pub raw_tp_request: RawTpDirection,
    pub throttle_high_threshold: u8,
    pub throttle_low_threshold: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    SlaveInit(SlaveInit),
    SlaveConfig(SlaveConfig),
    /// Request when `status` is `None`, acknowledgement otherwise.
    PowerSaveStart { status: Option<u8> },
    PowerSaveStop { status: Option<u8> },
    QueueLoad { percent: u8 },
}

impl ControlMessage {
    pub fn event_type(&self) -> u8 {
        match self {
            ControlMessage::SlaveInit(_) => EVENT_INIT,
            ControlMessage::SlaveConfig(_) => EVENT_SLAVE_CONFIG,
            ControlMessage::PowerSaveStart { .. } => EVENT_POWER_SAVE_START,
            ControlMessage::PowerSaveStop { .. } => EVENT_POWER_SAVE_STOP,
            ControlMessage::QueueLoad { .. } => EVENT_QUEUE_LOAD,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ControlError> {
        let mut body = Vec::new();
        match self {
            ControlMessage::SlaveInit(init) => {
                push_tlv(&mut body, TAG_CAPABILITY, &[init.capabilities.bits()]);
                push_tlv(&mut body, TAG_FIRMWARE_CHIP_ID, &[init.chip.code()]);
                if let Some(raw_tp) = init.raw_tp {
                    push_tlv(&mut body, TAG_RAW_TP, &[raw_tp.code()]);
                }
                if let Some(size) = init.rx_queue_size {
                    push_tlv(&mut body, TAG_RX_QUEUE_SIZE, &[size]);
                }
                if let Some(size) = init.tx_queue_size {
                    push_tlv(&mut body, TAG_TX_QUEUE_SIZE, &[size]);
                }
                push_tlv(&mut body, TAG_EXT_CAPABILITY, &init.ext_capabilities.bits().to_le_bytes());
                if let Some(v) = init.firmware_version {
                    push_tlv(&mut body, TAG_FIRMWARE_VERSION, &[v.major, v.minor, v.patch]);
                }
                if let Some(bus) = init.active_bus {
                    push_tlv(&mut body, TAG_ACTIVE_BUS, &[bus.code()]);
                }
            }
            ControlMessage::SlaveConfig(config) => {
                push_tlv(&mut body, TAG_HOST_CAPABILITIES, &[config.host_capabilities.bits()]);
                push_tlv(&mut body, TAG_EXPECTED_CHIP, &[config.expected_chip.code()]);
                push_tlv(&mut body, TAG_RAW_TP_REQUEST, &[config.raw_tp_request.code()]);
                push_tlv(&mut body, TAG_THROTTLE_HIGH, &[config.throttle_high_threshold]);
                push_tlv(&mut body, TAG_THROTTLE_LOW, &[config.throttle_low_threshold]);
            }
            ControlMessage::PowerSaveStart { status } | ControlMessage::PowerSaveStop { status } => {
                if let Some(status) = status {
                    push_tlv(&mut body, TAG_STATUS, &[*status]);
                }
            }
            ControlMessage::QueueLoad { percent } => {
                push_tlv(&mut body, TAG_QUEUE_LOAD_PERCENT, &[*percent]);
            }
        }

        let body_len = u8::try_from(body.len()).map_err(|_| ControlError::BodyTooLarge(body.len()))?;
        let mut msg = Vec::with_capacity(MSG_HEADER_LEN + body.len());
        msg.push(self.event_type());
        msg.push(body_len);
        msg.extend_from_slice(&body);
        Ok(msg)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ControlError> {
        if bytes.len() < MSG_HEADER_LEN {
            return Err(ControlError::TooShort(bytes.len()));
        }
        let event = bytes[0];
        let declared = bytes[1] as usize;
        let available = bytes.len() - MSG_HEADER_LEN;
        if declared > available {
            return Err(ControlError::BodyTruncated { declared, available });
        }
        let tlvs = parse_tlvs(&bytes[MSG_HEADER_LEN..MSG_HEADER_LEN + declared])?;

        match event {
            EVENT_INIT => decode_init(&tlvs).map(ControlMessage::SlaveInit),
            EVENT_SLAVE_CONFIG => decode_slave_config(&tlvs).map(ControlMessage::SlaveConfig),
            EVENT_POWER_SAVE_START => Ok(ControlMessage::PowerSaveStart {
                status: optional_u8(&tlvs, TAG_STATUS)?,
            }),
            EVENT_POWER_SAVE_STOP => Ok(ControlMessage::PowerSaveStop {
                status: optional_u8(&tlvs, TAG_STATUS)?,
            }),
            EVENT_QUEUE_LOAD => {
                let percent = optional_u8(&tlvs, TAG_QUEUE_LOAD_PERCENT)?
                    .ok_or(ControlError::MissingTag { event, tag: TAG_QUEUE_LOAD_PERCENT })?;
                Ok(ControlMessage::QueueLoad { percent })
            }
            other => Err(ControlError::UnknownEvent(other)),
        }
    }
}

fn push_tlv(body: &mut Vec<u8>, tag: u8, value: &[u8]) {
    body.push(tag);
    body.push(value.len() as u8);
    body.extend_from_slice(value);
}

fn parse_tlvs(mut body: &[u8]) -> Result<Vec<(u8, &[u8])>, ControlError> {
    let mut tlvs = Vec::new();
    while !body.is_empty() {
        let tag = body[0];
        if body.len() < TLV_HEADER_LEN {
            return Err(ControlError::TlvTruncated { tag });
        }
        let len = body[1] as usize;
        let end = TLV_HEADER_LEN + len;
        if end > body.len() {
            return Err(ControlError::TlvTruncated { tag });
        }
        tlvs.push((tag, &body[TLV_HEADER_LEN..end]));
        body = &body[end..];
    }
    Ok(tlvs)
}

fn find<'a>(tlvs: &[(u8, &'a [u8])], tag: u8) -> Option<&'a [u8]> {
    tlvs.iter().find(|(t, _)| *t == tag).map(|(_, v)| *v)
}

fn optional_u8(tlvs: &[(u8, &[u8])], tag: u8) -> Result<Option<u8>, ControlError> {
    match find(tlvs, tag) {
        None => Ok(None),
        Some([value]) => Ok(Some(*value)),
        Some(other) => Err(ControlError::BadLength { tag, len: other.len() }),
    }
}

fn required_u8(tlvs: &[(u8, &[u8])], event: u8, tag: u8) -> Result<u8, ControlError> {
    optional_u8(tlvs, tag)?.ok_or(ControlError::MissingTag { event, tag })
}

fn decode_init(tlvs: &[(u8, &[u8])]) -> Result<SlaveInit, ControlError> {
    const KNOWN: [u8; 8] = [
        TAG_CAPABILITY,
        TAG_FIRMWARE_CHIP_ID,
        TAG_RAW_TP,
        TAG_RX_QUEUE_SIZE,
        TAG_TX_QUEUE_SIZE,
        TAG_EXT_CAPABILITY,
        TAG_FIRMWARE_VERSION,
        TAG_ACTIVE_BUS,
    ];
    for (tag, _) in tlvs.iter().filter(|(tag, _)| !KNOWN.contains(tag)) {
        trace!(tag = *tag, "skipping unknown INIT tag");
    }

    let capabilities = Capabilities::from_bits(required_u8(tlvs, EVENT_INIT, TAG_CAPABILITY)?);

    let ext_capabilities = match find(tlvs, TAG_EXT_CAPABILITY) {
        None => ExtCapabilities::default(),
        Some(value) => {
            let word: [u8; 4] = value.try_into().map_err(|_| ControlError::BadLength {
                tag: TAG_EXT_CAPABILITY,
                len: value.len(),
            })?;
            ExtCapabilities::from_bits(u32::from_le_bytes(word))
        }
    };

    let firmware_version = match find(tlvs, TAG_FIRMWARE_VERSION) {
        None => None,
        Some([major, minor, patch]) => Some(FirmwareVersion {
            major: *major,
            minor: *minor,
            patch: *patch,
        }),
        Some(other) => {
            return Err(ControlError::BadLength {
                tag: TAG_FIRMWARE_VERSION,
                len: other.len(),
            })
        }
    };

    Ok(SlaveInit {
        capabilities,
        ext_capabilities,
        chip: optional_u8(tlvs, TAG_FIRMWARE_CHIP_ID)?
            .map(ChipId::from_code)
            .unwrap_or_default(),
        raw_tp: optional_u8(tlvs, TAG_RAW_TP)?.map(RawTpDirection::from_code),
        rx_queue_size: optional_u8(tlvs, TAG_RX_QUEUE_SIZE)?,
        tx_queue_size: optional_u8(tlvs, TAG_TX_QUEUE_SIZE)?,
        firmware_version,
        active_bus: optional_u8(tlvs, TAG_ACTIVE_BUS)?.and_then(BusKind::from_code),
    })
}

fn decode_slave_config(tlvs: &[(u8, &[u8])]) -> Result<SlaveConfig, ControlError> {
    Ok(SlaveConfig {
        host_capabilities: Capabilities::from_bits(required_u8(
            tlvs,
            EVENT_SLAVE_CONFIG,
            TAG_HOST_CAPABILITIES,
        )?),
        expected_chip: optional_u8(tlvs, TAG_EXPECTED_CHIP)?
            .map(ChipId::from_code)
            .unwrap_or_default(),
        raw_tp_request: optional_u8(tlvs, TAG_RAW_TP_REQUEST)?
            .map(RawTpDirection::from_code)
            .unwrap_or_default(),
        throttle_high_threshold: optional_u8(tlvs, TAG_THROTTLE_HIGH)?.unwrap_or(0),
        throttle_low_threshold: optional_u8(tlvs, TAG_THROTTLE_LOW)?.unwrap_or(0),
    })
}
