//! On-bus framing. Every buffer crosses the bus as a 12-byte little-endian
//! header followed by its payload.

use crate::buffer::InterfaceType;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;

pub const HEADER_LEN: usize = 12;

pub const PACKET_TYPE_DATA: u8 = 0x00;
pub const PACKET_TYPE_PRIV_EVENT: u8 = 0x33;

const THROTTLE_MASK: u8 = 0b11;
const MAX_IF_NUM: u8 = 0x0F;

const OFF_IF: usize = 0;
const OFF_FLAGS: usize = 1;
const OFF_LEN: usize = 2;
const OFF_OFFSET: usize = 4;
const OFF_CHECKSUM: usize = 6;
const OFF_SEQ: usize = 8;
const OFF_THROTTLE: usize = 10;
const OFF_PKT_TYPE: usize = 11;

const_assert_eq!(OFF_PKT_TYPE + 1, HEADER_LEN);

/// Throttle command piggybacked on every slave-to-host frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ThrottleCommand {
    #[default]
    NoChange,
    On,
    Off,
}

impl ThrottleCommand {
    pub fn bits(self) -> u8 {
        match self {
            ThrottleCommand::NoChange => 0,
            ThrottleCommand::On => 1,
            ThrottleCommand::Off => 2,
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & THROTTLE_MASK {
            1 => ThrottleCommand::On,
            2 => ThrottleCommand::Off,
            _ => ThrottleCommand::NoChange,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub if_type: InterfaceType,
    pub if_num: u8,
    pub flags: u8,
    pub len: u16,
    pub seq: u16,
    pub throttle: ThrottleCommand,
    pub packet_type: u8,
}

impl FrameHeader {
    pub fn new(if_type: InterfaceType, if_num: u8) -> Self {
        let packet_type = if if_type == InterfaceType::Priv {
            PACKET_TYPE_PRIV_EVENT
        } else {
            PACKET_TYPE_DATA
        };
        Self {
            if_type,
            if_num,
            flags: 0,
            len: 0,
            seq: 0,
            throttle: ThrottleCommand::NoChange,
            packet_type,
        }
    }

    pub fn with_seq(mut self, seq: u16) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottleCommand) -> Self {
        self.throttle = throttle;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes is shorter than the header")]
    TooShort(usize),
    #[error("header declares {declared} payload bytes but {available} are present")]
    Truncated { declared: usize, available: usize },
    #[error("unexpected payload offset {0}")]
    BadOffset(u16),
    #[error("unknown interface type code {0}")]
    UnknownInterface(u8),
    #[error("interface number {0} does not fit in four bits")]
    InterfaceNumber(u8),
    #[error("checksum mismatch: header {expected:#06x}, computed {computed:#06x}")]
    Checksum { expected: u16, computed: u16 },
    #[error("payload of {len} bytes exceeds frame maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Wrapping byte sum over a header (checksum field zeroed) and its payload.
pub fn checksum(header: &[u8; HEADER_LEN], payload: &[u8]) -> u16 {
    header
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != OFF_CHECKSUM && *i != OFF_CHECKSUM + 1)
        .map(|(_, b)| *b)
        .chain(payload.iter().copied())
        .fold(0u16, |sum, b| sum.wrapping_add(b as u16))
}

/// Serialize one frame. `header.len` is taken from the payload.
pub fn encode(header: &FrameHeader, payload: &[u8], with_checksum: bool) -> Result<Vec<u8>, FrameError> {
    if header.if_num > MAX_IF_NUM {
        return Err(FrameError::InterfaceNumber(header.if_num));
    }
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        len: payload.len(),
        max: u16::MAX as usize,
    })?;

    let mut head = [0u8; HEADER_LEN];
    head[OFF_IF] = (header.if_type.code() & 0x0F) | (header.if_num << 4);
    head[OFF_FLAGS] = header.flags;
    head[OFF_LEN..OFF_LEN + 2].copy_from_slice(&len.to_le_bytes());
    head[OFF_OFFSET..OFF_OFFSET + 2].copy_from_slice(&(HEADER_LEN as u16).to_le_bytes());
    head[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&header.seq.to_le_bytes());
    head[OFF_THROTTLE] = header.throttle.bits();
    head[OFF_PKT_TYPE] = header.packet_type;

    if with_checksum {
        let sum = checksum(&head, payload);
        head[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&sum.to_le_bytes());
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&head);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Parse one frame, returning the header and a view of its payload.
pub fn decode(bytes: &[u8], verify_checksum: bool) -> Result<(FrameHeader, &[u8]), FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::TooShort(bytes.len()));
    }
    let mut head = [0u8; HEADER_LEN];
    head.copy_from_slice(&bytes[..HEADER_LEN]);

    let read_u16 = |at: usize| u16::from_le_bytes([head[at], head[at + 1]]);

    let offset = read_u16(OFF_OFFSET);
    if offset as usize != HEADER_LEN {
        return Err(FrameError::BadOffset(offset));
    }

    let len = read_u16(OFF_LEN);
    let available = bytes.len() - HEADER_LEN;
    if len as usize > available {
        return Err(FrameError::Truncated {
            declared: len as usize,
            available,
        });
    }
    let payload = &bytes[HEADER_LEN..HEADER_LEN + len as usize];

    let if_code = head[OFF_IF] & 0x0F;
    let if_type = InterfaceType::from_code(if_code).ok_or(FrameError::UnknownInterface(if_code))?;

    if verify_checksum {
        let expected = read_u16(OFF_CHECKSUM);
        let computed = checksum(&head, payload);
        if expected != computed {
            return Err(FrameError::Checksum { expected, computed });
        }
    }

    let header = FrameHeader {
        if_type,
        if_num: head[OFF_IF] >> 4,
        flags: head[OFF_FLAGS],
        len,
        seq: read_u16(OFF_SEQ),
        throttle: ThrottleCommand::from_bits(head[OFF_THROTTLE]),
        packet_type: head[OFF_PKT_TYPE],
    };
    Ok((header, payload))
}
