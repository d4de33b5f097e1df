//! Capability exchange run once per link bring-up.
//!
//! The host announces SLAVE_CONFIG, the slave answers with INIT, and the
//! negotiator derives the effective feature set from the bus in use and
//! what the slave advertises.

use crate::bus::BusKind;
use crate::control::{
    Capabilities, ChipId, ControlMessage, ExtCapabilities, FirmwareVersion, RawTpDirection, SlaveConfig,
    SlaveInit,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    Idle,
    Sent,
    Confirmed,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Idle => "IDLE",
            HandshakeState::Sent => "SENT",
            HandshakeState::Confirmed => "CONFIRMED",
            HandshakeState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("no capability response from slave within {0:?}")]
    Timeout(Duration),
    #[error("expected firmware chip {expected}, slave reports {reported}")]
    ChipMismatch { expected: ChipId, reported: ChipId },
    #[error("handshake cannot proceed from state {0}")]
    InvalidState(HandshakeState),
}

/// Effective link parameters agreed during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedLink {
    pub bus: BusKind,
    pub bus_supported: bool,
    pub chip: ChipId,
    pub raw_tp: RawTpDirection,
    pub checksum: bool,
    pub firmware_version: Option<FirmwareVersion>,
    pub slave_rx_queue_size: Option<u8>,
    pub slave_tx_queue_size: Option<u8>,
    pub capabilities: Capabilities,
    pub ext_capabilities: ExtCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Idle,
    Sent,
    Confirmed(NegotiatedLink),
    Failed(HandshakeError),
}

impl Status {
    fn state(&self) -> HandshakeState {
        match self {
            Status::Idle => HandshakeState::Idle,
            Status::Sent => HandshakeState::Sent,
            Status::Confirmed(_) => HandshakeState::Confirmed,
            Status::Failed(_) => HandshakeState::Failed,
        }
    }

    fn is_settled(&self) -> bool {
        matches!(self, Status::Confirmed(_) | Status::Failed(_))
    }

    fn outcome(&self) -> Option<Result<NegotiatedLink, HandshakeError>> {
        match self {
            Status::Confirmed(link) => Some(Ok(link.clone())),
            Status::Failed(err) => Some(Err(err.clone())),
            _ => None,
        }
    }
}

/// Derive the negotiated link from the host's announcement and the slave's
/// INIT response.
pub fn derive(bus: BusKind, announced: &SlaveConfig, init: &SlaveInit) -> Result<NegotiatedLink, HandshakeError> {
    if announced.expected_chip != ChipId::Unrecognized && announced.expected_chip != init.chip {
        return Err(HandshakeError::ChipMismatch {
            expected: announced.expected_chip,
            reported: init.chip,
        });
    }

    if let Some(active) = init.active_bus {
        if active != bus {
            warn!(host_bus = %bus, slave_bus = %active, "slave reports a different active bus");
        }
    }

    let bus_supported = init.supports_wlan_on(bus);
    let raw_tp = if bus_supported {
        let offered = init.raw_tp.unwrap_or(announced.raw_tp_request);
        announced.raw_tp_request.intersect(offered)
    } else {
        RawTpDirection::None
    };

    Ok(NegotiatedLink {
        bus,
        bus_supported,
        chip: init.chip,
        raw_tp,
        checksum: announced.host_capabilities.checksum && init.capabilities.checksum,
        firmware_version: init.firmware_version,
        slave_rx_queue_size: init.rx_queue_size,
        slave_tx_queue_size: init.tx_queue_size,
        capabilities: init.capabilities,
        ext_capabilities: init.ext_capabilities,
    })
}

/// One-shot IDLE -> SENT -> CONFIRMED | FAILED state machine.
pub struct HandshakeNegotiator {
    bus: BusKind,
    announcement: SlaveConfig,
    status: watch::Sender<Status>,
}

impl HandshakeNegotiator {
    pub fn new(bus: BusKind, announcement: SlaveConfig) -> Self {
        let (status, _) = watch::channel(Status::Idle);
        Self {
            bus,
            announcement,
            status,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.status.borrow().state()
    }

    pub fn negotiated(&self) -> Option<NegotiatedLink> {
        match &*self.status.borrow() {
            Status::Confirmed(link) => Some(link.clone()),
            _ => None,
        }
    }

    /// SLAVE_CONFIG message announcing the host.
    pub fn request(&self) -> ControlMessage {
        ControlMessage::SlaveConfig(self.announcement)
    }

    /// IDLE -> SENT, once the request is on the outbound bank.
    pub fn mark_sent(&self) -> Result<(), HandshakeError> {
        let mut from = HandshakeState::Idle;
        let moved = self.status.send_if_modified(|status| {
            from = status.state();
            if *status == Status::Idle {
                *status = Status::Sent;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(bus = %self.bus, "slave config sent");
            Ok(())
        } else {
            Err(HandshakeError::InvalidState(from))
        }
    }

    /// Feed a slave INIT response. Returns `None` when the response was
    /// ignored because no handshake is outstanding.
    pub fn on_slave_init(&self, init: &SlaveInit) -> Option<Result<NegotiatedLink, HandshakeError>> {
        let mut outcome = None;
        self.status.send_if_modified(|status| {
            if *status != Status::Sent {
                return false;
            }
            *status = match derive(self.bus, &self.announcement, init) {
                Ok(link) => Status::Confirmed(link),
                Err(err) => Status::Failed(err),
            };
            outcome = status.outcome();
            true
        });

        match &outcome {
            None => warn!(state = %self.state(), "capability response ignored"),
            Some(Ok(link)) => info!(
                chip = %link.chip,
                raw_tp = %link.raw_tp,
                bus_supported = link.bus_supported,
                "handshake confirmed"
            ),
            Some(Err(err)) => warn!(error = %err, "handshake failed"),
        }
        outcome
    }

    /// Wait for the handshake to settle. If nothing arrives within
    /// `timeout`, SENT moves to FAILED.
    pub async fn wait(&self, timeout: Duration) -> Result<NegotiatedLink, HandshakeError> {
        let mut rx = self.status.subscribe();
        let settled = tokio::time::timeout(timeout, async {
            match rx.wait_for(Status::is_settled).await {
                Ok(status) => status.outcome(),
                Err(_) => None,
            }
        })
        .await;

        if let Ok(Some(outcome)) = settled {
            return outcome;
        }

        self.status.send_if_modified(|status| {
            if *status == Status::Sent {
                *status = Status::Failed(HandshakeError::Timeout(timeout));
                true
            } else {
                false
            }
        });
        let current = self.status.borrow().clone();
        match current.outcome() {
            Some(outcome) => outcome,
            None => Err(HandshakeError::InvalidState(current.state())),
        }
    }

    /// Back to IDLE for a fresh exchange.
    pub fn reset(&self) {
        self.status.send_replace(Status::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(expected_chip: ChipId, raw_tp_request: RawTpDirection) -> SlaveConfig {
        SlaveConfig {
            host_capabilities: Capabilities {
                checksum: true,
                ..Capabilities::default()
            },
            expected_chip,
            raw_tp_request,
            throttle_high_threshold: 80,
            throttle_low_threshold: 60,
        }
    }

    fn spi_slave(raw_tp: Option<RawTpDirection>) -> SlaveInit {
        SlaveInit {
            capabilities: Capabilities {
                wlan_spi: true,
                checksum: true,
                ..Capabilities::default()
            },
            chip: ChipId::Esp32C6,
            raw_tp,
            ..SlaveInit::default()
        }
    }

    #[test]
    fn test_raw_tp_derivation() {
        let both = announcement(ChipId::Unrecognized, RawTpDirection::Bidirectional);

        let link = derive(BusKind::Spi, &both, &spi_slave(Some(RawTpDirection::HostToSlave))).unwrap();
        assert!(link.bus_supported);
        assert_eq!(link.raw_tp, RawTpDirection::HostToSlave);

        let link = derive(BusKind::Spi, &both, &spi_slave(None)).unwrap();
        assert_eq!(link.raw_tp, RawTpDirection::Bidirectional);

        // Slave does not do WLAN over SDIO.
        let link = derive(BusKind::Sdio, &both, &spi_slave(Some(RawTpDirection::Bidirectional))).unwrap();
        assert!(!link.bus_supported);
        assert_eq!(link.raw_tp, RawTpDirection::None);

        let none = announcement(ChipId::Unrecognized, RawTpDirection::None);
        let link = derive(BusKind::Spi, &none, &spi_slave(Some(RawTpDirection::Bidirectional))).unwrap();
        assert_eq!(link.raw_tp, RawTpDirection::None);
    }

    #[test]
    fn test_chip_mismatch_fails() {
        let expecting_s3 = announcement(ChipId::Esp32S3, RawTpDirection::None);
        assert_eq!(
            derive(BusKind::Spi, &expecting_s3, &spi_slave(None)),
            Err(HandshakeError::ChipMismatch {
                expected: ChipId::Esp32S3,
                reported: ChipId::Esp32C6,
            })
        );
    }

    #[test]
    fn test_state_machine_confirms() {
        let negotiator = HandshakeNegotiator::new(BusKind::Spi, announcement(ChipId::Esp32C6, RawTpDirection::None));
        assert_eq!(negotiator.state(), HandshakeState::Idle);

        // Responses before the request is sent are ignored.
        assert!(negotiator.on_slave_init(&spi_slave(None)).is_none());
        assert_eq!(negotiator.state(), HandshakeState::Idle);

        negotiator.mark_sent().unwrap();
        assert_eq!(negotiator.state(), HandshakeState::Sent);
        assert!(matches!(negotiator.mark_sent(), Err(HandshakeError::InvalidState(HandshakeState::Sent))));

        let outcome = negotiator.on_slave_init(&spi_slave(None)).unwrap();
        assert!(outcome.is_ok());
        assert_eq!(negotiator.state(), HandshakeState::Confirmed);
        assert!(negotiator.negotiated().unwrap().checksum);

        // A late duplicate does not disturb the confirmed result.
        assert!(negotiator.on_slave_init(&spi_slave(Some(RawTpDirection::None))).is_none());
    }

    #[tokio::test]
    async fn test_wait_times_out_to_failed() {
        let negotiator = HandshakeNegotiator::new(BusKind::Uart, announcement(ChipId::Unrecognized, RawTpDirection::None));
        negotiator.mark_sent().unwrap();

        let result = negotiator.wait(Duration::from_millis(20)).await;
        assert_eq!(result, Err(HandshakeError::Timeout(Duration::from_millis(20))));
        assert_eq!(negotiator.state(), HandshakeState::Failed);

        negotiator.reset();
        assert_eq!(negotiator.state(), HandshakeState::Idle);
    }

    #[tokio::test]
    async fn test_wait_returns_confirmed_link() {
        let negotiator = std::sync::Arc::new(HandshakeNegotiator::new(
            BusKind::Spi,
            announcement(ChipId::Unrecognized, RawTpDirection::Bidirectional),
        ));
        negotiator.mark_sent().unwrap();

        let responder = std::sync::Arc::clone(&negotiator);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            responder.on_slave_init(&spi_slave(Some(RawTpDirection::SlaveToHost)));
        });

        let link = negotiator.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(link.raw_tp, RawTpDirection::SlaveToHost);
    }
}
