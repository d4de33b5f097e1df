pub mod fault_injection;
pub mod loopback;

pub use fault_injection::{BusFault, BusFaultConfig, BusFaultInjector};
pub use loopback::{CapturedFrame, FrameDirection, LoopbackBus, SlaveEnd};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const SDIO_MAX_BUF_SIZE: usize = 1536;
pub const SPI_MAX_BUF_SIZE: usize = 1600;
pub const SPI_HD_MAX_BUF_SIZE: usize = 1600;
pub const UART_MAX_BUF_SIZE: usize = 1600;
pub const USB_MAX_PACKET_SIZE: usize = 512;
// Transfers span up to four bulk packets.
pub const USB_MAX_BUF_SIZE: usize = USB_MAX_PACKET_SIZE * 4;

/// Maximum readiness polls while bringing the link up.
pub const MAX_RETRY_TRANSPORT_ACTIVE: u32 = 100;

pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusKind {
    Sdio,
    Spi,
    SpiHd,
    Uart,
    Usb,
}

impl BusKind {
    pub fn max_frame_size(self) -> usize {
        match self {
            BusKind::Sdio => SDIO_MAX_BUF_SIZE,
            BusKind::Spi => SPI_MAX_BUF_SIZE,
            BusKind::SpiHd => SPI_HD_MAX_BUF_SIZE,
            BusKind::Uart => UART_MAX_BUF_SIZE,
            BusKind::Usb => USB_MAX_BUF_SIZE,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            BusKind::Sdio => 0,
            BusKind::Spi => 1,
            BusKind::SpiHd => 2,
            BusKind::Uart => 3,
            BusKind::Usb => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(BusKind::Sdio),
            1 => Some(BusKind::Spi),
            2 => Some(BusKind::SpiHd),
            3 => Some(BusKind::Uart),
            4 => Some(BusKind::Usb),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sdio" => Some(BusKind::Sdio),
            "spi" => Some(BusKind::Spi),
            "spi-hd" | "spi_hd" | "spihd" => Some(BusKind::SpiHd),
            "uart" => Some(BusKind::Uart),
            "usb" => Some(BusKind::Usb),
            _ => None,
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BusKind::Sdio => "SDIO",
            BusKind::Spi => "SPI",
            BusKind::SpiHd => "SPI-HD",
            BusKind::Uart => "UART",
            BusKind::Usb => "USB",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus not ready")]
    NotReady,
    #[error("bus disconnected")]
    Disconnected,
    #[error("bus I/O error: {0}")]
    Io(String),
    #[error("frame of {len} bytes exceeds bus maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("bus not ready after {0} attempts")]
    ExceededRetries(u32),
}

/// Byte-level contract a physical bus driver (SPI, SDIO, UART, USB or a
/// test double) offers to the link layer.
pub trait Bus: Send + Sync {
    fn kind(&self) -> BusKind;

    fn max_frame_size(&self) -> usize {
        self.kind().max_frame_size()
    }

    fn init(&self) -> BusFuture<'_, Result<(), BusError>>;

    fn deinit(&self) -> BusFuture<'_, ()>;

    /// Write one complete frame. Returns the number of bytes written.
    fn send<'a>(&'a self, frame: &'a [u8]) -> BusFuture<'a, Result<usize, BusError>>;

    /// Read one frame into `buf`. `Ok(0)` means the timeout elapsed.
    fn receive<'a>(
        &'a self,
        buf: &'a mut [u8],
        timeout: Duration,
    ) -> BusFuture<'a, Result<usize, BusError>>;

    fn is_tx_ready(&self) -> bool;

    fn is_rx_ready(&self) -> bool;

    /// Poll readiness up to `max_retries` times, `interval` apart. Returns
    /// the attempt on which the bus became ready.
    fn ensure_ready(&self, max_retries: u32, interval: Duration) -> BusFuture<'_, Result<u32, BusError>> {
        Box::pin(async move {
            let attempts = max_retries.max(1);
            for attempt in 1..=attempts {
                if self.is_tx_ready() && self.is_rx_ready() {
                    debug!(bus = %self.kind(), attempt, "bus ready");
                    return Ok(attempt);
                }
                if attempt < attempts {
                    tokio::time::sleep(interval).await;
                }
            }
            warn!(bus = %self.kind(), attempts, "bus did not become ready");
            Err(BusError::ExceededRetries(attempts))
        })
    }
}
