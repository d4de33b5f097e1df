//! # Host Link
//!
//! Host side of a host-slave link layer that multiplexes WiFi station and
//! soft-AP data, BT HCI, serial RPC, private control messages and
//! raw-throughput test traffic over one physical bus (SPI, SDIO, UART or
//! USB) to an attached wireless co-processor.
//!
//! ## Features
//!
//! - **Priority queuing**: per-priority bounded FIFOs with a counting wake signal
//! - **Channel multiplexing**: one registered consumer per interface type
//! - **Capability handshake**: SLAVE_CONFIG / INIT exchange with chip and raw-throughput negotiation
//! - **Flow control**: slave throttle commands and queue-load watermarks
//! - **Power save**: acknowledged suspend/resume with timeout fallback
//! - **Transport-agnostic**: any [`bus::Bus`] implementation, including the in-memory loopback pair
//!
//! ## Quick Start
//!
//! ```no_run
//! use hostlink::bus::{BusKind, LoopbackBus};
//! use hostlink::sim::{SimulatedSlave, SlaveProfile};
//! use hostlink::{InterfaceType, SendRequest, Transport, TransportConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), hostlink::TransportError> {
//! let (host, slave_end) = LoopbackBus::pair(BusKind::Spi);
//! let _slave = SimulatedSlave::spawn(slave_end, SlaveProfile::for_bus(BusKind::Spi));
//!
//! let transport = Transport::new(Arc::new(host), TransportConfig::default());
//! transport.setup(|link| println!("link up: {}", link.chip)).await?;
//! transport.send(SendRequest::copy_from(InterfaceType::Sta, 0, b"hello"))?;
//! transport.teardown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`] - lifecycle controller and the public send path
//! - [`queue`] - priority queue banks
//! - [`channel`] - channel registry
//! - `pump` - TX/RX pumps and the bus reader
//! - [`handshake`] - capability negotiation
//! - [`power_save`] - suspend/resume coordination
//! - [`flow`] - throttle signal
//! - [`bus`] - bus abstraction and loopback implementation
//! - [`frame`] / [`control`] - wire codecs
//! - [`sim`] - simulated slave firmware

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod bus;
pub mod channel;
pub mod config;
pub mod control;
pub mod flow;
pub mod frame;
pub mod handshake;
pub mod power_save;
mod pump;
pub mod queue;
pub mod raw_tp;
pub mod sim;
pub mod stats;
pub mod transport;

// Re-export main public types for convenience
pub use buffer::{BufferHandle, InterfaceType, OwnerToken};
pub use channel::{ChannelError, ChannelReceiver};
pub use config::TransportConfig;
pub use handshake::{HandshakeState, NegotiatedLink};
pub use power_save::{PowerSaveOutcome, PowerSaveState};
pub use queue::Priority;
pub use stats::TransportStats;
pub use transport::{ChannelHandle, SendRequest, Transport, TransportError};
