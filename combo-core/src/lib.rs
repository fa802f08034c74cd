//! # combo-core
//!
//! Control core for combo Bluetooth/FM/audio radio chips that share one
//! serial link.
//!
//! The crate multiplexes many logical channels over a single framed
//! transport and owns the chip lifecycle:
//!
//! - Power-up, identification and firmware (patch + settings) download
//! - Self-test polling and orderly power-down
//! - Credit-based flow control for Bluetooth commands and single-request
//!   gating for FM radio commands
//! - Routing of inbound frames to primary, audio-shadow and raw clients
//! - Mirroring of all traffic to an HCI logger client
//!
//! ## Features
//!
//! - `native` (default): serial transport via the `serialport` crate
//! - `serde`: Serialization support for configuration and data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use combo_core::{Channel, ChipSession, ClientCallbacks, DirBlobProvider, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         use combo_core::{SerialConfig, SerialTransport};
//!
//!         let transport = SerialTransport::new(SerialConfig::new("/dev/ttyUSB0", 115_200));
//!         let session = ChipSession::new(
//!             SessionConfig::default(),
//!             Arc::new(transport),
//!             Arc::new(DirBlobProvider::new("/lib/firmware")),
//!         )?;
//!
//!         // Opening the first channel boots the chip
//!         let bt = session.open(
//!             Channel::BT_CMD,
//!             false,
//!             ClientCallbacks::new(|payload| println!("event: {payload:02X?}")),
//!         )?;
//!         session.write(&bt, &[0x03, 0x0C, 0x00])?;
//!
//!         // Closing the last channel powers it down again
//!         session.close(bt)?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blob;
pub mod boot;
pub mod chip;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod flow;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use transport::SerialTransport;
pub use {
    blob::{Blob, BlobKind, BlobProvider, DirBlobProvider, MemoryBlobProvider},
    boot::{BootState, SubBootState},
    chip::{ChipCapabilities, ChipInfo, ChipRevision},
    config::{BootTimings, SelfTestPolicy, SessionConfig},
    endpoints::{ChildEndpointRegistrar, EndpointDescriptor, default_endpoints},
    error::{Error, Result},
    flow::{Flow, FlowStats},
    protocol::frame::Channel,
    registry::{ClientCallbacks, ClientId},
    session::{ChipSession, ClientHandle},
    transport::{PowerLine, ReceiveHandler, SerialConfig, Transport},
};
