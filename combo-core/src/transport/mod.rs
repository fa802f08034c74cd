//! Transport abstraction.
//!
//! The core only needs four things from the link to the chip: open it with a
//! receive handler, close it, send a whole frame and switch chip power.
//!
//! ```text
//! +------------------+
//! |   ChipSession    |
//! +--------+---------+
//!          | send(frame) / set_power(on)
//!          v
//! +--------+---------+        on_receive(frame)
//! |  Transport trait | ──────────────────────────► session inbound path
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! | SerialTransport  |  (feature "native", serialport crate)
//! +------------------+
//! ```
//!
//! Receive handlers are called with one complete frame at a time, channel
//! byte first. Stream transports reassemble frames with a
//! [`StreamDeframer`](crate::protocol::frame::StreamDeframer).

#[cfg(feature = "native")]
pub mod serial;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Handler invoked for every complete inbound frame.
pub type ReceiveHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Link to the chip.
///
/// Methods take `&self`: the session calls them from its worker and from
/// client threads, and implementations synchronise internally.
pub trait Transport: Send + Sync {
    /// Open the link and start delivering inbound frames to `on_receive`.
    fn open(&self, on_receive: ReceiveHandler) -> Result<()>;

    /// Stop delivery and close the link. Closing a closed link is a no-op.
    fn close(&self) -> Result<()>;

    /// Send one complete frame, channel byte first.
    fn send(&self, frame: &[u8]) -> Result<()>;

    /// Switch chip power.
    fn set_power(&self, on: bool) -> Result<()>;
}

/// Modem line used to switch chip power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PowerLine {
    /// Data Terminal Ready.
    #[default]
    Dtr,
    /// Request To Send.
    Rts,
    /// Power is not controlled through the port.
    None,
}

/// Serial link configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read poll interval of the reader thread.
    pub read_timeout: Duration,
    /// Hardware (RTS/CTS) flow control.
    pub hardware_flow_control: bool,
    /// Line that switches chip power.
    pub power_line: PowerLine,
    /// Line level that means "power on".
    pub power_active_high: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(50),
            hardware_flow_control: true,
            power_line: PowerLine::Dtr,
            power_active_high: true,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the reader poll interval.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Enable or disable hardware flow control.
    #[must_use]
    pub fn with_hardware_flow_control(mut self, enabled: bool) -> Self {
        self.hardware_flow_control = enabled;
        self
    }

    /// Select the power line and its active level.
    #[must_use]
    pub fn with_power_line(mut self, line: PowerLine, active_high: bool) -> Self {
        self.power_line = line;
        self.power_active_high = active_high;
        self
    }
}

#[cfg(feature = "native")]
pub use serial::SerialTransport;
