//! Error types for combo-core.

use std::io;
use thiserror::Error;

use crate::protocol::frame::Channel;

/// Result type for combo-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for combo-core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (transport read/write, blob files).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed or unexpected frame content.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A boot or shutdown sequence is already running; retry later.
    #[error("Busy: {0}")]
    Busy(String),

    /// A bounded wait elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A firmware blob could not be found.
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// A non-audio client already holds the channel.
    #[error("Channel {0} is already open")]
    AlreadyOpen(Channel),

    /// The raw channel holds exclusive access to the chip.
    #[error("Access to channel {0} denied while the raw channel is open")]
    AccessDenied(Channel),

    /// No client owns the channel an inbound frame arrived on.
    #[error("No client found for channel {0}")]
    ClientNotFound(Channel),

    /// The client handle is no longer open.
    #[error("Client is not open")]
    NotOpen,

    /// The chip is not in an operational state.
    #[error("Chip not ready: {0}")]
    ChipNotReady(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Timeout(_))
    }
}
