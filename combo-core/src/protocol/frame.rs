//! Channel framing used on the shared transport.
//!
//! Every frame exchanged with the chip starts with a one-byte channel id
//! followed by the channel payload:
//!
//! ```text
//! +---------+---------------------------+
//! | Channel |          Payload          |
//! +---------+---------------------------+
//! | 1 byte  |         variable          |
//! +---------+---------------------------+
//! ```
//!
//! Packet-oriented transports deliver one frame per receive callback and only
//! need [`encode`] and [`decode`]. Stream transports (UART) additionally run a
//! [`StreamDeframer`], which knows where each channel keeps its length field.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use crate::error::{Error, Result};

/// Logical traffic class carried in the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Channel(pub u8);

impl Channel {
    /// Bluetooth HCI commands (host to chip).
    pub const BT_CMD: Self = Self(0x01);
    /// Bluetooth ACL data.
    pub const BT_ACL: Self = Self(0x02);
    /// Bluetooth HCI events (chip to host).
    pub const BT_EVT: Self = Self(0x04);
    /// FM radio control.
    pub const FM_RADIO: Self = Self(0x08);
    /// GNSS traffic.
    pub const GNSS: Self = Self(0x09);
    /// Chip debug output.
    pub const DEBUG: Self = Self(0x0B);
    /// Vendor tools channel.
    pub const STE_TOOLS: Self = Self(0x0D);
    /// HCI traffic logger.
    pub const HCI_LOGGER: Self = Self(0xFA);
    /// User-space control.
    pub const US_CTRL: Self = Self(0xFC);
    /// Core keep-alive channel.
    pub const CORE: Self = Self(0xFD);
    /// Raw passthrough with exclusive access to the chip.
    pub const HCI_RAW: Self = Self(0xFE);

    /// Raw channel id.
    pub fn id(self) -> u8 {
        self.0
    }

    /// Short human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::BT_CMD => "bt_cmd",
            Self::BT_ACL => "bt_acl",
            Self::BT_EVT => "bt_evt",
            Self::FM_RADIO => "fm_radio",
            Self::GNSS => "gnss",
            Self::DEBUG => "debug",
            Self::STE_TOOLS => "ste_tools",
            Self::HCI_LOGGER => "hci_logger",
            Self::US_CTRL => "us_ctrl",
            Self::CORE => "core",
            Self::HCI_RAW => "hci_raw",
            _ => "unknown",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), self.0)
    }
}

impl From<u8> for Channel {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Prepend the channel id to `payload`.
pub fn encode(channel: Channel, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(channel.0);
    frame.extend_from_slice(payload);
    frame
}

/// Split the channel id off a received frame.
pub fn decode(frame: &[u8]) -> Result<(Channel, &[u8])> {
    match frame.split_first() {
        Some((&channel, payload)) => Ok((Channel(channel), payload)),
        None => Err(Error::Protocol("empty frame, no channel byte".into())),
    }
}

/// Where a channel keeps its payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LengthRule {
    /// Header bytes after the channel byte, length field included.
    header_len: usize,
    /// Offset of the length field inside the header.
    offset: usize,
    /// Length field is a little-endian u16 instead of a single byte.
    wide: bool,
}

impl LengthRule {
    fn for_channel(channel: Channel) -> Self {
        match channel {
            Channel::BT_CMD => Self { header_len: 3, offset: 2, wide: false },
            Channel::BT_ACL => Self { header_len: 4, offset: 2, wide: true },
            Channel::BT_EVT => Self { header_len: 2, offset: 1, wide: false },
            Channel::FM_RADIO => Self { header_len: 1, offset: 0, wide: false },
            _ => Self { header_len: 2, offset: 0, wide: true },
        }
    }

    fn payload_len(self, header: &[u8]) -> usize {
        if self.wide {
            usize::from(LittleEndian::read_u16(&header[self.offset..self.offset + 2]))
        } else {
            usize::from(header[self.offset])
        }
    }
}

/// Reassembles complete frames from a byte stream.
///
/// Bytes are pushed as they arrive; every complete frame (channel byte
/// included) is returned in arrival order. Partial frames stay buffered.
#[derive(Debug, Default)]
pub struct StreamDeframer {
    buffer: Vec<u8>,
}

impl StreamDeframer {
    /// Create an empty deframer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes and collect the frames they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while let Some(len) = self.complete_frame_len() {
            let frame: Vec<u8> = self.buffer.drain(..len).collect();
            trace!("Deframed {} bytes on channel 0x{:02X}", frame.len(), frame[0]);
            frames.push(frame);
        }
        frames
    }

    /// Bytes currently held waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame, e.g. after the link was re-opened.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn complete_frame_len(&self) -> Option<usize> {
        let (&channel, rest) = self.buffer.split_first()?;
        let rule = LengthRule::for_channel(Channel(channel));
        if rest.len() < rule.header_len {
            return None;
        }
        let total = 1 + rule.header_len + rule.payload_len(&rest[..rule.header_len]);
        (self.buffer.len() >= total).then_some(total)
    }
}
