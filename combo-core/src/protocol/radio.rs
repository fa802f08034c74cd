//! FM radio-control envelope.
//!
//! The core does not interpret FM commands; it only needs the command id of
//! outbound frames (to match responses) and the kind of inbound frames (to
//! release the single-outstanding-request gate).
//!
//! ```text
//! +------+------+-----------+-------------------+
//! | Plen | Kind |  Opcode   |       Data        |
//! +------+------+-----------+-------------------+
//! | 1    | 1    | 2 bytes LE|   plen - 3 bytes  |
//! +------+------+-----------+-------------------+
//! ```

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};

/// Kind byte of an outbound legacy FM command.
pub const KIND_LEGACY_COMMAND: u8 = 0xFE;

/// Kind byte of an inbound command-complete event.
pub const KIND_COMMAND_COMPLETE: u8 = 0x00;

/// Kind byte of an inbound interrupt event.
pub const KIND_INTERRUPT: u8 = 0x01;

/// Build an outbound radio command payload.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn command(opcode: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.push((3 + data.len()).min(usize::from(u8::MAX)) as u8);
    buf.push(KIND_LEGACY_COMMAND);
    buf.write_u16::<LittleEndian>(opcode).unwrap();
    buf.extend_from_slice(data);
    buf
}

/// Build an inbound event payload (used by tests and fake chips).
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn event(kind: u8, opcode: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.push((3 + data.len()).min(usize::from(u8::MAX)) as u8);
    buf.push(kind);
    buf.write_u16::<LittleEndian>(opcode).unwrap();
    buf.extend_from_slice(data);
    buf
}

/// Command id of an outbound radio payload.
pub fn command_opcode(payload: &[u8]) -> Option<u16> {
    if payload.len() >= 4 && payload[1] == KIND_LEGACY_COMMAND {
        Some(LittleEndian::read_u16(&payload[2..4]))
    } else {
        None
    }
}

/// Classified inbound radio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent<'a> {
    /// A command finished; the chip accepts the next one.
    CommandComplete {
        /// Command id that completed.
        opcode: u16,
        /// Response data.
        data: &'a [u8],
    },
    /// Asynchronous interrupt; also ends any outstanding command.
    Interrupt {
        /// Interrupt id.
        irq: u16,
    },
    /// Unrecognised kind.
    Other {
        /// Kind byte.
        kind: u8,
    },
}

impl<'a> RadioEvent<'a> {
    /// Classify an inbound radio payload (without the channel byte).
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        if payload.len() < 2 {
            return Err(Error::Protocol("radio frame too short".into()));
        }
        let plen = usize::from(payload[0]);
        let body = &payload[1..];
        if body.len() < plen {
            return Err(Error::Protocol(format!(
                "radio frame truncated: {} of {plen} bytes",
                body.len()
            )));
        }
        let body = &body[..plen];
        let Some(&kind) = body.first() else {
            return Err(Error::Protocol("radio frame without kind".into()));
        };

        match kind {
            KIND_COMMAND_COMPLETE | KIND_INTERRUPT if body.len() < 3 => {
                Err(Error::Protocol("radio event without opcode".into()))
            },
            KIND_COMMAND_COMPLETE => Ok(Self::CommandComplete {
                opcode: LittleEndian::read_u16(&body[1..3]),
                data: &body[3..],
            }),
            KIND_INTERRUPT => Ok(Self::Interrupt {
                irq: LittleEndian::read_u16(&body[1..3]),
            }),
            kind => Ok(Self::Other { kind }),
        }
    }

    /// Whether this event releases the radio-control flow.
    pub fn releases_flow(&self) -> bool {
        matches!(self, Self::CommandComplete { .. } | Self::Interrupt { .. })
    }
}
