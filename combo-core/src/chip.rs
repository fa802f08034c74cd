//! Chip identification and revision capabilities.
//!
//! The chip reports its revision through HCI Read Local Version
//! Information. The revision decides which workarounds and boot steps apply.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Version information read from the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChipInfo {
    /// HCI version.
    pub hci_version: u8,
    /// HCI revision; identifies the silicon revision.
    pub hci_revision: u16,
    /// LMP version.
    pub lmp_version: u8,
    /// Manufacturer id.
    pub manufacturer: u16,
    /// LMP sub-version; identifies the ROM firmware.
    pub lmp_subversion: u16,
}

impl ChipInfo {
    /// Length of the return parameters of Read Local Version Information.
    pub const LOCAL_VERSION_LEN: usize = 8;

    /// Parse the return parameters (after the status byte) of Read Local
    /// Version Information.
    pub fn from_local_version(params: &[u8]) -> Result<Self> {
        if params.len() < Self::LOCAL_VERSION_LEN {
            return Err(Error::Protocol(format!(
                "local version response too short: {} bytes",
                params.len()
            )));
        }
        Ok(Self {
            hci_version: params[0],
            hci_revision: LittleEndian::read_u16(&params[1..3]),
            lmp_version: params[3],
            manufacturer: LittleEndian::read_u16(&params[4..6]),
            lmp_subversion: LittleEndian::read_u16(&params[6..8]),
        })
    }

    /// Encode as Read Local Version Information return parameters.
    pub fn to_local_version(&self) -> [u8; Self::LOCAL_VERSION_LEN] {
        let mut buf = [0u8; Self::LOCAL_VERSION_LEN];
        buf[0] = self.hci_version;
        LittleEndian::write_u16(&mut buf[1..3], self.hci_revision);
        buf[3] = self.lmp_version;
        LittleEndian::write_u16(&mut buf[4..6], self.manufacturer);
        LittleEndian::write_u16(&mut buf[6..8], self.lmp_subversion);
        buf
    }

    /// Revision family of this chip.
    pub fn revision(&self) -> ChipRevision {
        ChipRevision::from_hci_revision(self.hci_revision)
    }

    /// Capabilities implied by the revision.
    pub fn capabilities(&self) -> ChipCapabilities {
        self.revision().capabilities()
    }
}

impl fmt::Display for ChipInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (rev 0x{:04X}, subversion 0x{:04X}, manufacturer 0x{:04X})",
            self.revision(),
            self.hci_revision,
            self.lmp_subversion,
            self.manufacturer
        )
    }
}

/// Known silicon revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipRevision {
    /// First production generation.
    Pg1,
    /// Second generation with self-test support.
    Pg2,
    /// Later derivative parts.
    Derivative,
    /// Revision not in the table.
    Unknown(u16),
}

impl ChipRevision {
    /// Map an HCI revision to a family.
    pub fn from_hci_revision(revision: u16) -> Self {
        match revision {
            0x0100 | 0x0101 => Self::Pg1,
            0x0200 => Self::Pg2,
            0x0300..=0x06FF => Self::Derivative,
            other => Self::Unknown(other),
        }
    }

    /// Boot behaviour of this revision.
    pub fn capabilities(self) -> ChipCapabilities {
        match self {
            Self::Pg1 => ChipCapabilities {
                self_test: false,
                resend_first_chunk: true,
            },
            Self::Pg2 | Self::Derivative => ChipCapabilities {
                self_test: true,
                resend_first_chunk: false,
            },
            Self::Unknown(_) => ChipCapabilities::default(),
        }
    }
}

impl fmt::Display for ChipRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pg1 => write!(f, "PG1"),
            Self::Pg2 => write!(f, "PG2"),
            Self::Derivative => write!(f, "Derivative"),
            Self::Unknown(rev) => write!(f, "Unknown(0x{rev:04X})"),
        }
    }
}

/// Revision-dependent boot features.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChipCapabilities {
    /// The chip runs power-up self-tests whose result must be polled.
    pub self_test: bool,
    /// The chip may answer block 0 with a stale-sequence status.
    pub resend_first_chunk: bool,
}

/// Optional overrides applied on top of the revision table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CapabilityOverrides {
    /// Force self-test polling on or off.
    pub self_test: Option<bool>,
    /// Force the block-0 resend workaround on or off.
    pub resend_first_chunk: Option<bool>,
}

impl CapabilityOverrides {
    /// Apply the overrides.
    pub fn apply(&self, caps: ChipCapabilities) -> ChipCapabilities {
        ChipCapabilities {
            self_test: self.self_test.unwrap_or(caps.self_test),
            resend_first_chunk: self.resend_first_chunk.unwrap_or(caps.resend_first_chunk),
        }
    }
}
