//! Bluetooth HCI command builders and a typed event classifier.
//!
//! Only the pieces the core itself needs are modelled: the commands sent
//! while booting and shutting down the chip, and the two events that carry
//! command credits and responses.
//!
//! ## Command Format (channel [`Channel::BT_CMD`])
//!
//! ```text
//! +-----------+------+-------------------+
//! |  Opcode   | Plen |    Parameters     |
//! +-----------+------+-------------------+
//! | 2 bytes LE| 1    |   plen bytes      |
//! +-----------+------+-------------------+
//! ```
//!
//! ## Event Format (channel [`Channel::BT_EVT`])
//!
//! ```text
//! +------+------+----------------------------------------------+
//! | Code | Plen |                 Parameters                   |
//! +------+------+----------------------------------------------+
//! | 0x0E | n    | NumPkts(1) Opcode(2) Status(1) Return(...)   |
//! | 0x0F | 4    | Status(1) NumPkts(1) Opcode(2)               |
//! +------+------+----------------------------------------------+
//! ```
//!
//! [`Channel::BT_CMD`]: crate::protocol::frame::Channel::BT_CMD
//! [`Channel::BT_EVT`]: crate::protocol::frame::Channel::BT_EVT

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{Error, Result};

/// HCI opcodes used by the core.
pub mod opcode {
    /// HCI_Reset.
    pub const RESET: u16 = 0x0C03;
    /// HCI_Read_Local_Version_Information.
    pub const READ_LOCAL_VERSION: u16 = 0x1001;
    /// Vendor: store a value in the chip file system (device address).
    pub const VS_STORE_IN_FS: u16 = 0xFC22;
    /// Vendor: write one block of a patch or settings file.
    pub const VS_WRITE_FILE_BLOCK: u16 = 0xFC2E;
    /// Vendor: activate downloaded patches and settings.
    pub const VS_SYSTEM_RESET: u16 = 0xFC12;
    /// Vendor: read the result of the power-up self-tests.
    pub const VS_READ_SELFTESTS_RESULT: u16 = 0xFC1B;
    /// Vendor: switch the chip power domains off.
    pub const VS_POWER_SWITCH_OFF: u16 = 0xFD40;
}

/// HCI status codes the core interprets.
pub mod status {
    /// Success.
    pub const SUCCESS: u8 = 0x00;
    /// Command disallowed; returned while self-tests are still running.
    pub const COMMAND_DISALLOWED: u8 = 0x0C;
    /// Invalid parameters; returned for an out-of-sequence file block.
    pub const INVALID_PARAMETERS: u8 = 0x12;
}

/// Event code of Command Complete.
pub const EVT_COMMAND_COMPLETE: u8 = 0x0E;

/// Event code of Command Status.
pub const EVT_COMMAND_STATUS: u8 = 0x0F;

/// User id under which the device address is stored.
pub const DEVICE_ADDRESS_USER_ID: u8 = 0xFE;

/// Largest parameter block an HCI command can carry.
pub const MAX_PARAMS_LEN: usize = 255;

/// Self-test verdict byte meaning "all tests passed".
pub const SELFTEST_PASSED: u8 = 0x00;

/// HCI command builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciCommand {
    opcode: u16,
    params: Vec<u8>,
}

impl HciCommand {
    /// Create a command without parameters.
    pub fn new(opcode: u16) -> Self {
        Self {
            opcode,
            params: Vec::new(),
        }
    }

    /// Create a command with the given parameters.
    pub fn with_params(opcode: u16, params: &[u8]) -> Self {
        Self {
            opcode,
            params: params.to_vec(),
        }
    }

    /// HCI_Reset.
    pub fn reset() -> Self {
        Self::new(opcode::RESET)
    }

    /// HCI_Read_Local_Version_Information.
    pub fn read_local_version() -> Self {
        Self::new(opcode::READ_LOCAL_VERSION)
    }

    /// Store the 6-byte device address in the chip file system.
    pub fn store_device_address(address: [u8; 6]) -> Self {
        let mut cmd = Self::new(opcode::VS_STORE_IN_FS);
        cmd.params.push(DEVICE_ADDRESS_USER_ID);
        cmd.params.push(6);
        cmd.params.extend_from_slice(&address);
        cmd
    }

    /// Write one file block. The block id is the chunk id truncated to a byte.
    pub fn write_file_block(chunk_id: u32, data: &[u8]) -> Self {
        let mut cmd = Self::new(opcode::VS_WRITE_FILE_BLOCK);
        cmd.params.push((chunk_id & 0xFF) as u8);
        cmd.params.extend_from_slice(data);
        cmd
    }

    /// Activate the downloaded patches and settings.
    pub fn system_reset() -> Self {
        Self::new(opcode::VS_SYSTEM_RESET)
    }

    /// Ask for the power-up self-test result.
    pub fn read_selftest_result() -> Self {
        Self::new(opcode::VS_READ_SELFTESTS_RESULT)
    }

    /// Switch the chip power domains off.
    pub fn power_switch_off() -> Self {
        Self::new(opcode::VS_POWER_SWITCH_OFF)
    }

    /// Command opcode.
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    /// Parameter bytes.
    pub fn params(&self) -> &[u8] {
        &self.params
    }

    /// Build the channel payload (opcode, length, parameters).
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.params.len());
        buf.write_u16::<LittleEndian>(self.opcode).unwrap();
        // Parameter blocks are bounded by MAX_PARAMS_LEN at construction sites
        buf.push(self.params.len().min(MAX_PARAMS_LEN) as u8);
        buf.extend_from_slice(&self.params);
        buf
    }
}

/// Opcode of an outbound command payload, if it is long enough to carry one.
pub fn command_opcode(payload: &[u8]) -> Option<u16> {
    (payload.len() >= 2).then(|| LittleEndian::read_u16(&payload[..2]))
}

/// Classified inbound HCI event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HciEvent<'a> {
    /// Command Complete: credits, opcode, status and return parameters.
    CommandComplete {
        /// Number of HCI command packets the chip accepts.
        num_packets: u8,
        /// Opcode of the completed command.
        opcode: u16,
        /// First return parameter, the status of the command.
        status: u8,
        /// Return parameters following the status.
        return_params: &'a [u8],
    },
    /// Command Status: status, credits and opcode.
    CommandStatus {
        /// Command status.
        status: u8,
        /// Number of HCI command packets the chip accepts.
        num_packets: u8,
        /// Opcode of the command.
        opcode: u16,
    },
    /// Any other event.
    Other {
        /// Event code.
        code: u8,
    },
}

impl<'a> HciEvent<'a> {
    /// Classify an event payload (without the channel byte).
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (&code, rest) = payload
            .split_first()
            .ok_or_else(|| Error::Protocol("empty HCI event".into()))?;
        let (&plen, params) = rest
            .split_first()
            .ok_or_else(|| Error::Protocol(format!("HCI event 0x{code:02X} without length")))?;
        if params.len() < usize::from(plen) {
            return Err(Error::Protocol(format!(
                "HCI event 0x{code:02X} truncated: {} of {plen} bytes",
                params.len()
            )));
        }
        let params = &params[..usize::from(plen)];

        match code {
            EVT_COMMAND_COMPLETE => {
                if params.len() < 3 {
                    return Err(Error::Protocol("Command Complete too short".into()));
                }
                // NOP completions (credit updates only) carry no status byte
                let (status, return_params) = match params.get(3) {
                    Some(&status) => (status, &params[4..]),
                    None => (status::SUCCESS, &params[3..]),
                };
                Ok(Self::CommandComplete {
                    num_packets: params[0],
                    opcode: LittleEndian::read_u16(&params[1..3]),
                    status,
                    return_params,
                })
            },
            EVT_COMMAND_STATUS => {
                if params.len() < 4 {
                    return Err(Error::Protocol("Command Status too short".into()));
                }
                Ok(Self::CommandStatus {
                    status: params[0],
                    num_packets: params[1],
                    opcode: LittleEndian::read_u16(&params[2..4]),
                })
            },
            code => Ok(Self::Other { code }),
        }
    }

    /// Command credits carried by the event.
    pub fn credits(&self) -> Option<u8> {
        match self {
            Self::CommandComplete { num_packets, .. } | Self::CommandStatus { num_packets, .. } => {
                Some(*num_packets)
            },
            Self::Other { .. } => None,
        }
    }

    /// Opcode the event responds to.
    pub fn opcode(&self) -> Option<u16> {
        match self {
            Self::CommandComplete { opcode, .. } | Self::CommandStatus { opcode, .. } => {
                Some(*opcode)
            },
            Self::Other { .. } => None,
        }
    }

    /// Owned response record for the boot sequencer.
    pub fn to_response(&self) -> Option<CommandResponse> {
        match *self {
            Self::CommandComplete {
                opcode,
                status,
                return_params,
                ..
            } => Some(CommandResponse {
                opcode,
                status,
                params: return_params.to_vec(),
            }),
            Self::CommandStatus { opcode, status, .. } => Some(CommandResponse {
                opcode,
                status,
                params: Vec::new(),
            }),
            Self::Other { .. } => None,
        }
    }
}

/// Response to a command, detached from the received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Opcode of the command this answers.
    pub opcode: u16,
    /// Status code.
    pub status: u8,
    /// Return parameters after the status byte.
    pub params: Vec<u8>,
}

impl CommandResponse {
    /// Create a response record.
    pub fn new(opcode: u16, status: u8, params: &[u8]) -> Self {
        Self {
            opcode,
            status,
            params: params.to_vec(),
        }
    }

    /// Whether the status is success.
    pub fn is_success(&self) -> bool {
        self.status == status::SUCCESS
    }
}

/// Build a Command Complete event payload (used by tests and fake chips).
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn command_complete(num_packets: u8, opcode: u16, status: u8, return_params: &[u8]) -> Vec<u8> {
    let mut params = Vec::with_capacity(4 + return_params.len());
    params.push(num_packets);
    params.write_u16::<LittleEndian>(opcode).unwrap();
    params.push(status);
    params.extend_from_slice(return_params);

    let mut event = vec![EVT_COMMAND_COMPLETE, params.len() as u8];
    event.extend_from_slice(&params);
    event
}

/// Build a Command Status event payload (used by tests and fake chips).
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn command_status(status: u8, num_packets: u8, opcode: u16) -> Vec<u8> {
    let mut event = vec![EVT_COMMAND_STATUS, 4, status, num_packets];
    event.write_u16::<LittleEndian>(opcode).unwrap();
    event
}
