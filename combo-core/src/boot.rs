//! Boot and shutdown state machine.
//!
//! [`BootSequencer`] is a pure transition function: it is fed
//! [`BootInput`]s (command responses, fetched files, elapsed delays,
//! timeouts) and answers with [`BootAction`]s for the session worker to
//! carry out. It never touches the transport itself.
//!
//! ```text
//!  Idle ──start──► Booting
//!                   NotStarted ─► Identifying ─► FetchingFiles ─► DownloadingPatch
//!                   ─► SendingDeviceId ─► ActivatingSettings ─► [ReadingSelfTest]
//!                   ─► Ready ──► Active | ActiveBeforeSelfTest
//!
//!  Active* ──begin_shutdown──► Closing | Resetting
//!                   Resetting ─► PoweringOff ─► ShutDown ──► Idle
//!
//!  any boot failure ─► Failed ─► shutdown path ─► Idle (error reported)
//! ```

use std::fmt;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::blob::{Blob, BlobKind, blob_name};
use crate::chip::{ChipCapabilities, ChipInfo};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::protocol::hci::{CommandResponse, HciCommand, SELFTEST_PASSED, status};
use crate::transfer::{ChunkAck, FirmwareTransfer};

/// Top-level chip state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootState {
    /// Powered off, no clients.
    Idle,
    /// Boot sequence running.
    Booting,
    /// Operational, self-test verdict read.
    Active,
    /// Operational on a revision without self-test support.
    ActiveBeforeSelfTest,
    /// Shutting down after the last client closed.
    Closing,
    /// Shutting down for a global reset.
    Resetting,
}

impl BootState {
    /// Whether clients may open channels and write.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::ActiveBeforeSelfTest)
    }

    /// Whether a boot or shutdown sequence is running.
    pub fn is_sequencing(self) -> bool {
        matches!(self, Self::Booting | Self::Closing | Self::Resetting)
    }
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Booting => "booting",
            Self::Active => "active",
            Self::ActiveBeforeSelfTest => "active (before self-test)",
            Self::Closing => "closing",
            Self::Resetting => "resetting",
        };
        f.write_str(name)
    }
}

/// Step of the boot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubBootState {
    /// Power applied, waiting for the HCI Reset response.
    NotStarted,
    /// Reading the local version to identify the chip.
    Identifying,
    /// Fetching patch and settings blobs.
    FetchingFiles,
    /// Downloading the patch, then the settings.
    DownloadingPatch,
    /// Storing the device address.
    SendingDeviceId,
    /// Activating patch and settings with a vendor system reset.
    ActivatingSettings,
    /// Polling the self-test result.
    ReadingSelfTest,
    /// Boot finished.
    Ready,
    /// Boot aborted.
    Failed,
}

/// Step of the shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosingSubState {
    /// Waiting for the HCI Reset response.
    Resetting,
    /// Power-switch-off sent, waiting for the response and settle delay.
    PoweringOff,
    /// Transport powered down.
    ShutDown,
}

/// What a boot run should achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Bring the chip up to an operational state.
    Full,
    /// Only read the chip identity, then power down again.
    Identify,
}

/// Event fed to the sequencer.
#[derive(Debug)]
pub enum BootInput {
    /// Response to a command the sequencer sent.
    Response(CommandResponse),
    /// Result of a [`BootAction::FetchFiles`] request: patch and settings.
    Files(Result<(Blob, Blob)>),
    /// A requested [`BootAction::Wait`] elapsed.
    DelayElapsed,
    /// No response arrived in time.
    Timeout,
    /// The transport failed while carrying out an action.
    TransportError(Error),
    /// The overall boot or shutdown deadline passed.
    Deadline,
}

/// Work for the session worker.
#[derive(Debug)]
pub enum BootAction {
    /// Open the transport and power the chip.
    PowerOn,
    /// Send a command on the Bluetooth command channel.
    Send(HciCommand),
    /// Fetch the named blobs and answer with [`BootInput::Files`].
    FetchFiles {
        /// Patch file name.
        patch: String,
        /// Settings file name.
        settings: String,
    },
    /// Wait, then answer with [`BootInput::DelayElapsed`].
    Wait(Duration),
    /// Cut power and close the transport.
    PowerOff,
    /// The chip is identified.
    Identified(ChipInfo),
    /// Boot finished; the chip is in the given operational state.
    Operational(BootState),
    /// Shutdown finished; carries the error that aborted the boot, if any.
    Stopped(Option<Error>),
}

/// Boot and shutdown transition function.
#[derive(Debug)]
pub struct BootSequencer {
    config: SessionConfig,
    mode: BootMode,
    state: BootState,
    sub: SubBootState,
    closing: Option<ClosingSubState>,
    chip: Option<ChipInfo>,
    caps: ChipCapabilities,
    transfer: Option<FirmwareTransfer>,
    pending_settings: Option<Blob>,
    awaiting: Option<u16>,
    selftest_attempts: u32,
    selftest_read: bool,
    failure: Option<Error>,
}

impl BootSequencer {
    /// Create a sequencer for a powered-off chip.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            config: config.clone(),
            mode: BootMode::Full,
            state: BootState::Idle,
            sub: SubBootState::NotStarted,
            closing: None,
            chip: None,
            caps: ChipCapabilities::default(),
            transfer: None,
            pending_settings: None,
            awaiting: None,
            selftest_attempts: 0,
            selftest_read: false,
            failure: None,
        }
    }

    /// Top-level state.
    pub fn state(&self) -> BootState {
        self.state
    }

    /// Boot step.
    pub fn sub_state(&self) -> SubBootState {
        self.sub
    }

    /// Shutdown step, while closing or resetting.
    pub fn closing_state(&self) -> Option<ClosingSubState> {
        self.closing
    }

    /// Identity read during the last boot.
    pub fn chip_info(&self) -> Option<ChipInfo> {
        self.chip
    }

    /// Effective capabilities of the identified chip.
    pub fn capabilities(&self) -> ChipCapabilities {
        self.caps
    }

    /// Opcode of the command whose response is awaited.
    pub fn awaiting(&self) -> Option<u16> {
        self.awaiting
    }

    /// Whether an inbound response with `opcode` belongs to the sequencer.
    pub fn awaits(&self, opcode: u16) -> bool {
        self.state.is_sequencing() && self.awaiting == Some(opcode)
    }

    /// Begin a boot run from `Idle`.
    pub fn start(&mut self, mode: BootMode) -> Result<Vec<BootAction>> {
        if self.state != BootState::Idle {
            return Err(Error::Busy(format!("cannot boot while {}", self.state)));
        }

        info!("Booting chip ({mode:?})");
        self.mode = mode;
        self.state = BootState::Booting;
        self.sub = SubBootState::NotStarted;
        self.closing = None;
        self.caps = ChipCapabilities::default();
        self.transfer = None;
        self.pending_settings = None;
        self.selftest_attempts = 0;
        self.selftest_read = false;
        self.failure = None;

        Ok(vec![BootAction::PowerOn, self.send(HciCommand::reset())])
    }

    /// Begin shutting down an operational chip.
    ///
    /// `target` is [`BootState::Closing`] or [`BootState::Resetting`].
    pub fn begin_shutdown(&mut self, target: BootState) -> Result<Vec<BootAction>> {
        if !self.state.is_active() {
            return Err(Error::Busy(format!("cannot shut down while {}", self.state)));
        }
        if !matches!(target, BootState::Closing | BootState::Resetting) {
            return Err(Error::Busy(format!("{target} is not a shutdown state")));
        }
        info!("Shutting chip down ({target})");
        self.state = target;
        Ok(self.enter_shutdown())
    }

    /// Feed one input and collect the resulting actions.
    pub fn step(&mut self, input: BootInput) -> Vec<BootAction> {
        match self.state {
            BootState::Booting => self.boot_step(input),
            BootState::Closing | BootState::Resetting => self.shutdown_step(input),
            state => {
                debug!("Ignoring {input:?} while {state}");
                Vec::new()
            },
        }
    }

    fn boot_step(&mut self, input: BootInput) -> Vec<BootAction> {
        match input {
            BootInput::Response(response) => {
                if self.awaiting != Some(response.opcode) {
                    debug!("Ignoring stray response to 0x{:04X}", response.opcode);
                    return Vec::new();
                }
                self.awaiting = None;
                self.on_boot_response(&response)
            },
            BootInput::Files(Ok((patch, settings))) if self.sub == SubBootState::FetchingFiles => {
                info!(
                    "Downloading {} ({} bytes) and {} ({} bytes)",
                    patch.name(),
                    patch.len(),
                    settings.name(),
                    settings.len()
                );
                self.sub = SubBootState::DownloadingPatch;
                self.pending_settings = Some(settings);
                self.start_transfer(patch)
            },
            BootInput::Files(Err(e)) => self.fail(e),
            BootInput::Files(Ok(_)) => {
                debug!("Ignoring files in {:?}", self.sub);
                Vec::new()
            },
            BootInput::DelayElapsed if self.sub == SubBootState::ReadingSelfTest => {
                vec![self.send(HciCommand::read_selftest_result())]
            },
            BootInput::DelayElapsed => Vec::new(),
            BootInput::Timeout => match self.awaiting {
                Some(op) => self.fail(Error::Timeout(format!(
                    "no response to command 0x{op:04X} in {:?}",
                    self.sub
                ))),
                None => Vec::new(),
            },
            BootInput::TransportError(e) => self.fail(e),
            BootInput::Deadline => self.fail(Error::Timeout("boot did not finish in time".into())),
        }
    }

    fn on_boot_response(&mut self, response: &CommandResponse) -> Vec<BootAction> {
        if self.sub == SubBootState::ReadingSelfTest {
            return self.on_selftest_response(response);
        }
        if self.sub == SubBootState::DownloadingPatch {
            return self.on_block_ack(response.status);
        }
        if !response.is_success() {
            return self.fail(Error::Protocol(format!(
                "command 0x{:04X} failed with status 0x{:02X} in {:?}",
                response.opcode, response.status, self.sub
            )));
        }

        match self.sub {
            SubBootState::NotStarted => {
                self.sub = SubBootState::Identifying;
                vec![self.send(HciCommand::read_local_version())]
            },
            SubBootState::Identifying => self.on_identified(&response.params),
            SubBootState::SendingDeviceId => {
                self.sub = SubBootState::ActivatingSettings;
                vec![self.send(HciCommand::system_reset())]
            },
            SubBootState::ActivatingSettings => {
                if self.caps.self_test {
                    self.sub = SubBootState::ReadingSelfTest;
                    vec![BootAction::Wait(self.config.self_test.initial_delay())]
                } else {
                    self.ready()
                }
            },
            sub => {
                debug!("Unexpected response in {sub:?}");
                Vec::new()
            },
        }
    }

    fn on_identified(&mut self, params: &[u8]) -> Vec<BootAction> {
        let chip = match ChipInfo::from_local_version(params) {
            Ok(chip) => chip,
            Err(e) => return self.fail(e),
        };
        self.caps = self.config.capabilities.apply(chip.capabilities());
        self.chip = Some(chip);
        info!("Identified {chip}");
        debug!("Capabilities: {:?}", self.caps);

        if self.mode == BootMode::Identify {
            self.state = BootState::Closing;
            let mut actions = vec![BootAction::Identified(chip)];
            actions.extend(self.enter_shutdown());
            return actions;
        }

        let patch = blob_name(
            &self.config.blob_prefix,
            &self.config.blob_extension,
            &chip,
            BlobKind::Patch,
        );
        let settings = blob_name(
            &self.config.blob_prefix,
            &self.config.blob_extension,
            &chip,
            BlobKind::Settings,
        );
        self.sub = SubBootState::FetchingFiles;
        vec![
            BootAction::Identified(chip),
            BootAction::FetchFiles { patch, settings },
        ]
    }

    fn start_transfer(&mut self, blob: Blob) -> Vec<BootAction> {
        let mut transfer = FirmwareTransfer::new(
            blob,
            self.config.chunk_size,
            self.caps.resend_first_chunk,
        );
        let first = transfer.next_chunk();
        self.transfer = Some(transfer);
        match first {
            Some(chunk) => vec![self.send(HciCommand::write_file_block(chunk.id, &chunk.data))],
            None => self.transfer_complete(),
        }
    }

    fn on_block_ack(&mut self, ack_status: u8) -> Vec<BootAction> {
        let Some(transfer) = self.transfer.as_mut() else {
            return self.fail(Error::Protocol("block acknowledged without a transfer".into()));
        };
        match transfer.on_chunk_ack(ack_status) {
            ChunkAck::Next(chunk) => {
                vec![self.send(HciCommand::write_file_block(chunk.id, &chunk.data))]
            },
            ChunkAck::Complete => self.transfer_complete(),
            ChunkAck::Failed(s) => {
                let name = transfer.blob_name().to_string();
                self.fail(Error::Protocol(format!(
                    "{name}: block rejected with status 0x{s:02X}"
                )))
            },
        }
    }

    fn transfer_complete(&mut self) -> Vec<BootAction> {
        if let Some(done) = self.transfer.take() {
            info!("Downloaded {} ({} bytes)", done.blob_name(), done.total());
        }
        if let Some(settings) = self.pending_settings.take() {
            return self.start_transfer(settings);
        }
        self.sub = SubBootState::SendingDeviceId;
        vec![self.send(HciCommand::store_device_address(self.config.device_address))]
    }

    fn on_selftest_response(&mut self, response: &CommandResponse) -> Vec<BootAction> {
        match response.status {
            status::COMMAND_DISALLOWED => {
                self.selftest_attempts += 1;
                if self.selftest_attempts > self.config.self_test.max_retries {
                    return self.fail(Error::Timeout(format!(
                        "self-test not complete after {} polls",
                        self.selftest_attempts
                    )));
                }
                debug!("Self-test still running (poll {})", self.selftest_attempts);
                vec![BootAction::Wait(
                    self.config.self_test.retry_delay(self.selftest_attempts),
                )]
            },
            status::SUCCESS => {
                match response.params.first() {
                    Some(&SELFTEST_PASSED) => info!("Self-test passed"),
                    Some(&verdict) => warn!("Self-test failed with result 0x{verdict:02X}"),
                    None => warn!("Self-test response without a result"),
                }
                self.selftest_read = true;
                self.ready()
            },
            other => self.fail(Error::Protocol(format!(
                "reading self-test result failed with status 0x{other:02X}"
            ))),
        }
    }

    fn ready(&mut self) -> Vec<BootAction> {
        self.sub = SubBootState::Ready;
        self.state = if self.selftest_read {
            BootState::Active
        } else {
            BootState::ActiveBeforeSelfTest
        };
        info!("Chip is {}", self.state);
        vec![BootAction::Operational(self.state)]
    }

    fn fail(&mut self, err: Error) -> Vec<BootAction> {
        error!("Boot failed in {:?}: {err}", self.sub);
        self.sub = SubBootState::Failed;
        self.transfer = None;
        self.pending_settings = None;
        self.failure = Some(err);
        self.state = BootState::Closing;
        self.enter_shutdown()
    }

    fn enter_shutdown(&mut self) -> Vec<BootAction> {
        self.closing = Some(ClosingSubState::Resetting);
        vec![self.send(HciCommand::reset())]
    }

    fn shutdown_step(&mut self, input: BootInput) -> Vec<BootAction> {
        match (self.closing, input) {
            (Some(ClosingSubState::Resetting), BootInput::Response(r))
                if self.awaiting == Some(r.opcode) =>
            {
                self.awaiting = None;
                if !r.is_success() {
                    warn!("Reset during shutdown answered 0x{:02X}", r.status);
                }
                self.closing = Some(ClosingSubState::PoweringOff);
                vec![self.send(HciCommand::power_switch_off())]
            },
            (Some(ClosingSubState::PoweringOff), BootInput::Response(r))
                if self.awaiting == Some(r.opcode) =>
            {
                self.awaiting = None;
                vec![BootAction::Wait(self.config.timings.power_off_settle())]
            },
            (Some(ClosingSubState::PoweringOff), BootInput::DelayElapsed) => self.shut_down(),
            (_, BootInput::Response(r)) => {
                debug!("Ignoring response to 0x{:04X} while shutting down", r.opcode);
                Vec::new()
            },
            (_, BootInput::Timeout) if self.awaiting.is_some() => {
                warn!("Shutdown step timed out, powering off");
                self.shut_down()
            },
            (_, BootInput::TransportError(e)) => {
                warn!("Transport error during shutdown, powering off: {e}");
                self.shut_down()
            },
            (_, BootInput::Deadline) => {
                warn!("Shutdown deadline passed, forcing power off");
                self.shut_down()
            },
            (_, input) => {
                debug!("Ignoring {input:?} while shutting down");
                Vec::new()
            },
        }
    }

    fn shut_down(&mut self) -> Vec<BootAction> {
        self.closing = Some(ClosingSubState::ShutDown);
        self.awaiting = None;
        self.transfer = None;
        self.pending_settings = None;

        let failure = self.failure.take();
        self.state = BootState::Idle;
        self.closing = None;
        info!("Chip powered off");
        vec![BootAction::PowerOff, BootAction::Stopped(failure)]
    }

    fn send(&mut self, cmd: HciCommand) -> BootAction {
        self.awaiting = Some(cmd.opcode());
        BootAction::Send(cmd)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::config::SelfTestPolicy;
    use crate::protocol::hci::opcode;

    const PG1: u16 = 0x0101;
    const PG2: u16 = 0x0200;

    fn chip(revision: u16) -> ChipInfo {
        ChipInfo {
            hci_version: 6,
            hci_revision: revision,
            lmp_version: 6,
            manufacturer: 0x0030,
            lmp_subversion: 0x0011,
        }
    }

    fn ok(op: u16) -> BootInput {
        BootInput::Response(CommandResponse::new(op, status::SUCCESS, &[]))
    }

    /// Answers every command the sequencer sends with success.
    struct Script {
        revision: u16,
        patch: Vec<u8>,
        settings: Vec<u8>,
        selftest_busy: u32,
        blocks: Vec<Vec<u8>>,
        sent: Vec<u16>,
    }

    impl Script {
        fn new(revision: u16) -> Self {
            Self {
                revision,
                patch: vec![0x11; 600],
                settings: vec![0x22; 10],
                selftest_busy: 0,
                blocks: Vec::new(),
                sent: Vec::new(),
            }
        }

        /// Run until the sequencer produces no more inputs to answer.
        fn run(&mut self, seq: &mut BootSequencer, actions: Vec<BootAction>) -> Vec<BootAction> {
            let mut actions: VecDeque<BootAction> = actions.into();
            let mut terminal = Vec::new();
            while let Some(action) = actions.pop_front() {
                let input = match action {
                    BootAction::Send(cmd) => {
                        self.sent.push(cmd.opcode());
                        Some(self.answer(&cmd))
                    },
                    BootAction::FetchFiles { patch, settings } => Some(BootInput::Files(Ok((
                        Blob::new(patch, self.patch.clone()),
                        Blob::new(settings, self.settings.clone()),
                    )))),
                    BootAction::Wait(_) => Some(BootInput::DelayElapsed),
                    other => {
                        terminal.push(other);
                        None
                    },
                };
                if let Some(input) = input {
                    actions.extend(seq.step(input));
                }
            }
            terminal
        }

        fn answer(&mut self, cmd: &HciCommand) -> BootInput {
            let op = cmd.opcode();
            match op {
                opcode::READ_LOCAL_VERSION => {
                    let mut params = vec![status::SUCCESS];
                    params.extend_from_slice(&chip(self.revision).to_local_version());
                    BootInput::Response(CommandResponse::new(op, params[0], &params[1..]))
                },
                opcode::VS_WRITE_FILE_BLOCK => {
                    self.blocks.push(cmd.params()[1..].to_vec());
                    ok(op)
                },
                opcode::VS_READ_SELFTESTS_RESULT if self.selftest_busy > 0 => {
                    self.selftest_busy -= 1;
                    BootInput::Response(CommandResponse::new(op, status::COMMAND_DISALLOWED, &[]))
                },
                opcode::VS_READ_SELFTESTS_RESULT => {
                    BootInput::Response(CommandResponse::new(op, status::SUCCESS, &[SELFTEST_PASSED]))
                },
                _ => ok(op),
            }
        }
    }

    fn is_operational(actions: &[BootAction]) -> Option<BootState> {
        actions.iter().find_map(|a| match a {
            BootAction::Operational(state) => Some(*state),
            _ => None,
        })
    }

    #[test]
    fn test_pg2_boot_reaches_active() {
        let mut seq = BootSequencer::new(&SessionConfig::default());
        let mut script = Script::new(PG2);
        script.selftest_busy = 3;

        let start = seq.start(BootMode::Full).unwrap();
        assert!(matches!(start[0], BootAction::PowerOn));
        let terminal = script.run(&mut seq, start);

        assert_eq!(is_operational(&terminal), Some(BootState::Active));
        assert_eq!(seq.state(), BootState::Active);
        assert_eq!(seq.sub_state(), SubBootState::Ready);
        assert_eq!(seq.chip_info(), Some(chip(PG2)));

        let blocks: Vec<u8> = script.blocks.concat();
        let mut expected = script.patch.clone();
        expected.extend_from_slice(&script.settings);
        assert_eq!(blocks, expected);

        let polls = script
            .sent
            .iter()
            .filter(|&&op| op == opcode::VS_READ_SELFTESTS_RESULT)
            .count();
        assert_eq!(polls, 4);
    }

    #[test]
    fn test_pg1_boot_skips_self_test() {
        let mut seq = BootSequencer::new(&SessionConfig::default());
        let mut script = Script::new(PG1);

        let start = seq.start(BootMode::Full).unwrap();
        let terminal = script.run(&mut seq, start);

        assert_eq!(is_operational(&terminal), Some(BootState::ActiveBeforeSelfTest));
        assert!(!script.sent.contains(&opcode::VS_READ_SELFTESTS_RESULT));
        assert_eq!(
            script.sent.last().copied(),
            Some(opcode::VS_SYSTEM_RESET)
        );
    }

    #[test]
    fn test_boot_order() {
        let mut seq = BootSequencer::new(&SessionConfig::default());
        let mut script = Script::new(PG2);
        script.patch = vec![1; 3];
        script.settings = vec![2; 3];

        let start = seq.start(BootMode::Full).unwrap();
        script.run(&mut seq, start);
        assert_eq!(
            script.sent,
            vec![
                opcode::RESET,
                opcode::READ_LOCAL_VERSION,
                opcode::VS_WRITE_FILE_BLOCK,
                opcode::VS_WRITE_FILE_BLOCK,
                opcode::VS_STORE_IN_FS,
                opcode::VS_SYSTEM_RESET,
                opcode::VS_READ_SELFTESTS_RESULT,
            ]
        );
    }

    #[test]
    fn test_self_test_never_completes_fails_boot() {
        let config = SessionConfig::default();
        let mut seq = BootSequencer::new(&config);
        let mut script = Script::new(PG2);
        script.selftest_busy = u32::MAX;

        let start = seq.start(BootMode::Full).unwrap();
        let terminal = script.run(&mut seq, start);

        assert!(is_operational(&terminal).is_none());
        assert!(matches!(
            terminal.last(),
            Some(BootAction::Stopped(Some(Error::Timeout(_))))
        ));
        let polls = script
            .sent
            .iter()
            .filter(|&&op| op == opcode::VS_READ_SELFTESTS_RESULT)
            .count();
        assert_eq!(polls as u32, config.self_test.max_retries + 1);
        // Shutdown path ran before reporting the failure
        assert!(script.sent.ends_with(&[opcode::RESET, opcode::VS_POWER_SWITCH_OFF]));
        assert_eq!(seq.state(), BootState::Idle);
        assert_eq!(seq.sub_state(), SubBootState::Failed);
    }

    #[test]
    fn test_self_test_retry_bound_is_configurable() {
        let config = SessionConfig::default().with_self_test(SelfTestPolicy {
            max_retries: 2,
            ..SelfTestPolicy::default()
        });
        let mut seq = BootSequencer::new(&config);
        let mut script = Script::new(PG2);
        script.selftest_busy = 2;

        let start = seq.start(BootMode::Full).unwrap();
        let terminal = script.run(&mut seq, start);
        assert_eq!(is_operational(&terminal), Some(BootState::Active));
    }

    #[test]
    fn test_failed_self_test_verdict_is_not_fatal() {
        let mut seq = BootSequencer::new(&SessionConfig::default());
        seq.state = BootState::Booting;
        seq.sub = SubBootState::ReadingSelfTest;
        seq.awaiting = Some(opcode::VS_READ_SELFTESTS_RESULT);

        let actions = seq.step(BootInput::Response(CommandResponse::new(
            opcode::VS_READ_SELFTESTS_RESULT,
            status::SUCCESS,
            &[0x05],
        )));
        assert_eq!(is_operational(&actions), Some(BootState::Active));
    }

    #[test]
    fn test_missing_blob_fails_and_shuts_down() {
        let mut seq = BootSequencer::new(&SessionConfig::default());
        seq.start(BootMode::Full).unwrap();
        seq.step(ok(opcode::RESET));

        let mut params = vec![status::SUCCESS];
        params.extend_from_slice(&chip(PG2).to_local_version());
        let actions = seq.step(BootInput::Response(CommandResponse::new(
            opcode::READ_LOCAL_VERSION,
            params[0],
            &params[1..],
        )));
        let Some(BootAction::FetchFiles { patch, .. }) = actions.get(1) else {
            panic!("expected a fetch, got {actions:?}");
        };
        assert_eq!(patch, "CG2900_0200_0011_patch.fw");

        let actions = seq.step(BootInput::Files(Err(Error::NotFound(patch.clone()))));
        assert!(matches!(&actions[..], [BootAction::Send(cmd)] if cmd.opcode() == opcode::RESET));
        assert_eq!(seq.state(), BootState::Closing);
        assert_eq!(seq.sub_state(), SubBootState::Failed);
    }

    #[test]
    fn test_step_timeout_fails_boot() {
        let mut seq = BootSequencer::new(&SessionConfig::default());
        seq.start(BootMode::Full).unwrap();
        let actions = seq.step(BootInput::Timeout);
        assert_eq!(seq.sub_state(), SubBootState::Failed);
        assert!(matches!(&actions[..], [BootAction::Send(_)]));

        // Shutdown reset also times out: power is cut right away
        let actions = seq.step(BootInput::Timeout);
        assert!(matches!(actions[0], BootAction::PowerOff));
        assert!(matches!(
            actions[1],
            BootAction::Stopped(Some(Error::Timeout(_)))
        ));
        assert_eq!(seq.state(), BootState::Idle);
    }

    #[test]
    fn test_rejected_command_fails_boot() {
        let mut seq = BootSequencer::new(&SessionConfig::default());
        seq.start(BootMode::Full).unwrap();
        seq.step(BootInput::Response(CommandResponse::new(opcode::RESET, 0x01, &[])));
        assert_eq!(seq.sub_state(), SubBootState::Failed);
        assert_ne!(seq.state(), BootState::Active);
    }

    #[test]
    fn test_stray_response_is_ignored() {
        let mut seq = BootSequencer::new(&SessionConfig::default());
        seq.start(BootMode::Full).unwrap();
        assert!(seq.step(ok(opcode::VS_SYSTEM_RESET)).is_empty());
        assert_eq!(seq.awaiting(), Some(opcode::RESET));
        assert!(seq.awaits(opcode::RESET));
    }

    #[test]
    fn test_identify_mode_powers_down_after_version() {
        let mut seq = BootSequencer::new(&SessionConfig::default());
        let mut script = Script::new(PG2);

        let start = seq.start(BootMode::Identify).unwrap();
        let terminal = script.run(&mut seq, start);

        assert!(matches!(terminal[0], BootAction::Identified(info) if info == chip(PG2)));
        assert!(matches!(terminal[1], BootAction::PowerOff));
        assert!(matches!(terminal[2], BootAction::Stopped(None)));
        assert!(!script.sent.contains(&opcode::VS_WRITE_FILE_BLOCK));
        assert_eq!(seq.state(), BootState::Idle);
    }

    #[test]
    fn test_shutdown_sequence() {
        let mut seq = BootSequencer::new(&SessionConfig::default());
        let mut script = Script::new(PG1);
        let start = seq.start(BootMode::Full).unwrap();
        script.run(&mut seq, start);
        script.sent.clear();

        let actions = seq.begin_shutdown(BootState::Closing).unwrap();
        assert_eq!(seq.closing_state(), Some(ClosingSubState::Resetting));
        let terminal = script.run(&mut seq, actions);

        assert_eq!(script.sent, vec![opcode::RESET, opcode::VS_POWER_SWITCH_OFF]);
        assert!(matches!(&terminal[..], [BootAction::PowerOff, BootAction::Stopped(None)]));
        assert_eq!(seq.state(), BootState::Idle);
        assert_eq!(seq.closing_state(), None);
    }

    #[test]
    fn test_shutdown_deadline_forces_idle() {
        let mut seq = BootSequencer::new(&SessionConfig::default());
        seq.state = BootState::Active;
        seq.begin_shutdown(BootState::Resetting).unwrap();
        let actions = seq.step(BootInput::Deadline);
        assert!(matches!(&actions[..], [BootAction::PowerOff, BootAction::Stopped(None)]));
        assert_eq!(seq.state(), BootState::Idle);
    }

    #[test]
    fn test_start_and_shutdown_guards() {
        let mut seq = BootSequencer::new(&SessionConfig::default());
        assert!(matches!(
            seq.begin_shutdown(BootState::Closing),
            Err(Error::Busy(_))
        ));
        seq.start(BootMode::Full).unwrap();
        assert!(matches!(seq.start(BootMode::Full), Err(Error::Busy(_))));
    }

    #[test]
    fn test_pg1_stale_first_block_is_resent() {
        let mut seq = BootSequencer::new(&SessionConfig::default());
        seq.state = BootState::Booting;
        seq.sub = SubBootState::FetchingFiles;
        seq.caps = chip(PG1).capabilities();

        let actions = seq.step(BootInput::Files(Ok((
            Blob::new("p", vec![7u8; 300]),
            Blob::new("s", vec![8u8; 1]),
        ))));
        let [BootAction::Send(first)] = &actions[..] else {
            panic!("expected block 0, got {actions:?}");
        };
        assert_eq!(first.params()[0], 0);

        let actions = seq.step(BootInput::Response(CommandResponse::new(
            opcode::VS_WRITE_FILE_BLOCK,
            status::INVALID_PARAMETERS,
            &[],
        )));
        let [BootAction::Send(resent)] = &actions[..] else {
            panic!("expected block 0 again, got {actions:?}");
        };
        assert_eq!(resent, first);
        assert_eq!(seq.sub_state(), SubBootState::DownloadingPatch);
    }
}
