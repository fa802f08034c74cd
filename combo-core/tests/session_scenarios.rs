//! End-to-end session behaviour against a scripted fake chip.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use combo_core::blob::blob_name;
use combo_core::protocol::frame;
use combo_core::protocol::hci::{self, HciCommand, SELFTEST_PASSED, opcode, status};
use combo_core::protocol::radio;
use combo_core::{
    BlobKind, BootState, BootTimings, Channel, ChildEndpointRegistrar, ChipInfo, ChipSession,
    ClientCallbacks, EndpointDescriptor, Error, Flow, MemoryBlobProvider, ReceiveHandler, Result,
    SelfTestPolicy, SessionConfig, Transport,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Client opcode the fake chip never answers on its own.
const CLIENT_OPCODE: u16 = 0x0C14;

const PG1: ChipInfo = ChipInfo {
    hci_version: 6,
    hci_revision: 0x0101,
    lmp_version: 6,
    manufacturer: 0x0030,
    lmp_subversion: 0x0011,
};

const PG2: ChipInfo = ChipInfo {
    hci_version: 6,
    hci_revision: 0x0200,
    lmp_version: 6,
    manufacturer: 0x0030,
    lmp_subversion: 0x0022,
};

enum Job {
    Sent(Vec<u8>),
    Inject(Vec<u8>),
    Sync(Sender<()>),
}

struct ChipState {
    info: ChipInfo,
    handler: Mutex<Option<ReceiveHandler>>,
    sent: Mutex<Vec<Vec<u8>>>,
    powered: AtomicBool,
    opens: AtomicUsize,
    selftest_busy: AtomicU32,
    silent: Mutex<Vec<u16>>,
}

impl ChipState {
    fn deliver(&self, frame: &[u8]) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(frame);
        }
    }

    fn reply_to(&self, sent: &[u8]) -> Option<Vec<u8>> {
        let (channel, payload) = frame::decode(sent).ok()?;
        if channel != Channel::BT_CMD {
            return None;
        }
        let op = hci::command_opcode(payload)?;
        if self.silent.lock().unwrap().contains(&op) {
            return None;
        }

        let (status, params) = match op {
            opcode::RESET
            | opcode::VS_STORE_IN_FS
            | opcode::VS_WRITE_FILE_BLOCK
            | opcode::VS_SYSTEM_RESET
            | opcode::VS_POWER_SWITCH_OFF => (status::SUCCESS, Vec::new()),
            opcode::READ_LOCAL_VERSION => (status::SUCCESS, self.info.to_local_version().to_vec()),
            opcode::VS_READ_SELFTESTS_RESULT => {
                let busy = self.selftest_busy.load(Ordering::SeqCst);
                if busy == 0 {
                    (status::SUCCESS, vec![SELFTEST_PASSED])
                } else {
                    if busy != u32::MAX {
                        self.selftest_busy.store(busy - 1, Ordering::SeqCst);
                    }
                    (status::COMMAND_DISALLOWED, Vec::new())
                }
            },
            _ => return None,
        };
        Some(frame::encode(
            Channel::BT_EVT,
            &hci::command_complete(1, op, status, &params),
        ))
    }
}

/// Fake chip answering boot and shutdown commands from its own thread.
struct FakeChip {
    state: Arc<ChipState>,
    jobs: Mutex<Sender<Job>>,
}

impl FakeChip {
    fn new(info: ChipInfo) -> Arc<Self> {
        let state = Arc::new(ChipState {
            info,
            handler: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            powered: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            selftest_busy: AtomicU32::new(0),
            silent: Mutex::new(Vec::new()),
        });
        let (jobs, rx) = mpsc::channel();

        let responder = Arc::clone(&state);
        thread::spawn(move || {
            for job in rx {
                match job {
                    Job::Sent(frame) => {
                        if let Some(reply) = responder.reply_to(&frame) {
                            responder.deliver(&reply);
                        }
                    },
                    Job::Inject(frame) => responder.deliver(&frame),
                    Job::Sync(ack) => {
                        let _ = ack.send(());
                    },
                }
            }
        });

        Arc::new(Self {
            state,
            jobs: Mutex::new(jobs),
        })
    }

    fn push(&self, job: Job) {
        let _ = self.jobs.lock().unwrap().send(job);
    }

    /// Deliver a frame from the chip.
    fn inject(&self, channel: Channel, payload: &[u8]) {
        self.push(Job::Inject(frame::encode(channel, payload)));
    }

    /// Wait until every earlier job has been handled.
    fn sync(&self) {
        let (ack, done) = mpsc::channel();
        self.push(Job::Sync(ack));
        done.recv_timeout(RECV_TIMEOUT).unwrap();
    }

    fn sent(&self) -> Vec<Vec<u8>> {
        self.state.sent.lock().unwrap().clone()
    }

    fn sent_count(&self) -> usize {
        self.state.sent.lock().unwrap().len()
    }

    fn sent_since(&self, mark: usize) -> Vec<Vec<u8>> {
        self.state.sent.lock().unwrap()[mark..].to_vec()
    }

    fn sent_opcodes(&self) -> Vec<u16> {
        self.sent()
            .iter()
            .filter(|f| f.first() == Some(&Channel::BT_CMD.id()))
            .filter_map(|f| hci::command_opcode(&f[1..]))
            .collect()
    }

    fn is_powered(&self) -> bool {
        self.state.powered.load(Ordering::SeqCst)
    }

    fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.state.handler.lock().unwrap().is_some()
    }

    fn set_selftest_busy(&self, answers: u32) {
        self.state.selftest_busy.store(answers, Ordering::SeqCst);
    }

    fn silence(&self, op: u16) {
        self.state.silent.lock().unwrap().push(op);
    }
}

impl Transport for FakeChip {
    fn open(&self, on_receive: ReceiveHandler) -> Result<()> {
        *self.state.handler.lock().unwrap() = Some(on_receive);
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        *self.state.handler.lock().unwrap() = None;
        Ok(())
    }

    fn send(&self, frame: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Io(std::io::Error::other("fake chip link closed")));
        }
        self.state.sent.lock().unwrap().push(frame.to_vec());
        self.push(Job::Sent(frame.to_vec()));
        Ok(())
    }

    fn set_power(&self, on: bool) -> Result<()> {
        self.state.powered.store(on, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingRegistrar {
    registered: Mutex<Vec<EndpointDescriptor>>,
    unregistered: AtomicBool,
}

impl ChildEndpointRegistrar for RecordingRegistrar {
    fn register(&self, endpoints: &[EndpointDescriptor]) -> Result<()> {
        self.registered.lock().unwrap().extend_from_slice(endpoints);
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        self.unregistered.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> SessionConfig {
    SessionConfig::new()
        .with_timings(BootTimings {
            command_timeout_ms: 300,
            open_timeout_ms: 5_000,
            close_timeout_ms: 3_000,
            shutdown_deadline_ms: 2_000,
            power_off_settle_ms: 1,
        })
        .with_self_test(SelfTestPolicy {
            initial_delay_ms: 1,
            retry_delay_ms: 1,
            retry_step_ms: 0,
            max_retries: 5,
        })
}

fn blobs_for(info: &ChipInfo) -> MemoryBlobProvider {
    let config = config();
    let name = |kind| blob_name(&config.blob_prefix, &config.blob_extension, info, kind);
    MemoryBlobProvider::new()
        .with(name(BlobKind::Patch), vec![0xA5; 600])
        .with(name(BlobKind::Settings), vec![0x5A; 100])
}

fn session_with(chip: &Arc<FakeChip>, config: SessionConfig, blobs: MemoryBlobProvider) -> ChipSession {
    init_logger();
    ChipSession::new(config, Arc::clone(chip) as Arc<dyn Transport>, Arc::new(blobs)).unwrap()
}

fn session(chip: &Arc<FakeChip>) -> ChipSession {
    session_with(chip, config(), blobs_for(&chip.state.info))
}

/// Callbacks that forward every payload into a channel.
fn collector() -> (ClientCallbacks, Receiver<Vec<u8>>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let callbacks = ClientCallbacks::new(move |payload| {
        let _ = tx.lock().unwrap().send(payload.to_vec());
    });
    (callbacks, rx)
}

fn ignore() -> ClientCallbacks {
    ClientCallbacks::new(|_| {})
}

fn client_command(op: u16) -> Vec<u8> {
    HciCommand::new(op).build()
}

#[test]
fn open_boots_chip_and_downloads_firmware() {
    let chip = FakeChip::new(PG2);
    chip.set_selftest_busy(2);
    let session = session(&chip);

    let handle = session.open(Channel::BT_CMD, false, ignore()).unwrap();

    assert_eq!(session.state(), BootState::Active);
    assert_eq!(session.chip_info(), Some(PG2));
    assert!(chip.is_powered());

    let ops = chip.sent_opcodes();
    assert_eq!(ops[0], opcode::RESET);
    assert_eq!(ops[1], opcode::READ_LOCAL_VERSION);
    // 600-byte patch in three blocks, 100-byte settings in one
    let blocks = ops
        .iter()
        .filter(|&&op| op == opcode::VS_WRITE_FILE_BLOCK)
        .count();
    assert_eq!(blocks, 4);
    let tail: Vec<u16> = ops[ops.len() - 5..].to_vec();
    assert_eq!(
        tail,
        vec![
            opcode::VS_STORE_IN_FS,
            opcode::VS_SYSTEM_RESET,
            opcode::VS_READ_SELFTESTS_RESULT,
            opcode::VS_READ_SELFTESTS_RESULT,
            opcode::VS_READ_SELFTESTS_RESULT,
        ]
    );

    session.close(handle).unwrap();
    assert_eq!(session.state(), BootState::Idle);
    assert!(!chip.is_powered());
    assert!(!chip.is_open());
    assert!(chip.sent_opcodes().ends_with(&[opcode::RESET, opcode::VS_POWER_SWITCH_OFF]));
}

#[test]
fn chip_without_self_test_is_active_before_self_test() {
    let chip = FakeChip::new(PG1);
    let session = session(&chip);

    let handle = session.open(Channel::GNSS, false, ignore()).unwrap();
    assert_eq!(session.state(), BootState::ActiveBeforeSelfTest);
    assert!(!chip.sent_opcodes().contains(&opcode::VS_READ_SELFTESTS_RESULT));

    session.close(handle).unwrap();
    assert_eq!(session.state(), BootState::Idle);
}

#[test]
fn second_open_does_not_reboot() {
    let chip = FakeChip::new(PG1);
    let session = session(&chip);

    let bt = session.open(Channel::BT_CMD, false, ignore()).unwrap();
    let gnss = session.open(Channel::GNSS, false, ignore()).unwrap();
    assert_eq!(chip.opens(), 1);

    session.close(bt).unwrap();
    assert!(session.state().is_active());
    session.close(gnss).unwrap();
    assert_eq!(session.state(), BootState::Idle);

    // A new open boots again from scratch
    let bt = session.open(Channel::BT_CMD, false, ignore()).unwrap();
    assert_eq!(chip.opens(), 2);
    session.close(bt).unwrap();
}

#[test]
fn duplicate_open_is_rejected() {
    let chip = FakeChip::new(PG1);
    let session = session(&chip);

    let bt = session.open(Channel::BT_CMD, false, ignore()).unwrap();
    let again = session.open(Channel::BT_CMD, false, ignore());
    assert!(matches!(again, Err(Error::AlreadyOpen(Channel::BT_CMD))));
    session.close(bt).unwrap();
}

#[test]
fn audio_shadow_receives_its_own_response() {
    let chip = FakeChip::new(PG1);
    let session = session(&chip);

    let (primary_cb, primary_rx) = collector();
    let (audio_cb, audio_rx) = collector();
    let primary = session.open(Channel::BT_CMD, false, primary_cb).unwrap();
    let audio = session.open(Channel::BT_CMD, true, audio_cb).unwrap();

    session.write(&audio, &client_command(0xFC99)).unwrap();
    chip.inject(Channel::BT_EVT, &hci::command_complete(1, 0xFC99, 0, &[0x01]));
    let payload = audio_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(payload, hci::command_complete(1, 0xFC99, 0, &[0x01]));

    // Anything else goes to the channel owner
    chip.inject(Channel::BT_EVT, &hci::command_complete(1, CLIENT_OPCODE, 0, &[]));
    let payload = primary_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(payload, hci::command_complete(1, CLIENT_OPCODE, 0, &[]));
    chip.sync();
    assert!(audio_rx.try_recv().is_err());

    session.close(audio).unwrap();
    session.close(primary).unwrap();
}

#[test]
fn commands_wait_for_credits_in_order() {
    let chip = FakeChip::new(PG1);
    let session = session(&chip);

    let (callbacks, events) = collector();
    let bt = session.open(Channel::BT_CMD, false, callbacks).unwrap();
    let mark = chip.sent_count();

    for op in [0x0C14, 0x0C15, 0x0C16] {
        session.write(&bt, &client_command(op)).unwrap();
    }
    // One credit left over from boot
    assert_eq!(chip.sent_since(mark).len(), 1);
    assert_eq!(session.flow_stats(Flow::Command).queued, 2);

    chip.inject(Channel::BT_EVT, &hci::command_status(0, 1, 0x0C14));
    events.recv_timeout(RECV_TIMEOUT).unwrap();
    chip.sync();
    assert_eq!(chip.sent_since(mark).len(), 2);

    chip.inject(Channel::BT_EVT, &hci::command_status(0, 1, 0x0C15));
    events.recv_timeout(RECV_TIMEOUT).unwrap();
    chip.sync();

    let sent = chip.sent_since(mark);
    let ops: Vec<u16> = sent
        .iter()
        .filter_map(|f| hci::command_opcode(&f[1..]))
        .collect();
    assert_eq!(ops, vec![0x0C14, 0x0C15, 0x0C16]);

    session.close(bt).unwrap();
}

#[test]
fn closing_last_client_purges_queued_commands() {
    let chip = FakeChip::new(PG1);
    let session = session(&chip);

    let bt = session.open(Channel::BT_CMD, false, ignore()).unwrap();
    let gnss = session.open(Channel::GNSS, false, ignore()).unwrap();
    let mark = chip.sent_count();

    for op in [0x0C14, 0x0C15, 0x0C16] {
        session.write(&bt, &client_command(op)).unwrap();
    }
    session.close(bt).unwrap();
    assert_eq!(session.flow_stats(Flow::Command).purged, 2);

    // A late credit finds nothing to send
    chip.inject(Channel::BT_EVT, &hci::command_status(0, 1, 0x0C14));
    chip.sync();
    assert_eq!(chip.sent_since(mark).len(), 1);

    session.close(gnss).unwrap();
}

#[test]
fn radio_commands_are_sent_one_at_a_time() {
    let chip = FakeChip::new(PG1);
    let session = session(&chip);

    let (callbacks, events) = collector();
    let fm = session.open(Channel::FM_RADIO, false, callbacks).unwrap();
    let mark = chip.sent_count();

    session.write(&fm, &radio::command(0x0101, &[0x01])).unwrap();
    session.write(&fm, &radio::command(0x0102, &[0x02])).unwrap();
    assert_eq!(chip.sent_since(mark).len(), 1);

    let done = radio::event(radio::KIND_COMMAND_COMPLETE, 0x0101, &[]);
    chip.inject(Channel::FM_RADIO, &done);
    assert_eq!(events.recv_timeout(RECV_TIMEOUT).unwrap(), done);
    chip.sync();

    let sent = chip.sent_since(mark);
    assert_eq!(sent.len(), 2);
    assert_eq!(radio::command_opcode(&sent[1][1..]), Some(0x0102));

    session.close(fm).unwrap();
}

#[test]
fn reset_notifies_clients_and_invalidates_handles() {
    let chip = FakeChip::new(PG1);
    let session = session(&chip);

    let (reset_tx, reset_rx) = mpsc::channel();
    let reset_tx = Mutex::new(reset_tx);
    let callbacks = ignore().with_reset(move || {
        let _ = reset_tx.lock().unwrap().send(());
    });
    let bt = session.open(Channel::BT_CMD, false, callbacks).unwrap();
    let gnss = session.open(Channel::GNSS, false, ignore()).unwrap();

    session.reset(&bt).unwrap();
    reset_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    assert_eq!(session.state(), BootState::Idle);
    assert!(!chip.is_powered());
    assert!(!session.is_channel_open(Channel::GNSS));
    assert!(matches!(session.write(&bt, &client_command(CLIENT_OPCODE)), Err(Error::NotOpen)));
    assert!(matches!(session.close(gnss), Err(Error::NotOpen)));
}

#[test]
fn missing_firmware_fails_open_and_powers_off() {
    let chip = FakeChip::new(PG2);
    let session = session_with(&chip, config(), MemoryBlobProvider::new());

    let result = session.open(Channel::BT_CMD, false, ignore());
    match result {
        Err(Error::Io(e)) => assert!(e.to_string().contains("could not be started")),
        other => panic!("expected an I/O error, got {other:?}"),
    }
    assert_eq!(session.state(), BootState::Idle);
    assert!(!chip.is_powered());
    assert!(!session.is_channel_open(Channel::BT_CMD));
}

#[test]
fn self_test_that_never_finishes_fails_boot() {
    let chip = FakeChip::new(PG2);
    chip.set_selftest_busy(u32::MAX);
    let session = session(&chip);

    let result = session.open(Channel::BT_CMD, false, ignore());
    assert!(matches!(result, Err(Error::Io(_))));
    assert_eq!(session.state(), BootState::Idle);

    // max_retries "not complete" answers are tolerated, one more fails
    let polls = chip
        .sent_opcodes()
        .iter()
        .filter(|&&op| op == opcode::VS_READ_SELFTESTS_RESULT)
        .count();
    assert_eq!(polls, 6);
}

#[test]
fn unanswered_boot_command_times_out() {
    let chip = FakeChip::new(PG1);
    chip.silence(opcode::READ_LOCAL_VERSION);
    let session = session(&chip);

    let result = session.open(Channel::BT_CMD, false, ignore());
    match result {
        Err(Error::Io(e)) => assert!(e.to_string().contains("no response")),
        other => panic!("expected an I/O error, got {other:?}"),
    }
    assert_eq!(session.state(), BootState::Idle);
    assert!(!chip.is_powered());
}

#[test]
fn raw_client_gets_exclusive_access() {
    let chip = FakeChip::new(PG1);
    let session = session(&chip);

    let (callbacks, frames) = collector();
    let raw = session.open(Channel::HCI_RAW, false, callbacks).unwrap();
    assert!(matches!(
        session.open(Channel::BT_CMD, false, ignore()),
        Err(Error::AccessDenied(Channel::BT_CMD))
    ));

    let mark = chip.sent_count();
    let frame = frame::encode(Channel::BT_CMD, &client_command(CLIENT_OPCODE));
    session.write(&raw, &frame).unwrap();
    assert_eq!(chip.sent_since(mark), vec![frame]);

    let event = frame::encode(Channel::BT_EVT, &hci::command_complete(1, CLIENT_OPCODE, 0, &[]));
    chip.inject(Channel::BT_EVT, &hci::command_complete(1, CLIENT_OPCODE, 0, &[]));
    assert_eq!(frames.recv_timeout(RECV_TIMEOUT).unwrap(), event);

    session.close(raw).unwrap();
}

#[test]
fn logger_sees_traffic_in_both_directions() {
    let chip = FakeChip::new(PG1);
    let session = session(&chip);

    let (logger_cb, logged) = collector();
    let logger = session.open(Channel::HCI_LOGGER, false, logger_cb).unwrap();
    let (bt_cb, events) = collector();
    let bt = session.open(Channel::BT_CMD, false, bt_cb).unwrap();

    let command = client_command(CLIENT_OPCODE);
    session.write(&bt, &command).unwrap();
    let mut expected = vec![0x00, Channel::BT_CMD.id()];
    expected.extend_from_slice(&command);
    assert_eq!(logged.recv_timeout(RECV_TIMEOUT).unwrap(), expected);

    let event = hci::command_complete(1, CLIENT_OPCODE, 0, &[]);
    chip.inject(Channel::BT_EVT, &event);
    assert_eq!(events.recv_timeout(RECV_TIMEOUT).unwrap(), event);
    let mut expected = vec![0x01, Channel::BT_EVT.id()];
    expected.extend_from_slice(&event);
    assert_eq!(logged.recv_timeout(RECV_TIMEOUT).unwrap(), expected);

    session.close(bt).unwrap();
    session.close(logger).unwrap();
}

#[test]
fn unclaimed_frames_are_dropped() {
    let chip = FakeChip::new(PG1);
    let session = session(&chip);

    let (callbacks, events) = collector();
    let gnss = session.open(Channel::GNSS, false, callbacks).unwrap();

    chip.inject(Channel::DEBUG, &[0x01, 0x02]);
    chip.inject(Channel::GNSS, &[0x03]);
    assert_eq!(events.recv_timeout(RECV_TIMEOUT).unwrap(), vec![0x03]);
    assert!(events.try_recv().is_err());

    session.close(gnss).unwrap();
}

#[test]
fn attach_identifies_and_registers_endpoints() {
    let chip = FakeChip::new(PG2);
    let session = session(&chip);
    let registrar = Arc::new(RecordingRegistrar::default());

    let info = session
        .attach(Arc::clone(&registrar) as Arc<dyn ChildEndpointRegistrar>)
        .unwrap();
    assert_eq!(info, PG2);
    assert_eq!(session.state(), BootState::Idle);
    assert!(!chip.is_powered());
    assert_eq!(registrar.registered.lock().unwrap().len(), 13);

    // Identification does not download firmware
    assert!(!chip.sent_opcodes().contains(&opcode::VS_WRITE_FILE_BLOCK));

    let again = session.attach(Arc::clone(&registrar) as Arc<dyn ChildEndpointRegistrar>);
    assert!(matches!(again, Err(Error::Busy(_))));

    session.detach().unwrap();
    assert!(registrar.unregistered.load(Ordering::SeqCst));
}

#[test]
fn dropping_session_powers_chip_off() {
    let chip = FakeChip::new(PG1);
    let session = session(&chip);

    let _bt = session.open(Channel::BT_CMD, false, ignore()).unwrap();
    assert!(chip.is_powered());
    drop(session);
    assert!(!chip.is_powered());
}
