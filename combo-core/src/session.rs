//! Chip session: the public face of the core.
//!
//! A [`ChipSession`] owns everything that belongs to one attached chip: the
//! boot sequencer, the credit queues, the channel registry and the router.
//!
//! ```text
//!  client threads            worker thread              transport reader
//!  ──────────────            ─────────────              ────────────────
//!  open / close / reset ──► Work queue (mpsc) ──►  BootSequencer::step
//!  write ─┐                                             │ Send / Wait / …
//!         │                                             ▼
//!         └──► CreditQueue ──► outbox ──► tx lock ──► Transport::send
//!                                                       ▲
//!  client callbacks ◄── ChannelRouter ◄── on_frame ◄────┘ (inbound)
//! ```
//!
//! Every boot and shutdown transition runs on the worker; callers of
//! `open()`, `close()` and `reset()` block on a condition variable with a
//! bounded timeout until the sequence they started (or joined) finishes.
//!
//! Frames leave through a FIFO outbox. Whoever holds the transmit lock
//! drains it, so submission order is transmission order even with many
//! producers, and no state lock is held across a transport call.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::blob::{Blob, BlobProvider};
use crate::boot::{BootAction, BootInput, BootMode, BootSequencer, BootState};
use crate::chip::ChipInfo;
use crate::config::SessionConfig;
use crate::endpoints::{ChildEndpointRegistrar, default_endpoints};
use crate::error::{Error, Result};
use crate::flow::{CreditQueue, Flow, FlowStats};
use crate::protocol::frame::{self, Channel};
use crate::protocol::hci::{self, HciCommand};
use crate::protocol::radio;
use crate::registry::{ChannelRegistry, ClientCallbacks, ClientId, LogicalClient};
use crate::router::{ChannelRouter, FrameClass, PendingRequest, Route};
use crate::transport::{ReceiveHandler, Transport};

/// Direction byte of a mirrored frame sent to the chip.
pub const MIRROR_TO_CHIP: u8 = 0x00;

/// Direction byte of a mirrored frame received from the chip.
pub const MIRROR_FROM_CHIP: u8 = 0x01;

/// An opened channel.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    channel: Channel,
    audio_shadow: bool,
}

impl ClientHandle {
    /// Client id.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Opened channel.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Whether the channel was opened as an audio-shadow client.
    pub fn is_audio_shadow(&self) -> bool {
        self.audio_shadow
    }
}

/// Frame waiting in a credit queue.
#[derive(Debug)]
struct Outbound {
    frame: Vec<u8>,
    shadow: Option<PendingRequest>,
}

/// Frame released for transmission.
struct TxFrame {
    ticket: u64,
    frame: Vec<u8>,
    mirror: Option<LogicalClient>,
}

enum Work {
    /// A sequence was started under the state lock; carry out its actions.
    Start { run: u64, actions: Vec<BootAction> },
    /// Input for the running sequence.
    Input(BootInput),
    Exit,
}

struct Shared {
    boot: BootSequencer,
    registry: ChannelRegistry,
    router: ChannelRouter,
    cmd_flow: CreditQueue<Outbound>,
    radio_flow: CreditQueue<Outbound>,
    /// Id of the most recently started sequence.
    run: u64,
    /// Id of the most recently finished sequence.
    finished_run: u64,
    last_failure: Option<(u64, String)>,
    registrar: Option<Arc<dyn ChildEndpointRegistrar>>,
}

impl Shared {
    fn flow_mut(&mut self, flow: Flow) -> &mut CreditQueue<Outbound> {
        match flow {
            Flow::Command => &mut self.cmd_flow,
            Flow::Radio => &mut self.radio_flow,
        }
    }

    fn failure_of(&self, run: u64) -> Option<String> {
        self.last_failure
            .as_ref()
            .filter(|(failed, _)| *failed == run)
            .map(|(_, reason)| reason.clone())
    }

    fn reset_flows(&mut self, initial_credits: usize) {
        let dropped = self.cmd_flow.reset(initial_credits) + self.radio_flow.reset(0);
        if dropped > 0 {
            debug!("Dropped {dropped} queued frames");
        }
        self.router.clear_all();
    }
}

struct Inner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    blobs: Arc<dyn BlobProvider>,
    shared: Mutex<Shared>,
    changed: Condvar,
    outbox: Mutex<VecDeque<TxFrame>>,
    tx: Mutex<()>,
    next_ticket: AtomicU64,
    work: Sender<Work>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbox(&self) -> MutexGuard<'_, VecDeque<TxFrame>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post(&self, work: Work) -> Result<()> {
        self.work
            .send(work)
            .map_err(|_| Error::Io(io::Error::other("session worker has stopped")))
    }

    /// Hand the actions of a freshly started sequence to the worker.
    fn begin_run(&self, shared: &mut Shared, actions: Vec<BootAction>) -> Result<u64> {
        shared.run += 1;
        let run = shared.run;
        self.post(Work::Start { run, actions })?;
        Ok(run)
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, Shared>,
        deadline: Instant,
        what: &str,
    ) -> Result<MutexGuard<'a, Shared>> {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout(format!("{what} did not finish in time")));
        }
        let (guard, _) = self
            .changed
            .wait_timeout(guard, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        Ok(guard)
    }

    /// Wait for a shutdown sequence; a timeout is logged, not returned.
    fn await_stop(&self, mut shared: MutexGuard<'_, Shared>, run: u64, what: &str) -> Result<()> {
        let deadline = Instant::now() + self.config.timings.close_timeout();
        while shared.finished_run < run {
            shared = match self.wait(shared, deadline, what) {
                Ok(shared) => shared,
                Err(e) => {
                    warn!("{e}, continuing as stopped");
                    return Ok(());
                },
            };
        }
        Ok(())
    }

    fn logger(&self, shared: &Shared, channel: Channel) -> Option<LogicalClient> {
        if !self.config.mirror_traffic_to_logger || channel == Channel::HCI_LOGGER {
            return None;
        }
        shared.registry.primary(Channel::HCI_LOGGER).cloned()
    }

    /// Put a frame into the outbox. Called with the state lock held so
    /// the outbox order follows the flow-control decisions.
    fn enqueue(&self, shared: &Shared, frame: Vec<u8>) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mirror = frame
            .first()
            .and_then(|&channel| self.logger(shared, Channel(channel)));
        self.outbox().push_back(TxFrame {
            ticket,
            frame,
            mirror,
        });
        ticket
    }

    /// Release an item a credit queue handed out.
    fn stage(&self, shared: &mut Shared, flow: Flow, item: Outbound) -> u64 {
        if let Some(request) = item.shadow {
            shared.router.record_pending(flow, request.client, request.key);
        }
        self.enqueue(shared, item.frame)
    }

    /// Transmit everything in the outbox.
    ///
    /// Returns the transport error of the frame with ticket `mine`, if this
    /// call sent it. Failures of other frames are logged and the frames
    /// dropped.
    fn flush(&self, mine: Option<u64>) -> Result<()> {
        let mut result = Ok(());
        loop {
            let guard = match self.tx.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                // The holder re-checks the outbox after releasing the lock
                Err(TryLockError::WouldBlock) => return result,
            };

            loop {
                let Some(tx) = self.outbox().pop_front() else {
                    break;
                };
                trace!("TX {} bytes: {:02X?}", tx.frame.len(), tx.frame);
                match self.transport.send(&tx.frame) {
                    Ok(()) => {
                        if let Some(logger) = &tx.mirror {
                            logger.callbacks().deliver(&mirrored(MIRROR_TO_CHIP, &tx.frame));
                        }
                    },
                    Err(e) if Some(tx.ticket) == mine => result = Err(e),
                    Err(e) => warn!("Dropped outbound frame: {e}"),
                }
            }

            drop(guard);
            if self.outbox().is_empty() {
                return result;
            }
        }
    }

    fn send_command(&self, cmd: &HciCommand) -> Result<()> {
        let item = Outbound {
            frame: frame::encode(Channel::BT_CMD, &cmd.build()),
            shadow: None,
        };
        let ticket = {
            let mut shared = self.lock();
            match shared.cmd_flow.submit(item) {
                Some(item) => Some(self.stage(&mut shared, Flow::Command, item)),
                None => None,
            }
        };
        match ticket {
            Some(ticket) => self.flush(Some(ticket)),
            None => {
                trace!("Command 0x{:04X} waits for credit", cmd.opcode());
                Ok(())
            },
        }
    }

    fn power_on(self: &Arc<Self>) -> Result<()> {
        {
            let mut shared = self.lock();
            shared.reset_flows(self.config.initial_command_credits);
        }
        self.outbox().clear();

        let weak = Arc::downgrade(self);
        let handler: ReceiveHandler = Arc::new(move |frame: &[u8]| {
            if let Some(inner) = weak.upgrade() {
                inner.on_frame(frame);
            }
        });
        self.transport.open(handler)?;
        self.transport.set_power(true)
    }

    fn power_off(&self) {
        if let Err(e) = self.transport.set_power(false) {
            warn!("Failed to cut chip power: {e}");
        }
        if let Err(e) = self.transport.close() {
            warn!("Failed to close transport: {e}");
        }
        let mut shared = self.lock();
        shared.reset_flows(self.config.initial_command_credits);
        self.outbox().clear();
    }

    fn fetch_files(&self, patch: &str, settings: &str) -> Result<(Blob, Blob)> {
        let patch = self.blobs.fetch(patch)?;
        let settings = self.blobs.fetch(settings)?;
        Ok((patch, settings))
    }

    fn finish_operational(&self, run: u64) {
        self.lock().finished_run = run;
        self.changed.notify_all();
    }

    fn finish_stopped(&self, run: u64, failure: Option<&Error>) {
        let drained = {
            let mut shared = self.lock();
            shared.router.clear_all();
            shared.registry.drain()
        };
        if !drained.is_empty() {
            info!("Notifying {} clients of the chip reset", drained.len());
        }
        for client in &drained {
            client.callbacks().notify_reset();
        }

        let mut shared = self.lock();
        if let Some(e) = failure {
            shared.last_failure = Some((run, e.to_string()));
        }
        shared.finished_run = run;
        drop(shared);
        self.changed.notify_all();
    }

    /// Inbound path: flow control, boot consumption, routing.
    fn on_frame(&self, raw: &[u8]) {
        let (channel, payload) = match frame::decode(raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping inbound frame: {e}");
                return;
            },
        };
        trace!("RX on {channel}: {payload:02X?}");
        let class = FrameClass::of(channel, payload);

        let mut shared = self.lock();
        let mut staged = false;
        match &class {
            FrameClass::HciResponse { credits, .. } => {
                for item in shared.cmd_flow.on_credit_replenished(usize::from(*credits)) {
                    self.stage(&mut shared, Flow::Command, item);
                    staged = true;
                }
            },
            FrameClass::RadioComplete { .. } | FrameClass::RadioInterrupt => {
                if let Some(item) = shared.radio_flow.on_flow_released() {
                    self.stage(&mut shared, Flow::Radio, item);
                    staged = true;
                }
            },
            FrameClass::Data => {},
        }

        let boot_response = match &class {
            FrameClass::HciResponse { response, .. } if shared.boot.awaits(response.opcode) => {
                Some(response.clone())
            },
            _ => None,
        };
        let delivery = if boot_response.is_none() {
            let shared = &mut *shared;
            let route = shared.router.route(&mut shared.registry, channel, &class);
            Some((route, self.logger(shared, channel)))
        } else {
            None
        };
        drop(shared);

        if staged {
            // Errors of released frames are logged by flush
            let _ = self.flush(None);
        }

        if let Some(response) = boot_response {
            trace!("Response to 0x{:04X} goes to the boot sequence", response.opcode);
            if let Err(e) = self.post(Work::Input(BootInput::Response(response))) {
                warn!("Lost boot response: {e}");
            }
            return;
        }

        let Some((route, mirror)) = delivery else {
            return;
        };
        match route {
            Route::Raw(client) => client.callbacks().deliver(raw),
            Route::Deliver(client) => client.callbacks().deliver(payload),
            Route::Unclaimed => warn!("Dropping frame: {}", Error::ClientNotFound(channel)),
        }
        if let Some(logger) = mirror {
            logger.callbacks().deliver(&mirrored(MIRROR_FROM_CHIP, raw));
        }
    }
}

fn mirrored(direction: u8, frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + 1);
    out.push(direction);
    out.extend_from_slice(frame);
    out
}

fn request_key(flow: Flow, payload: &[u8]) -> Option<u16> {
    match flow {
        Flow::Command => hci::command_opcode(payload),
        Flow::Radio => radio::command_opcode(payload),
    }
}

fn start_failed(reason: &str) -> Error {
    Error::Io(io::Error::other(format!("chip could not be started: {reason}")))
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    Response,
    Delay,
}

/// Runs boot and shutdown sequences on a dedicated thread.
struct Worker {
    inner: Arc<Inner>,
    rx: Receiver<Work>,
    run: u64,
    phase: BootState,
    timer: Option<(Instant, Timer)>,
    deadline: Option<Instant>,
}

impl Worker {
    fn new(inner: Arc<Inner>, rx: Receiver<Work>) -> Self {
        Self {
            inner,
            rx,
            run: 0,
            phase: BootState::Idle,
            timer: None,
            deadline: None,
        }
    }

    fn run(mut self) {
        debug!("Session worker started");
        loop {
            let received = match self.next_wakeup() {
                Some(at) => self
                    .rx
                    .recv_timeout(at.saturating_duration_since(Instant::now())),
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            let input = match received {
                Ok(Work::Start { run, actions }) => {
                    self.run = run;
                    let state = self.inner.lock().boot.state();
                    self.track_phase(state);
                    self.execute(actions);
                    continue;
                },
                Ok(Work::Input(input)) => input,
                Ok(Work::Exit) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => match self.expired() {
                    Some(input) => input,
                    None => continue,
                },
            };
            let actions = self.step(input);
            self.execute(actions);
        }
        debug!("Session worker stopped");
    }

    fn next_wakeup(&self) -> Option<Instant> {
        match (self.timer.map(|(at, _)| at), self.deadline) {
            (Some(timer), Some(deadline)) => Some(timer.min(deadline)),
            (timer, deadline) => timer.or(deadline),
        }
    }

    fn expired(&mut self) -> Option<BootInput> {
        let now = Instant::now();
        if self.deadline.is_some_and(|deadline| now >= deadline) {
            self.deadline = None;
            self.timer = None;
            return Some(BootInput::Deadline);
        }
        match self.timer {
            Some((at, kind)) if now >= at => {
                self.timer = None;
                Some(match kind {
                    Timer::Response => BootInput::Timeout,
                    Timer::Delay => BootInput::DelayElapsed,
                })
            },
            _ => None,
        }
    }

    fn step(&mut self, input: BootInput) -> Vec<BootAction> {
        let (actions, state) = {
            let mut shared = self.inner.lock();
            let actions = shared.boot.step(input);
            (actions, shared.boot.state())
        };
        if !actions.is_empty() {
            self.timer = None;
        }
        self.track_phase(state);
        actions
    }

    fn track_phase(&mut self, state: BootState) {
        if state == self.phase {
            return;
        }
        let timings = &self.inner.config.timings;
        self.deadline = match state {
            BootState::Booting => Some(Instant::now() + timings.open_timeout()),
            BootState::Closing | BootState::Resetting => {
                Some(Instant::now() + timings.shutdown_deadline())
            },
            _ => None,
        };
        self.phase = state;
    }

    fn arm(&mut self, after: Duration, kind: Timer) {
        self.timer = Some((Instant::now() + after, kind));
    }

    fn execute(&mut self, actions: Vec<BootAction>) {
        let mut queue: VecDeque<BootAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            let follow_up = match action {
                BootAction::PowerOn => self.inner.power_on().err().map(BootInput::TransportError),
                BootAction::Send(cmd) => match self.inner.send_command(&cmd) {
                    Ok(()) => {
                        self.arm(self.inner.config.timings.command_timeout(), Timer::Response);
                        None
                    },
                    Err(e) => Some(BootInput::TransportError(e)),
                },
                BootAction::FetchFiles { patch, settings } => {
                    Some(BootInput::Files(self.inner.fetch_files(&patch, &settings)))
                },
                BootAction::Wait(delay) => {
                    self.arm(delay, Timer::Delay);
                    None
                },
                BootAction::PowerOff => {
                    self.inner.power_off();
                    None
                },
                BootAction::Identified(info) => {
                    debug!("Chip identity known: {info}");
                    None
                },
                BootAction::Operational(state) => {
                    debug!("Run {} finished, chip {state}", self.run);
                    self.timer = None;
                    self.inner.finish_operational(self.run);
                    None
                },
                BootAction::Stopped(failure) => {
                    debug!("Run {} finished, chip stopped", self.run);
                    self.timer = None;
                    self.inner.finish_stopped(self.run, failure.as_ref());
                    None
                },
            };

            if let Some(input) = follow_up {
                // The input supersedes whatever the previous step planned
                queue.clear();
                queue.extend(self.step(input));
            }
        }
    }
}

/// Control core of one attached chip.
pub struct ChipSession {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl ChipSession {
    /// Create a session for a powered-off chip and start its worker.
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        blobs: Arc<dyn BlobProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let (work, rx) = mpsc::channel();
        let shared = Shared {
            boot: BootSequencer::new(&config),
            registry: ChannelRegistry::new(),
            router: ChannelRouter::new(),
            cmd_flow: CreditQueue::counted(Flow::Command.name(), config.initial_command_credits),
            radio_flow: CreditQueue::single(Flow::Radio.name()),
            run: 0,
            finished_run: 0,
            last_failure: None,
            registrar: None,
        };
        let inner = Arc::new(Inner {
            config,
            transport,
            blobs,
            shared: Mutex::new(shared),
            changed: Condvar::new(),
            outbox: Mutex::new(VecDeque::new()),
            tx: Mutex::new(()),
            next_ticket: AtomicU64::new(0),
            work,
        });

        let worker = Worker::new(Arc::clone(&inner), rx);
        let handle = thread::Builder::new()
            .name("combo-session".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            inner,
            worker: Some(handle),
        })
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current chip state.
    pub fn state(&self) -> BootState {
        self.inner.lock().boot.state()
    }

    /// Identity read during the last boot or attach.
    pub fn chip_info(&self) -> Option<ChipInfo> {
        self.inner.lock().boot.chip_info()
    }

    /// Counters of a credit-limited flow.
    pub fn flow_stats(&self, flow: Flow) -> FlowStats {
        self.inner.lock().flow_mut(flow).stats()
    }

    /// Whether a primary client has `channel` open.
    pub fn is_channel_open(&self, channel: Channel) -> bool {
        self.inner.lock().registry.is_channel_open(channel)
    }

    /// Open a channel, booting the chip first when it is powered off.
    ///
    /// Blocks while a boot or shutdown sequence runs. A boot that fails is
    /// reported as an I/O error; the chip is powered off again.
    pub fn open(
        &self,
        channel: Channel,
        audio_shadow: bool,
        callbacks: ClientCallbacks,
    ) -> Result<ClientHandle> {
        let timings = self.inner.config.timings;
        let deadline = Instant::now() + timings.open_timeout() + timings.shutdown_deadline();
        let mut shared = self.inner.lock();
        let mut joined: Option<u64> = None;

        loop {
            let state = shared.boot.state();
            if state.is_active() {
                break;
            }
            if let Some(run) = joined.filter(|&run| shared.finished_run >= run) {
                if let Some(reason) = shared.failure_of(run) {
                    return Err(start_failed(&reason));
                }
                joined = None;
            }
            if joined.is_none() {
                match state {
                    BootState::Idle => {
                        shared.registry.check_open(channel, audio_shadow)?;
                        let actions = shared.boot.start(BootMode::Full)?;
                        joined = Some(self.inner.begin_run(&mut shared, actions)?);
                    },
                    BootState::Booting => joined = Some(shared.run),
                    _ => {},
                }
            }
            shared = self.inner.wait(shared, deadline, "open")?;
        }

        let id = shared
            .registry
            .open(channel, audio_shadow, Arc::new(callbacks))?;
        Ok(ClientHandle {
            id,
            channel,
            audio_shadow,
        })
    }

    /// Close a channel. Closing the last client shuts the chip down.
    pub fn close(&self, handle: ClientHandle) -> Result<()> {
        let mut shared = self.inner.lock();
        let closed = shared.registry.close(handle.id).ok_or(Error::NotOpen)?;
        shared.router.clear_client(handle.id);

        if closed.last_on_channel {
            if let Some(flow) = Flow::for_outbound(closed.client.channel()) {
                let dropped = match flow {
                    Flow::Command => shared.cmd_flow.purge(),
                    Flow::Radio => shared.radio_flow.reset(0),
                };
                shared.router.clear_pending(flow);
                if dropped > 0 {
                    debug!("{}: purged {dropped} frames on close", flow.name());
                }
            }
        }

        if !shared.registry.is_empty() || !shared.boot.state().is_active() {
            return Ok(());
        }
        let actions = shared.boot.begin_shutdown(BootState::Closing)?;
        let run = self.inner.begin_run(&mut shared, actions)?;
        self.inner.await_stop(shared, run, "close")
    }

    /// Send a payload on the handle's channel.
    ///
    /// Frames on the Bluetooth command and FM radio channels pass through
    /// their credit queues and may be held back. Raw-channel clients write
    /// whole frames, channel byte included. A transport failure drops the
    /// frame; it is returned here when this call transmitted it.
    pub fn write(&self, handle: &ClientHandle, payload: &[u8]) -> Result<()> {
        let ticket = {
            let mut shared = self.inner.lock();
            let client = shared
                .registry
                .get(handle.id)
                .cloned()
                .ok_or(Error::NotOpen)?;
            let state = shared.boot.state();
            if !state.is_active() {
                return Err(Error::ChipNotReady(format!("chip is {state}")));
            }

            let channel = client.channel();
            if channel == Channel::HCI_RAW {
                frame::decode(payload)?;
                Some(self.inner.enqueue(&shared, payload.to_vec()))
            } else {
                let frame = frame::encode(channel, payload);
                match Flow::for_outbound(channel) {
                    Some(flow) => {
                        let shadow = if client.is_audio_shadow() {
                            request_key(flow, payload).map(|key| PendingRequest {
                                client: client.id(),
                                key,
                            })
                        } else {
                            None
                        };
                        shared
                            .flow_mut(flow)
                            .submit(Outbound { frame, shadow })
                            .map(|item| self.inner.stage(&mut shared, flow, item))
                    },
                    None => Some(self.inner.enqueue(&shared, frame)),
                }
            }
        };

        match ticket {
            Some(ticket) => self.inner.flush(Some(ticket)),
            None => {
                trace!("{}: frame queued", handle.channel);
                Ok(())
            },
        }
    }

    /// Reset the chip: shut it down, notify every client through its reset
    /// callback and invalidate all handles.
    pub fn reset(&self, handle: &ClientHandle) -> Result<()> {
        let mut shared = self.inner.lock();
        if shared.registry.get(handle.id).is_none() {
            return Err(Error::NotOpen);
        }
        info!("Chip reset requested by {}", handle.id);
        let actions = shared.boot.begin_shutdown(BootState::Resetting)?;
        let run = self.inner.begin_run(&mut shared, actions)?;
        self.inner.await_stop(shared, run, "reset")
    }

    /// Identify the chip with a power-up and power-down cycle, then register
    /// its endpoints. Endpoints are registered once per attach.
    pub fn attach(&self, registrar: Arc<dyn ChildEndpointRegistrar>) -> Result<ChipInfo> {
        let timings = self.inner.config.timings;
        let deadline = Instant::now() + timings.open_timeout() + timings.shutdown_deadline();

        let mut shared = self.inner.lock();
        if shared.registrar.is_some() {
            return Err(Error::Busy("chip is already attached".into()));
        }
        let actions = shared.boot.start(BootMode::Identify)?;
        let run = self.inner.begin_run(&mut shared, actions)?;
        while shared.finished_run < run {
            shared = self.inner.wait(shared, deadline, "attach")?;
        }
        if let Some(reason) = shared.failure_of(run) {
            return Err(start_failed(&reason));
        }
        let info = shared
            .boot
            .chip_info()
            .ok_or_else(|| Error::Protocol("chip identity unknown after attach".into()))?;
        drop(shared);

        let endpoints = default_endpoints();
        registrar.register(&endpoints)?;
        info!("Registered {} endpoints for {info}", endpoints.len());
        self.inner.lock().registrar = Some(registrar);
        Ok(info)
    }

    /// Withdraw the endpoints registered by [`attach`](Self::attach).
    pub fn detach(&self) -> Result<()> {
        let registrar = self.inner.lock().registrar.take();
        match registrar {
            Some(registrar) => {
                registrar.unregister()?;
                info!("Unregistered endpoints");
                Ok(())
            },
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ChipSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChipSession")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for ChipSession {
    fn drop(&mut self) {
        let run = {
            let mut shared = self.inner.lock();
            match shared.boot.begin_shutdown(BootState::Closing) {
                Ok(actions) => self.inner.begin_run(&mut shared, actions).ok(),
                Err(_) => None,
            }
        };
        if let Some(run) = run {
            let shared = self.inner.lock();
            let _ = self.inner.await_stop(shared, run, "shutdown on drop");
        }

        let _ = self.inner.post(Work::Exit);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Session worker panicked");
            }
        }

        if self.state() != BootState::Idle {
            warn!("Session dropped while {}, cutting power", self.state());
            let _ = self.inner.transport.set_power(false);
            let _ = self.inner.transport.close();
        }
    }
}
