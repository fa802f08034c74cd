//! Inbound frame dispatch.
//!
//! Frames are classified once ([`FrameClass`]) so flow control, the boot
//! sequencer and the router all look at the same parse. Routing then picks
//! the receiving client in this order:
//!
//! 1. the raw channel client, when one is open (it sees everything);
//! 2. an audio-shadow client whose pending request the frame answers;
//! 3. the cached most recent primary user of an owner channel;
//! 4. the primary client found by scanning the owner channels.
//!
//! A frame nobody claims is [`Route::Unclaimed`]. Events on
//! [`Channel::BT_EVT`] are owned by a BT_EVT client and fall back to the
//! BT_CMD client; every other channel is owned by its own clients.

use std::collections::HashMap;
use std::iter;

use log::{debug, trace};

use crate::flow::Flow;
use crate::protocol::frame::Channel;
use crate::protocol::hci::{CommandResponse, HciEvent};
use crate::protocol::radio::RadioEvent;
use crate::registry::{ChannelRegistry, ClientId, LogicalClient};

/// Classification of an inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameClass {
    /// HCI Command Complete or Command Status.
    HciResponse {
        /// Command credits granted.
        credits: u8,
        /// Opcode, status and return parameters.
        response: CommandResponse,
    },
    /// Radio command completion; releases the radio flow.
    RadioComplete {
        /// Command id that completed.
        opcode: u16,
    },
    /// Radio interrupt; releases the radio flow and ends any pending request.
    RadioInterrupt,
    /// Anything else, including frames that failed to parse.
    Data,
}

impl FrameClass {
    /// Classify a payload received on `channel`.
    pub fn of(channel: Channel, payload: &[u8]) -> Self {
        match channel {
            Channel::BT_EVT => match HciEvent::parse(payload) {
                Ok(event) => match (event.credits(), event.to_response()) {
                    (Some(credits), Some(response)) => Self::HciResponse { credits, response },
                    _ => Self::Data,
                },
                Err(e) => {
                    trace!("Unclassified event: {e}");
                    Self::Data
                },
            },
            Channel::FM_RADIO => match RadioEvent::parse(payload) {
                Ok(RadioEvent::CommandComplete { opcode, .. }) => Self::RadioComplete { opcode },
                Ok(RadioEvent::Interrupt { .. }) => Self::RadioInterrupt,
                Ok(RadioEvent::Other { .. }) => Self::Data,
                Err(e) => {
                    trace!("Unclassified radio frame: {e}");
                    Self::Data
                },
            },
            _ => Self::Data,
        }
    }

    /// Command id the frame answers, used to match pending requests.
    pub fn response_key(&self) -> Option<u16> {
        match self {
            Self::HciResponse { response, .. } => Some(response.opcode),
            Self::RadioComplete { opcode } => Some(*opcode),
            Self::RadioInterrupt | Self::Data => None,
        }
    }
}

/// Outstanding audio-shadow request on one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    /// The audio-shadow client that sent it.
    pub client: ClientId,
    /// Command id the response will carry.
    pub key: u16,
}

/// Where an inbound frame goes.
#[derive(Debug, Clone)]
pub enum Route {
    /// Whole frame, channel byte included, to the raw client.
    Raw(LogicalClient),
    /// Payload to this client.
    Deliver(LogicalClient),
    /// No client claims the frame.
    Unclaimed,
}

/// Routing state: pending audio-shadow requests per flow.
#[derive(Debug, Default)]
pub struct ChannelRouter {
    pending: HashMap<Flow, PendingRequest>,
}

impl ChannelRouter {
    /// Create a router without pending requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that an audio-shadow client's request went out on `flow`.
    pub fn record_pending(&mut self, flow: Flow, client: ClientId, key: u16) {
        trace!("{}: pending request 0x{key:04X} from {client}", flow.name());
        self.pending.insert(flow, PendingRequest { client, key });
    }

    /// Pending request on `flow`.
    pub fn pending(&self, flow: Flow) -> Option<PendingRequest> {
        self.pending.get(&flow).copied()
    }

    /// Forget the pending request on `flow`.
    pub fn clear_pending(&mut self, flow: Flow) -> Option<PendingRequest> {
        self.pending.remove(&flow)
    }

    /// Forget every pending request of `client`.
    pub fn clear_client(&mut self, client: ClientId) {
        self.pending.retain(|_, p| p.client != client);
    }

    /// Forget all pending requests.
    pub fn clear_all(&mut self) {
        self.pending.clear();
    }

    /// Pick the receiver of a classified frame.
    pub fn route(
        &mut self,
        registry: &mut ChannelRegistry,
        channel: Channel,
        class: &FrameClass,
    ) -> Route {
        if let Some(raw) = registry.primary(Channel::HCI_RAW) {
            return Route::Raw(raw.clone());
        }

        if let Some(flow) = Flow::for_inbound(channel) {
            if let Some(key) = class.response_key() {
                if self.pending(flow).is_some_and(|p| p.key == key) {
                    let shadow = self
                        .pending
                        .remove(&flow)
                        .and_then(|p| registry.get(p.client).cloned());
                    if let Some(shadow) = shadow {
                        trace!("{channel}: response 0x{key:04X} to audio {}", shadow.id());
                        return Route::Deliver(shadow);
                    }
                }
            } else if *class == FrameClass::RadioInterrupt {
                if let Some(p) = self.pending.remove(&flow) {
                    debug!("Interrupt ends pending request 0x{:04X} of {}", p.key, p.client);
                }
            }
        }

        for owner in owner_channels(channel) {
            if let Some(client) = registry.last_user(owner) {
                return Route::Deliver(client.clone());
            }
            if let Some(client) = registry.primary(owner).cloned() {
                registry.set_last_user(owner, client.id());
                return Route::Deliver(client);
            }
        }
        Route::Unclaimed
    }
}

fn owner_channels(channel: Channel) -> impl Iterator<Item = Channel> {
    iter::once(channel).chain((channel == Channel::BT_EVT).then_some(Channel::BT_CMD))
}
