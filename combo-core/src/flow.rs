//! Credit-limited outbound queues.
//!
//! The chip has small internal command queues. Two flows are guarded:
//!
//! - **Bluetooth commands** use counted credits. Every Command Complete or
//!   Command Status event grants the number of further commands the chip can
//!   take; each transmitted command consumes one.
//! - **FM radio control** allows a single outstanding command. The flow is
//!   released by the command-complete or interrupt event that ends it.
//!
//! [`CreditQueue`] is a plain data structure: it decides *what* may be sent
//! and hands those items back to the caller, which performs the transport
//! write outside of any lock.

use std::collections::VecDeque;

use log::trace;

use crate::protocol::frame::Channel;

/// The credit-limited flows of the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    /// Bluetooth HCI commands, answered on the event channel.
    Command,
    /// FM radio control, answered on the same channel.
    Radio,
}

impl Flow {
    /// Flow an outbound frame on `channel` belongs to.
    pub fn for_outbound(channel: Channel) -> Option<Self> {
        match channel {
            Channel::BT_CMD => Some(Self::Command),
            Channel::FM_RADIO => Some(Self::Radio),
            _ => None,
        }
    }

    /// Flow an inbound frame on `channel` answers.
    pub fn for_inbound(channel: Channel) -> Option<Self> {
        match channel {
            Channel::BT_EVT => Some(Self::Command),
            Channel::FM_RADIO => Some(Self::Radio),
            _ => None,
        }
    }

    /// Channel outbound frames of this flow are sent on.
    pub fn channel(self) -> Channel {
        match self {
            Self::Command => Channel::BT_CMD,
            Self::Radio => Channel::FM_RADIO,
        }
    }

    /// Short name for logging.
    pub fn name(self) -> &'static str {
        match self {
            Self::Command => "bt_cmd",
            Self::Radio => "fm_radio",
        }
    }
}

/// How a flow gates transmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditModel {
    /// Numeric credits, several commands may be in flight.
    Counted,
    /// One outstanding command at a time.
    Single,
}

/// Whether a flow currently has a command in flight it is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Transmissions may proceed.
    Idle,
    /// No credit left (counted) or a command is outstanding (single).
    Sending,
}

/// Per-flow counters, mostly useful for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    /// Items handed out for transmission.
    pub sent: u64,
    /// Items that had to wait in the queue.
    pub queued: u64,
    /// Items dropped by [`CreditQueue::purge`].
    pub purged: u64,
}

/// FIFO of pending items gated by credits or a busy flag.
#[derive(Debug)]
pub struct CreditQueue<T> {
    name: &'static str,
    model: CreditModel,
    credits: usize,
    busy: bool,
    queue: VecDeque<T>,
    stats: FlowStats,
}

impl<T> CreditQueue<T> {
    /// Create a counted-credit flow starting with `initial_credits`.
    pub fn counted(name: &'static str, initial_credits: usize) -> Self {
        Self {
            name,
            model: CreditModel::Counted,
            credits: initial_credits,
            busy: false,
            queue: VecDeque::new(),
            stats: FlowStats::default(),
        }
    }

    /// Create a single-outstanding-request flow.
    pub fn single(name: &'static str) -> Self {
        Self {
            name,
            model: CreditModel::Single,
            credits: 0,
            busy: false,
            queue: VecDeque::new(),
            stats: FlowStats::default(),
        }
    }

    /// Credit model of this flow.
    pub fn model(&self) -> CreditModel {
        self.model
    }

    /// Remaining credits (counted flows).
    pub fn credits(&self) -> usize {
        self.credits
    }

    /// Number of items waiting.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Current gate state.
    pub fn state(&self) -> FlowState {
        if self.may_send() {
            FlowState::Idle
        } else {
            FlowState::Sending
        }
    }

    /// Counters.
    pub fn stats(&self) -> FlowStats {
        self.stats
    }

    /// Offer an item for transmission.
    ///
    /// Returns the item back when it may be sent right away; the gate has
    /// already been updated. Otherwise the item is queued behind earlier ones
    /// and `None` is returned.
    pub fn submit(&mut self, item: T) -> Option<T> {
        // Earlier items keep their place even when credit is available
        if self.queue.is_empty() && self.may_send() {
            self.take_gate();
            self.stats.sent += 1;
            trace!("{}: sending immediately ({} credits left)", self.name, self.credits);
            return Some(item);
        }

        self.queue.push_back(item);
        self.stats.queued += 1;
        trace!("{}: queued, {} waiting", self.name, self.queue.len());
        None
    }

    /// Add `n` credits and release as many queued items as they cover.
    ///
    /// Ignored on single-request flows.
    pub fn on_credit_replenished(&mut self, n: usize) -> Vec<T> {
        if self.model != CreditModel::Counted {
            return Vec::new();
        }
        self.credits = self.credits.saturating_add(n);

        let mut released = Vec::new();
        while self.credits > 0 {
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            self.credits -= 1;
            self.stats.sent += 1;
            released.push(item);
        }
        if !released.is_empty() {
            trace!(
                "{}: released {} queued, {} credits left",
                self.name,
                released.len(),
                self.credits
            );
        }
        released
    }

    /// Clear the busy flag and release at most one queued item.
    ///
    /// Ignored on counted flows.
    pub fn on_flow_released(&mut self) -> Option<T> {
        if self.model != CreditModel::Single {
            return None;
        }
        self.busy = false;

        let item = self.queue.pop_front()?;
        self.busy = true;
        self.stats.sent += 1;
        trace!("{}: released next, {} waiting", self.name, self.queue.len());
        Some(item)
    }

    /// Drop every queued item without sending it.
    pub fn purge(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.stats.purged += dropped as u64;
        if dropped > 0 {
            trace!("{}: purged {dropped} queued", self.name);
        }
        dropped
    }

    /// Purge and return the gate to its power-up state.
    pub fn reset(&mut self, initial_credits: usize) -> usize {
        let dropped = self.purge();
        self.busy = false;
        self.credits = match self.model {
            CreditModel::Counted => initial_credits,
            CreditModel::Single => 0,
        };
        dropped
    }

    fn may_send(&self) -> bool {
        match self.model {
            CreditModel::Counted => self.credits > 0,
            CreditModel::Single => !self.busy,
        }
    }

    fn take_gate(&mut self) {
        match self.model {
            CreditModel::Counted => self.credits -= 1,
            CreditModel::Single => self.busy = true,
        }
    }
}
