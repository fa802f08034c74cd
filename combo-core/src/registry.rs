//! Bookkeeping of open logical clients.
//!
//! Rules enforced on open:
//!
//! - one primary (non-audio) client per channel;
//! - one audio-shadow client per channel, only on channels that carry a
//!   credit-limited flow (Bluetooth commands, FM radio);
//! - while the raw channel is open, nothing but the logger may be opened.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};
use crate::flow::Flow;
use crate::protocol::frame::Channel;

/// Identifier of an opened client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

type ReceiveFn = dyn Fn(&[u8]) + Send + Sync;
type ResetFn = dyn Fn() + Send + Sync;

/// Callbacks a client registers when opening a channel.
pub struct ClientCallbacks {
    on_receive: Box<ReceiveFn>,
    on_reset: Box<ResetFn>,
}

impl ClientCallbacks {
    /// Callbacks with a receive handler and no reset handler.
    pub fn new<F>(on_receive: F) -> Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        Self {
            on_receive: Box::new(on_receive),
            on_reset: Box::new(|| {}),
        }
    }

    /// Add a handler invoked when the chip is reset under the client.
    #[must_use]
    pub fn with_reset<F>(mut self, on_reset: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_reset = Box::new(on_reset);
        self
    }

    /// Deliver an inbound payload.
    pub fn deliver(&self, payload: &[u8]) {
        (self.on_receive)(payload);
    }

    /// Notify a chip reset.
    pub fn notify_reset(&self) {
        (self.on_reset)();
    }
}

impl fmt::Debug for ClientCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCallbacks").finish_non_exhaustive()
    }
}

/// One opened channel consumer.
#[derive(Debug, Clone)]
pub struct LogicalClient {
    id: ClientId,
    channel: Channel,
    audio_shadow: bool,
    callbacks: Arc<ClientCallbacks>,
}

impl LogicalClient {
    /// Client id.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Channel the client opened.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Whether this is an audio-shadow client.
    pub fn is_audio_shadow(&self) -> bool {
        self.audio_shadow
    }

    /// Registered callbacks.
    pub fn callbacks(&self) -> &ClientCallbacks {
        &self.callbacks
    }
}

/// Result of removing a client.
#[derive(Debug)]
pub struct ClosedClient {
    /// The removed client.
    pub client: LogicalClient,
    /// No primary client remains on the channel.
    pub last_on_channel: bool,
}

/// Open clients and the most-recent-user cache.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    clients: Vec<LogicalClient>,
    last_user: HashMap<Channel, ClientId>,
    next_id: u64,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a client could be opened, without registering it.
    pub fn check_open(&self, channel: Channel, audio_shadow: bool) -> Result<()> {
        if audio_shadow {
            if Flow::for_outbound(channel).is_none() {
                return Err(Error::AccessDenied(channel));
            }
            if self.audio_shadow(channel).is_some() {
                return Err(Error::AlreadyOpen(channel));
            }
        } else if self.primary(channel).is_some() {
            return Err(Error::AlreadyOpen(channel));
        }

        if channel != Channel::HCI_LOGGER && self.primary(Channel::HCI_RAW).is_some() {
            return Err(Error::AccessDenied(channel));
        }
        Ok(())
    }

    /// Register a client.
    pub fn open(
        &mut self,
        channel: Channel,
        audio_shadow: bool,
        callbacks: Arc<ClientCallbacks>,
    ) -> Result<ClientId> {
        self.check_open(channel, audio_shadow)?;

        self.next_id += 1;
        let id = ClientId(self.next_id);
        self.clients.push(LogicalClient {
            id,
            channel,
            audio_shadow,
            callbacks,
        });
        if !audio_shadow {
            self.last_user.insert(channel, id);
        }
        debug!(
            "Opened {id} on {channel}{}",
            if audio_shadow { " (audio)" } else { "" }
        );
        Ok(id)
    }

    /// Remove a client.
    pub fn close(&mut self, id: ClientId) -> Option<ClosedClient> {
        let index = self.clients.iter().position(|c| c.id == id)?;
        let client = self.clients.remove(index);

        if self.last_user.get(&client.channel) == Some(&id) {
            self.last_user.remove(&client.channel);
        }
        let last_on_channel = self.primary(client.channel).is_none();
        debug!("Closed {id} on {}", client.channel);

        Some(ClosedClient {
            client,
            last_on_channel,
        })
    }

    /// Remove every client, e.g. on a chip reset.
    pub fn drain(&mut self) -> Vec<LogicalClient> {
        self.last_user.clear();
        std::mem::take(&mut self.clients)
    }

    /// Look a client up.
    pub fn get(&self, id: ClientId) -> Option<&LogicalClient> {
        self.clients.iter().find(|c| c.id == id)
    }

    /// Whether a primary client has the channel open.
    pub fn is_channel_open(&self, channel: Channel) -> bool {
        self.primary(channel).is_some()
    }

    /// Primary client of a channel.
    pub fn primary(&self, channel: Channel) -> Option<&LogicalClient> {
        self.clients
            .iter()
            .find(|c| c.channel == channel && !c.audio_shadow)
    }

    /// Audio-shadow client of a channel.
    pub fn audio_shadow(&self, channel: Channel) -> Option<&LogicalClient> {
        self.clients
            .iter()
            .find(|c| c.channel == channel && c.audio_shadow)
    }

    /// Most recent primary user of a channel, if cached.
    pub fn last_user(&self, channel: Channel) -> Option<&LogicalClient> {
        let id = *self.last_user.get(&channel)?;
        self.get(id).filter(|c| !c.audio_shadow)
    }

    /// Remember the most recent primary user of a channel.
    pub fn set_last_user(&mut self, channel: Channel, id: ClientId) {
        self.last_user.insert(channel, id);
    }

    /// Number of open clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is open.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// All open clients.
    pub fn clients(&self) -> impl Iterator<Item = &LogicalClient> {
        self.clients.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callbacks() -> Arc<ClientCallbacks> {
        Arc::new(ClientCallbacks::new(|_| {}))
    }

    #[test]
    fn test_second_primary_is_rejected() {
        let mut registry = ChannelRegistry::new();
        registry.open(Channel::BT_CMD, false, callbacks()).unwrap();
        assert!(matches!(
            registry.open(Channel::BT_CMD, false, callbacks()),
            Err(Error::AlreadyOpen(Channel::BT_CMD))
        ));
    }

    #[test]
    fn test_one_audio_shadow_coexists_with_primary() {
        let mut registry = ChannelRegistry::new();
        let primary = registry.open(Channel::BT_CMD, false, callbacks()).unwrap();
        let shadow = registry.open(Channel::BT_CMD, true, callbacks()).unwrap();
        assert_ne!(primary, shadow);
        assert_eq!(registry.primary(Channel::BT_CMD).unwrap().id(), primary);
        assert_eq!(registry.audio_shadow(Channel::BT_CMD).unwrap().id(), shadow);

        assert!(matches!(
            registry.open(Channel::BT_CMD, true, callbacks()),
            Err(Error::AlreadyOpen(_))
        ));
    }

    #[test]
    fn test_audio_shadow_needs_flow_channel() {
        let mut registry = ChannelRegistry::new();
        assert!(matches!(
            registry.open(Channel::BT_ACL, true, callbacks()),
            Err(Error::AccessDenied(_))
        ));
        assert!(registry.open(Channel::FM_RADIO, true, callbacks()).is_ok());
    }

    #[test]
    fn test_raw_channel_excludes_all_but_logger() {
        let mut registry = ChannelRegistry::new();
        registry.open(Channel::HCI_RAW, false, callbacks()).unwrap();
        assert!(matches!(
            registry.open(Channel::BT_CMD, false, callbacks()),
            Err(Error::AccessDenied(Channel::BT_CMD))
        ));
        assert!(matches!(
            registry.open(Channel::HCI_RAW, false, callbacks()),
            Err(Error::AlreadyOpen(_))
        ));
        assert!(registry.open(Channel::HCI_LOGGER, false, callbacks()).is_ok());
    }

    #[test]
    fn test_close_reports_last_primary() {
        let mut registry = ChannelRegistry::new();
        let primary = registry.open(Channel::FM_RADIO, false, callbacks()).unwrap();
        let shadow = registry.open(Channel::FM_RADIO, true, callbacks()).unwrap();

        let closed = registry.close(shadow).unwrap();
        assert!(!closed.last_on_channel);

        let closed = registry.close(primary).unwrap();
        assert!(closed.last_on_channel);
        assert!(!registry.is_channel_open(Channel::FM_RADIO));
        assert!(registry.close(primary).is_none());
    }

    #[test]
    fn test_last_user_cache() {
        let mut registry = ChannelRegistry::new();
        let id = registry.open(Channel::GNSS, false, callbacks()).unwrap();
        assert_eq!(registry.last_user(Channel::GNSS).unwrap().id(), id);

        registry.close(id);
        assert!(registry.last_user(Channel::GNSS).is_none());

        let again = registry.open(Channel::GNSS, false, callbacks()).unwrap();
        assert_ne!(again, id);
    }

    #[test]
    fn test_drain_empties_registry() {
        let mut registry = ChannelRegistry::new();
        registry.open(Channel::BT_CMD, false, callbacks()).unwrap();
        registry.open(Channel::BT_EVT, false, callbacks()).unwrap();
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        assert!(registry.last_user(Channel::BT_CMD).is_none());
    }
}
