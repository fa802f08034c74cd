//! Child endpoints exposed once the chip has been identified.
//!
//! After the first identify-and-power-down cycle, the session hands the list
//! of logical channels to a [`ChildEndpointRegistrar`] so the rest of the
//! system can open them.

use std::fmt;

use crate::error::Result;
use crate::protocol::frame::Channel;

/// One logical endpoint to expose.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EndpointDescriptor {
    /// Endpoint name.
    pub name: String,
    /// Channel the endpoint opens.
    pub channel: Channel,
    /// Whether the endpoint opens the channel as an audio-shadow client.
    pub audio_shadow: bool,
}

impl EndpointDescriptor {
    /// Primary endpoint on `channel`.
    pub fn new(name: impl Into<String>, channel: Channel) -> Self {
        Self {
            name: name.into(),
            channel,
            audio_shadow: false,
        }
    }

    /// Audio-shadow endpoint on `channel`.
    pub fn audio(name: impl Into<String>, channel: Channel) -> Self {
        Self {
            name: name.into(),
            channel,
            audio_shadow: true,
        }
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.name, self.channel)?;
        if self.audio_shadow {
            write!(f, " (audio)")?;
        }
        Ok(())
    }
}

/// Endpoints of a combo chip: one per channel plus the audio shadows of the
/// Bluetooth command and FM radio channels.
pub fn default_endpoints() -> Vec<EndpointDescriptor> {
    let mut endpoints: Vec<EndpointDescriptor> = [
        Channel::BT_CMD,
        Channel::BT_ACL,
        Channel::BT_EVT,
        Channel::FM_RADIO,
        Channel::GNSS,
        Channel::DEBUG,
        Channel::STE_TOOLS,
        Channel::HCI_LOGGER,
        Channel::US_CTRL,
        Channel::CORE,
        Channel::HCI_RAW,
    ]
    .into_iter()
    .map(|channel| EndpointDescriptor::new(channel.name(), channel))
    .collect();

    endpoints.push(EndpointDescriptor::audio("audio_bt", Channel::BT_CMD));
    endpoints.push(EndpointDescriptor::audio("audio_fm", Channel::FM_RADIO));
    endpoints
}

/// Registers child endpoints with the surrounding system.
pub trait ChildEndpointRegistrar: Send + Sync {
    /// Expose the endpoints.
    fn register(&self, endpoints: &[EndpointDescriptor]) -> Result<()>;

    /// Withdraw everything registered before.
    fn unregister(&self) -> Result<()>;
}
