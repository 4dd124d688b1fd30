//! Plugin bus: message schema and per-plugin channels.

pub mod channel;
pub mod message;

pub use channel::{PluginChannel, PluginState};
pub use message::{Message, Source, DOMAIN_BROADCAST, DOMAIN_DIRECT, FILTER_SUFFIX};

/// Events the plugin side raises toward the router.
#[derive(Debug)]
pub enum BusEvent {
    /// A message decoded off some plugin's wire.
    Inbound(Message),
    /// The transport of the plugin in this slot ended.
    ChannelClosed(usize),
}
