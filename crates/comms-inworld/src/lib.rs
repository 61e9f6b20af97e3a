//! In-world chat provider.
//!
//! Wraps the chat channel of an already logged-in virtual-world session and
//! exposes it as a `comms-core` connection with a single public channel.

/// Simulator chat packets to core notices.
pub mod packets;
/// Provider and transport built on a world stream.
pub mod provider;
/// World stream contract and an in-process implementation.
pub mod world;

pub use packets::{parse_channel, translate_chat};
pub use provider::InWorldChatProvider;
pub use world::{ChatFromSimulator, ChatSourceType, ChatType, LocalWorldStream, WorldStream};

/// Protocol tag served by this provider.
pub const PROTOCOL: &str = "opensim_udp";
/// The only chat channel a viewer may open.
pub const PUBLIC_CHANNEL: &str = "0";
