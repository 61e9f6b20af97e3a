//! Federated instant-messaging provider.
//!
//! The provider never speaks the IM wire protocol itself. It drives an
//! out-of-process connection manager over a command/event link and turns
//! the manager's events into `comms-core` notices.

/// In-process connection manager for tests and local runs.
pub mod loopback;
/// Command/event protocol spoken with the connection manager.
pub mod protocol;
/// Provider, transport and per-connection event routing.
pub mod provider;
/// Manager events to core notices.
pub mod translate;

pub use loopback::LoopbackManager;
pub use protocol::{
    FederationCommand, FederationEvent, LinkError, LinkStatus, ManagerEnd, ProviderEnd,
    RosterEntry, Subscription, decode_event, encode_command, manager_link,
};
pub use provider::{FederatedConfig, FederatedImProvider};
