//! Backend-neutral messaging core.
//!
//! This crate defines the provider registry, the connection, chat-session
//! and friend-request lifecycles, the contact model, and the notice/event
//! plumbing that backend adapters and UI layers build on.

/// Event hubs and ordered notice queues.
pub mod channel;
/// Chat sessions and their participants.
pub mod chat;
/// Connection handle, backend transport contract and notices.
pub mod connection;
/// Contact and contact-group model.
pub mod contact;
/// Stable error types.
pub mod error;
/// Friend-request lifecycle.
pub mod friend_request;
/// Per-session message history.
pub mod history;
/// Backend plugin contract and shared provider bookkeeping.
pub mod provider;
/// Backoff policy used by backend bring-up loops.
pub mod retry;
/// Provider registry.
pub mod service;
/// Lifecycle transition graphs.
pub mod state_machine;
/// Plain value types shared across the crate.
pub mod types;

#[cfg(test)]
mod testing;

pub use channel::{ChannelError, DEFAULT_EVENT_BUFFER, EventHub, EventStream};
pub use chat::{ChatSession, ChatSessionEvent, Participant};
pub use connection::{
    BackendSink, Connection, ConnectionEvent, ConnectionInit, ConnectionNotice,
    ConnectionTransport, HIDDEN_PRESENCE_STATUSES, MessageOrigin, notice_queue,
};
pub use contact::{Contact, ContactGroup, UNKNOWN_PRESENCE};
pub use error::{CommError, ErrorCategory};
pub use friend_request::FriendRequest;
pub use history::{Message, MessageHistory, now_ms};
pub use provider::{ConnectionProvider, ConnectionTracker};
pub use retry::RetryPolicy;
pub use service::{CommunicationService, LifecycleNotifier, ServiceEvent};
pub use state_machine::{Lifecycle, StateMachine};
pub use types::{
    BackendKind, BackendPayload, Capabilities, ConnectionState, Credentials, FriendRequestState,
    ProviderState, RequestDirection, SessionState, SessionTarget,
};
