use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Returned by `open_connection`; the backend handshake is still running.
    Initializing,
    /// Backend session is live; contacts and chat sessions are available.
    Open,
    /// Closed by the caller. Terminal.
    Closed,
    /// Backend reported a failure; see the connection's reason. Terminal.
    Error,
}

/// Lifecycle of a [`ChatSession`](crate::ChatSession).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Channel setup is running on the backend.
    Initializing,
    /// Messages can be sent and received.
    Open,
    /// Closed by either side. Terminal.
    Closed,
    /// Channel setup failed. Terminal.
    Error,
}

/// Lifecycle of a [`FriendRequest`](crate::FriendRequest).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FriendRequestState {
    Pending,
    Accepted,
    Rejected,
}

/// Lifecycle of a connection provider's own backend runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProviderState {
    /// Backend runtime is still coming up; `open_connection` fails fast.
    Initializing,
    /// Backend runtime is up and the provider accepts connections.
    Ready,
    /// Backend runtime could not be brought up. Terminal.
    Error,
}

/// Which side started a friend request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RequestDirection {
    /// A remote party asked the local user.
    Incoming,
    /// The local user asked a remote party.
    Outgoing,
}

/// Backend family a connection belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Proprietary UDP in-world chat of a virtual world session.
    InWorld,
    /// Federated instant messaging (XMPP-style).
    Federated,
    /// Any third-party provider.
    Other,
}

/// Backend-specific data attached to a participant.
///
/// Read it through the checked accessors on [`Participant`](crate::Participant)
/// rather than matching on the backend of the owning connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BackendPayload {
    #[default]
    None,
    /// Avatar that spoke in the virtual world.
    InWorld { avatar_id: Uuid },
    /// Federated address details (e.g. the sending resource).
    Federated { resource: Option<String> },
}

/// Address of a chat session on its connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionTarget {
    /// Public channel/room identified by a channel id.
    Public(String),
    /// Private conversation identified by the peer's contact id.
    Private(String),
}

impl SessionTarget {
    /// Channel id or peer id.
    pub fn id(&self) -> &str {
        match self {
            Self::Public(id) | Self::Private(id) => id,
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, Self::Public(_))
    }
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public(id) => write!(f, "channel:{id}"),
            Self::Private(id) => write!(f, "private:{id}"),
        }
    }
}

/// What a backend supports. The core checks these before delegating.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub private_chat: bool,
    pub public_chat: bool,
    pub friend_requests: bool,
    /// Rejected friend requests are delivered to the requester.
    pub rejection_delivery: bool,
    /// Arbitrary presence status/message can be published.
    pub presence: bool,
}

/// Login data for one backend account.
///
/// `protocol` selects the provider and must match an advertised protocol
/// exactly.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub protocol: String,
    pub user_id: String,
    pub password: String,
    pub server: String,
    pub port: u16,
}

impl Credentials {
    pub fn new(
        protocol: impl Into<String>,
        user_id: impl Into<String>,
        password: impl Into<String>,
        server: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            user_id: user_id.into(),
            password: password.into(),
            server: server.into(),
            port,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("protocol", &self.protocol)
            .field("user_id", &self.user_id)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .field("port", &self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = Credentials::new("jabber", "a@x", "hunter2", "x", 5222);
        let printed = format!("{credentials:?}");
        assert!(printed.contains("a@x"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn session_targets_with_same_id_are_distinct() {
        let public = SessionTarget::Public("bob".into());
        let private = SessionTarget::Private("bob".into());
        assert_ne!(public, private);
        assert_eq!(public.id(), private.id());
        assert!(public.is_public());
        assert_eq!(private.to_string(), "private:bob");
    }
}
