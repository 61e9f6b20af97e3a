use comms_core::SessionTarget;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// One side of a presence subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Subscription {
    Yes,
    No,
    /// Waiting for the other side to decide.
    Ask,
}

/// Roster item as reported by the connection manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterEntry {
    pub address: String,
    #[serde(default)]
    pub alias: Option<String>,
    pub subscription: Subscription,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub presence_status: Option<String>,
    #[serde(default)]
    pub presence_message: String,
}

impl RosterEntry {
    pub fn new(address: impl Into<String>, subscription: Subscription) -> Self {
        Self {
            address: address.into(),
            alias: None,
            subscription,
            group: None,
            presence_status: None,
            presence_message: String::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Account link status reported by the manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Provider-to-manager commands. `account` is the connection id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FederationCommand {
    Handshake,
    Connect {
        account: Uuid,
        protocol: String,
        user_id: String,
        password: String,
        server: String,
        port: u16,
    },
    Disconnect {
        account: Uuid,
    },
    RequestChannel {
        account: Uuid,
        target: SessionTarget,
    },
    CloseChannel {
        account: Uuid,
        target: SessionTarget,
    },
    SendText {
        account: Uuid,
        target: SessionTarget,
        text: String,
    },
    RequestSubscription {
        account: Uuid,
        address: String,
        message: String,
    },
    AuthorizeSubscription {
        account: Uuid,
        address: String,
        accept: bool,
    },
    RemoveContact {
        account: Uuid,
        address: String,
    },
    SetPresence {
        account: Uuid,
        status: String,
        message: String,
    },
}

/// Manager-to-provider events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FederationEvent {
    ManagerReady {
        protocols: Vec<String>,
        #[serde(default)]
        presence_statuses: Vec<String>,
    },
    StatusChanged {
        account: Uuid,
        status: LinkStatus,
        #[serde(default)]
        reason: Option<String>,
    },
    Roster {
        account: Uuid,
        entries: Vec<RosterEntry>,
    },
    SubscriptionChanged {
        account: Uuid,
        address: String,
        subscription: Subscription,
    },
    PresenceChanged {
        account: Uuid,
        address: String,
        status: String,
        #[serde(default)]
        message: String,
    },
    AliasChanged {
        account: Uuid,
        address: String,
        alias: String,
    },
    ChannelReady {
        account: Uuid,
        target: SessionTarget,
    },
    ChannelFailed {
        account: Uuid,
        target: SessionTarget,
        reason: String,
    },
    ChannelClosed {
        account: Uuid,
        target: SessionTarget,
    },
    TextReceived {
        account: Uuid,
        target: SessionTarget,
        sender: String,
        #[serde(default)]
        sender_alias: Option<String>,
        #[serde(default)]
        resource: Option<String>,
        text: String,
        #[serde(default)]
        timestamp_ms: Option<u64>,
    },
}

impl FederationEvent {
    /// Connection the event belongs to; `None` for manager-wide events.
    pub fn account(&self) -> Option<Uuid> {
        match self {
            Self::ManagerReady { .. } => None,
            Self::StatusChanged { account, .. }
            | Self::Roster { account, .. }
            | Self::SubscriptionChanged { account, .. }
            | Self::PresenceChanged { account, .. }
            | Self::AliasChanged { account, .. }
            | Self::ChannelReady { account, .. }
            | Self::ChannelFailed { account, .. }
            | Self::ChannelClosed { account, .. }
            | Self::TextReceived { account, .. } => Some(*account),
        }
    }
}

/// Encode a command as one line of JSON for an out-of-process manager.
pub fn encode_command(command: &FederationCommand) -> Result<String, serde_json::Error> {
    serde_json::to_string(command)
}

/// Decode one JSON line received from an out-of-process manager.
pub fn decode_event(line: &str) -> Result<FederationEvent, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Errors returned by link operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("connection manager command channel is closed")]
    CommandChannelClosed,
    #[error("connection manager command channel is full")]
    CommandChannelFull,
}

/// Provider side of the manager link.
#[derive(Clone, Debug)]
pub struct ProviderEnd {
    command_tx: mpsc::Sender<FederationCommand>,
    event_tx: broadcast::Sender<FederationEvent>,
}

impl ProviderEnd {
    /// Subscribe to manager events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<FederationEvent> {
        self.event_tx.subscribe()
    }

    /// Send one command, waiting for queue space.
    pub async fn send(&self, command: FederationCommand) -> Result<(), LinkError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| LinkError::CommandChannelClosed)
    }

    /// Send one command without waiting.
    pub fn try_send(&self, command: FederationCommand) -> Result<(), LinkError> {
        self.command_tx.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => LinkError::CommandChannelFull,
            mpsc::error::TrySendError::Closed(_) => LinkError::CommandChannelClosed,
        })
    }
}

/// Manager side of the link.
#[derive(Debug)]
pub struct ManagerEnd {
    command_rx: mpsc::Receiver<FederationCommand>,
    event_tx: broadcast::Sender<FederationEvent>,
}

impl ManagerEnd {
    pub async fn recv(&mut self) -> Option<FederationCommand> {
        self.command_rx.recv().await
    }

    /// Emit an event to the provider.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: FederationEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Clone the event sender, e.g. to inject events from a test.
    pub fn event_sender(&self) -> broadcast::Sender<FederationEvent> {
        self.event_tx.clone()
    }
}

/// Create a connected provider/manager link pair.
pub fn manager_link(command_buffer: usize, event_buffer: usize) -> (ProviderEnd, ManagerEnd) {
    let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
    let (event_tx, _) = broadcast::channel(event_buffer.max(1));
    (
        ProviderEnd {
            command_tx,
            event_tx: event_tx.clone(),
        },
        ManagerEnd {
            command_rx,
            event_tx,
        },
    )
}
