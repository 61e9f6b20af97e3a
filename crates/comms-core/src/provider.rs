use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::{
    connection::Connection,
    error::CommError,
    service::LifecycleNotifier,
    state_machine::StateMachine,
    types::{Credentials, ProviderState},
};

/// A pluggable backend serving one or more protocols.
pub trait ConnectionProvider: Send + Sync {
    /// Human-readable provider name, used in logs and errors.
    fn description(&self) -> String;

    fn state(&self) -> ProviderState;

    /// Protocols currently advertised. May grow when the backend comes up.
    fn supported_protocols(&self) -> Vec<String>;

    /// Start a login. The connection is returned in `Initializing`.
    fn open_connection(&self, credentials: &Credentials) -> Result<Connection, CommError>;

    /// Every connection this provider created, open or closed.
    fn connections(&self) -> Vec<Connection>;

    /// Receive the lifecycle notifier of the registering service.
    fn bind(&self, notifier: LifecycleNotifier);

    /// Close every connection and stop background work.
    fn shutdown(&self) {
        for connection in self.connections() {
            if !connection.is_terminal() {
                connection.close();
            }
        }
    }
}

#[derive(Debug)]
struct TrackerShared {
    machine: StateMachine<ProviderState>,
    protocols: Vec<String>,
    connections: Vec<Connection>,
    notifier: Option<LifecycleNotifier>,
}

/// Shared provider bookkeeping: lifecycle, advertised protocols, created
/// connections and the bound notifier.
#[derive(Debug)]
pub struct ConnectionTracker {
    description: String,
    shared: Mutex<TrackerShared>,
}

impl ConnectionTracker {
    pub fn new(description: impl Into<String>, protocols: Vec<String>) -> Self {
        Self {
            description: description.into(),
            shared: Mutex::new(TrackerShared {
                machine: StateMachine::new(ProviderState::Initializing),
                protocols,
                connections: Vec::new(),
                notifier: None,
            }),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state(&self) -> ProviderState {
        self.lock().machine.state()
    }

    pub fn protocols(&self) -> Vec<String> {
        self.lock().protocols.clone()
    }

    pub fn notifier(&self) -> Option<LifecycleNotifier> {
        self.lock().notifier.clone()
    }

    pub fn bind(&self, notifier: LifecycleNotifier) {
        self.lock().notifier = Some(notifier);
    }

    /// Backend came up. `protocols` not advertised before are announced.
    pub fn mark_ready(&self, protocols: Vec<String>) -> Result<(), CommError> {
        let mut shared = self.lock();
        shared.machine.advance(ProviderState::Ready)?;

        let added: Vec<String> = protocols
            .iter()
            .filter(|protocol| !shared.protocols.contains(protocol))
            .cloned()
            .collect();
        shared.protocols.extend(added.iter().cloned());
        info!(provider = %self.description, protocols = ?shared.protocols, "provider ready");

        if !added.is_empty()
            && let Some(notifier) = &shared.notifier
        {
            notifier.protocols_supported(&self.description, added);
        }
        Ok(())
    }

    pub fn mark_failed(&self, reason: &str) -> Result<(), CommError> {
        let mut shared = self.lock();
        shared.machine.advance(ProviderState::Error)?;
        warn!(provider = %self.description, reason, "provider failed");
        if let Some(notifier) = &shared.notifier {
            notifier.provider_failed(&self.description, reason);
        }
        Ok(())
    }

    /// Fail fast unless the provider is `Ready`.
    pub fn ensure_ready(&self) -> Result<(), CommError> {
        match self.state() {
            ProviderState::Ready => Ok(()),
            ProviderState::Initializing | ProviderState::Error => {
                Err(CommError::ProviderNotReady(self.description.clone()))
            }
        }
    }

    /// Fail unless `protocol` is advertised.
    pub fn ensure_protocol(&self, protocol: &str) -> Result<(), CommError> {
        if self.lock().protocols.iter().any(|known| known == protocol) {
            Ok(())
        } else {
            Err(CommError::UnsupportedProtocol(protocol.to_owned()))
        }
    }

    pub fn track(&self, connection: Connection) {
        self.lock().connections.push(connection);
    }

    /// Every tracked connection, terminal ones included.
    pub fn connections(&self) -> Vec<Connection> {
        self.lock().connections.clone()
    }

    pub fn live_connections(&self) -> Vec<Connection> {
        self.lock()
            .connections
            .iter()
            .filter(|tracked| !tracked.is_terminal())
            .cloned()
            .collect()
    }

    pub fn close_all(&self) {
        // Close outside the tracker lock; closing notifies the service.
        for connection in self.live_connections() {
            connection.close();
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
