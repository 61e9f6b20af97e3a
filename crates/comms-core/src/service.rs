use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    channel::{DEFAULT_EVENT_BUFFER, EventHub, EventStream},
    connection::Connection,
    error::CommError,
    provider::ConnectionProvider,
    types::{ConnectionState, Credentials},
};

/// Registry-level notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceEvent {
    ConnectionOpened {
        id: Uuid,
        protocol: String,
    },
    /// Emitted for both `Closed` and `Error`.
    ConnectionClosed {
        id: Uuid,
        protocol: String,
        state: ConnectionState,
        reason: Option<String>,
    },
    /// A provider started serving `protocols`.
    ProtocolsSupported {
        provider: String,
        protocols: Vec<String>,
    },
    ProviderFailed {
        provider: String,
        reason: String,
    },
}

/// Handed to providers at registration so their connections can report
/// lifecycle changes to the service.
#[derive(Debug, Clone)]
pub struct LifecycleNotifier {
    events: Arc<EventHub<ServiceEvent>>,
}

impl LifecycleNotifier {
    pub fn connection_opened(&self, id: Uuid, protocol: &str) {
        self.events.emit(ServiceEvent::ConnectionOpened {
            id,
            protocol: protocol.to_owned(),
        });
    }

    pub fn connection_closed(
        &self,
        id: Uuid,
        protocol: &str,
        state: ConnectionState,
        reason: Option<String>,
    ) {
        self.events.emit(ServiceEvent::ConnectionClosed {
            id,
            protocol: protocol.to_owned(),
            state,
            reason,
        });
    }

    pub fn protocols_supported(&self, provider: &str, protocols: Vec<String>) {
        self.events.emit(ServiceEvent::ProtocolsSupported {
            provider: provider.to_owned(),
            protocols,
        });
    }

    pub fn provider_failed(&self, provider: &str, reason: &str) {
        self.events.emit(ServiceEvent::ProviderFailed {
            provider: provider.to_owned(),
            reason: reason.to_owned(),
        });
    }
}

/// Registry mapping protocol names to connection providers.
///
/// Construct one per process (or per test) and pass it to whoever needs it;
/// call [`CommunicationService::shutdown`] to tear it down.
pub struct CommunicationService {
    providers: RwLock<Vec<Arc<dyn ConnectionProvider>>>,
    events: Arc<EventHub<ServiceEvent>>,
}

impl CommunicationService {
    pub fn new() -> Self {
        Self::with_event_buffer(DEFAULT_EVENT_BUFFER)
    }

    pub fn with_event_buffer(event_buffer: usize) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            events: Arc::new(EventHub::new(event_buffer)),
        }
    }

    pub fn subscribe(&self) -> EventStream<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn notifier(&self) -> LifecycleNotifier {
        LifecycleNotifier {
            events: self.events.clone(),
        }
    }

    /// Add a provider. Rejected if it advertises a protocol another
    /// registered provider already serves.
    pub fn register_connection_provider(
        &self,
        provider: Arc<dyn ConnectionProvider>,
    ) -> Result<(), CommError> {
        let description = provider.description();
        let protocols = provider.supported_protocols();
        {
            let mut providers = self.write();
            for existing in providers.iter() {
                let taken = existing.supported_protocols();
                if let Some(protocol) = protocols.iter().find(|protocol| taken.contains(protocol)) {
                    return Err(CommError::DuplicateProtocol {
                        protocol: protocol.clone(),
                        provider: existing.description(),
                    });
                }
            }
            providers.push(provider.clone());
        }

        provider.bind(self.notifier());
        info!(provider = %description, ?protocols, "connection provider registered");
        if !protocols.is_empty() {
            self.events.emit(ServiceEvent::ProtocolsSupported {
                provider: description,
                protocols,
            });
        }
        Ok(())
    }

    pub fn provider_count(&self) -> usize {
        self.read().len()
    }

    /// Every advertised protocol, deduplicated, in registration order.
    pub fn supported_protocols(&self) -> Vec<String> {
        let mut protocols: Vec<String> = Vec::new();
        for provider in self.read().iter() {
            for protocol in provider.supported_protocols() {
                if !protocols.contains(&protocol) {
                    protocols.push(protocol);
                }
            }
        }
        protocols
    }

    /// Open a connection with the provider serving `credentials.protocol`.
    ///
    /// The connection is returned in `Initializing`; watch its events for
    /// the move to `Open` or `Error`.
    pub fn open_connection(&self, credentials: &Credentials) -> Result<Connection, CommError> {
        let provider = self
            .provider_for(&credentials.protocol)
            .ok_or_else(|| CommError::UnsupportedProtocol(credentials.protocol.clone()))?;
        let connection = provider.open_connection(credentials)?;
        info!(
            provider = %provider.description(),
            connection = %connection.id(),
            user = %credentials.user_id,
            "connection requested"
        );
        Ok(connection)
    }

    /// Every connection any provider created, open or closed, optionally
    /// only for `protocol`.
    pub fn connections(&self, protocol: Option<&str>) -> Vec<Connection> {
        self.read()
            .iter()
            .flat_map(|provider| provider.connections())
            .filter(|connection| protocol.is_none_or(|wanted| connection.protocol() == wanted))
            .collect()
    }

    /// Close every connection and drop every provider.
    pub fn shutdown(&self) {
        let providers = std::mem::take(&mut *self.write());
        for provider in &providers {
            provider.shutdown();
        }
        info!(providers = providers.len(), "communication service shut down");
    }

    fn provider_for(&self, protocol: &str) -> Option<Arc<dyn ConnectionProvider>> {
        let providers = self.read();
        let matching: Vec<&Arc<dyn ConnectionProvider>> = providers
            .iter()
            .filter(|provider| {
                provider
                    .supported_protocols()
                    .iter()
                    .any(|known| known == protocol)
            })
            .collect();
        if matching.len() > 1 {
            let names: Vec<String> = matching.iter().map(|p| p.description()).collect();
            warn!(protocol, providers = ?names, "several providers serve protocol; using the last registered");
        }
        matching.last().map(|provider| Arc::clone(provider))
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<dyn ConnectionProvider>>> {
        self.providers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<dyn ConnectionProvider>>> {
        self.providers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CommunicationService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        contact::{Contact, ContactGroup},
        testing::{TestProvider, wait_until},
        types::ProviderState,
    };

    fn jabber_credentials() -> Credentials {
        Credentials::new("jabber", "a@x", "secret", "x", 5222)
    }

    #[tokio::test]
    async fn unknown_protocol_creates_no_connection() {
        let service = CommunicationService::new();
        let provider = Arc::new(TestProvider::new("xmpp", &["jabber"]).ready());
        service
            .register_connection_provider(provider.clone())
            .expect("first provider registers");

        let credentials = Credentials::new("irc", "a", "", "irc.example", 6667);
        assert_eq!(
            service.open_connection(&credentials).map(|_| ()),
            Err(CommError::UnsupportedProtocol("irc".into()))
        );
        assert!(service.connections(None).is_empty());
        assert_eq!(provider.opened(), 0);
    }

    #[tokio::test]
    async fn duplicate_protocol_is_rejected_at_registration() {
        let service = CommunicationService::new();
        service
            .register_connection_provider(Arc::new(TestProvider::new("first", &["jabber"])))
            .expect("first provider registers");

        let err = service
            .register_connection_provider(Arc::new(TestProvider::new(
                "second",
                &["irc", "jabber"],
            )))
            .expect_err("second provider must be rejected");
        assert_eq!(
            err,
            CommError::DuplicateProtocol {
                protocol: "jabber".into(),
                provider: "first".into(),
            }
        );
        assert_eq!(service.provider_count(), 1);
        assert_eq!(service.supported_protocols(), vec!["jabber"]);
    }

    #[tokio::test]
    async fn jabber_connection_opens_with_supplied_contacts() {
        let service = CommunicationService::new();
        let provider = Arc::new(TestProvider::new("xmpp", &["jabber"]).ready());
        service
            .register_connection_provider(provider.clone())
            .expect("provider registers");
        let mut service_events = service.subscribe();

        let connection = service
            .open_connection(&jabber_credentials())
            .expect("jabber is served");
        assert_eq!(connection.state(), ConnectionState::Initializing);
        assert_eq!(connection.protocol(), "jabber");

        let mut roster = ContactGroup::new("friends");
        roster.insert(Contact::new("bob@x", "Bob"));
        provider.last_sink().opened(roster.clone());

        wait_until(|| connection.state() == ConnectionState::Open).await;
        assert_eq!(connection.contacts(), roster);

        let event = tokio::time::timeout(Duration::from_secs(2), service_events.recv())
            .await
            .expect("service event should arrive")
            .expect("service stream open");
        assert_eq!(
            event,
            ServiceEvent::ConnectionOpened {
                id: connection.id(),
                protocol: "jabber".into(),
            }
        );
    }

    #[tokio::test]
    async fn provider_must_be_ready_to_open() {
        let service = CommunicationService::new();
        let provider = Arc::new(TestProvider::new("xmpp", &["jabber"]));
        service
            .register_connection_provider(provider.clone())
            .expect("provider registers");
        assert_eq!(provider.state(), ProviderState::Initializing);

        assert_eq!(
            service.open_connection(&jabber_credentials()).map(|_| ()),
            Err(CommError::ProviderNotReady("xmpp".into()))
        );
    }

    #[tokio::test]
    async fn filters_connections_by_protocol() {
        let service = CommunicationService::new();
        service
            .register_connection_provider(Arc::new(TestProvider::new("xmpp", &["jabber"]).ready()))
            .expect("xmpp registers");
        service
            .register_connection_provider(Arc::new(TestProvider::new("irc", &["irc"]).ready()))
            .expect("irc registers");

        service
            .open_connection(&jabber_credentials())
            .expect("jabber connection");
        service
            .open_connection(&Credentials::new("irc", "nick", "", "irc.example", 6667))
            .expect("irc connection");

        assert_eq!(service.connections(None).len(), 2);
        assert_eq!(service.connections(Some("irc")).len(), 1);
        assert!(service.connections(Some("msn")).is_empty());
        assert_eq!(service.supported_protocols(), vec!["jabber", "irc"]);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let service = CommunicationService::new();
        let provider = Arc::new(TestProvider::new("xmpp", &["jabber"]).ready());
        service
            .register_connection_provider(provider.clone())
            .expect("provider registers");
        let connection = service
            .open_connection(&jabber_credentials())
            .expect("jabber connection");
        provider.last_sink().opened(ContactGroup::default());
        wait_until(|| connection.state() == ConnectionState::Open).await;
        let mut events = service.subscribe();

        service.shutdown();

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(service.provider_count(), 0);
        assert!(service.supported_protocols().is_empty());
        assert!(matches!(
            events.try_recv(),
            Ok(ServiceEvent::ConnectionClosed {
                state: ConnectionState::Closed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn independent_services_do_not_share_providers() {
        let first = CommunicationService::new();
        let second = CommunicationService::new();
        first
            .register_connection_provider(Arc::new(TestProvider::new("xmpp", &["jabber"]).ready()))
            .expect("registers");

        assert_eq!(first.supported_protocols(), vec!["jabber"]);
        assert!(second.supported_protocols().is_empty());
    }
}
