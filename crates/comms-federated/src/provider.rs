use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use comms_core::{
    BackendKind, BackendSink, Capabilities, CommError, Connection, ConnectionInit,
    ConnectionProvider, ConnectionTracker, ConnectionTransport, Credentials, LifecycleNotifier,
    ProviderState, RetryPolicy, SessionTarget, notice_queue,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    protocol::{FederationCommand, FederationEvent, LinkStatus, ProviderEnd, RosterEntry},
    translate::{account_notice, roster_contacts, roster_requests, roster_updates, subscription_notices},
};

const DESCRIPTION: &str = "federated im";

/// Tuning for connection-manager bring-up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FederatedConfig {
    /// How long one handshake attempt waits for `ManagerReady`.
    pub handshake_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for FederatedConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 2_000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
struct Route {
    sink: BackendSink,
    opened: bool,
    pending_roster: Vec<RosterEntry>,
    /// Roster aliases by address, kept for contacts confirmed later.
    aliases: HashMap<String, String>,
}

impl Route {
    fn remember_aliases(&mut self, entries: &[RosterEntry]) {
        for entry in entries {
            if let Some(alias) = &entry.alias {
                self.aliases.insert(entry.address.clone(), alias.clone());
            }
        }
    }
}

struct ProviderInner {
    tracker: ConnectionTracker,
    link: ProviderEnd,
    config: FederatedConfig,
    routes: Mutex<HashMap<Uuid, Route>>,
    presence_statuses: Mutex<Vec<String>>,
    stop: CancellationToken,
}

/// Serves whatever protocols the connection manager reports once it
/// answers the handshake.
#[derive(Clone)]
pub struct FederatedImProvider {
    inner: Arc<ProviderInner>,
}

impl FederatedImProvider {
    /// Create the provider and start the manager handshake in the background.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(link: ProviderEnd, config: FederatedConfig) -> Self {
        let provider = Self {
            inner: Arc::new(ProviderInner {
                tracker: ConnectionTracker::new(DESCRIPTION, Vec::new()),
                link,
                config,
                routes: Mutex::new(HashMap::new()),
                presence_statuses: Mutex::new(Vec::new()),
                stop: CancellationToken::new(),
            }),
        };
        // Subscribe before the first handshake so the answer cannot be missed.
        let events = provider.inner.link.subscribe();
        let inner = provider.inner.clone();
        tokio::spawn(async move { run(inner, events).await });
        provider
    }
}

impl ConnectionProvider for FederatedImProvider {
    fn description(&self) -> String {
        DESCRIPTION.to_owned()
    }

    fn state(&self) -> ProviderState {
        self.inner.tracker.state()
    }

    fn supported_protocols(&self) -> Vec<String> {
        self.inner.tracker.protocols()
    }

    fn open_connection(&self, credentials: &Credentials) -> Result<Connection, CommError> {
        self.inner.tracker.ensure_protocol(&credentials.protocol)?;
        self.inner.tracker.ensure_ready()?;

        let init = ConnectionInit::new(BackendKind::Federated, credentials.clone());
        let account = init.id;
        let (sink, notices) = notice_queue();
        let transport = Arc::new(FederatedTransport {
            account,
            link: self.inner.link.clone(),
            presence_statuses: self.inner.presence_statuses().clone(),
        });
        self.inner.routes().insert(
            account,
            Route {
                sink: sink.clone(),
                opened: false,
                pending_roster: Vec::new(),
                aliases: HashMap::new(),
            },
        );

        let connection = Connection::spawn(init, transport, notices, self.inner.tracker.notifier());
        let connect = FederationCommand::Connect {
            account,
            protocol: credentials.protocol.clone(),
            user_id: credentials.user_id.clone(),
            password: credentials.password.clone(),
            server: credentials.server.clone(),
            port: credentials.port,
        };
        if let Err(err) = self.inner.link.try_send(connect) {
            sink.failed(err.to_string());
            self.inner.routes().remove(&account);
        }

        self.inner.tracker.track(connection.clone());
        Ok(connection)
    }

    fn connections(&self) -> Vec<Connection> {
        self.inner.tracker.connections()
    }

    fn bind(&self, notifier: LifecycleNotifier) {
        self.inner.tracker.bind(notifier);
    }

    fn shutdown(&self) {
        self.inner.tracker.close_all();
        self.inner.stop.cancel();
    }
}

impl ProviderInner {
    fn routes(&self) -> MutexGuard<'_, HashMap<Uuid, Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn presence_statuses(&self) -> MutexGuard<'_, Vec<String>> {
        self.presence_statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver one manager event to the connection it belongs to.
    fn route(&self, event: FederationEvent) {
        let Some(account) = event.account() else {
            debug!("ignoring repeated manager ready");
            return;
        };
        let mut routes = self.routes();
        let Some(route) = routes.get_mut(&account) else {
            debug!(%account, "event for unknown account");
            return;
        };

        if let FederationEvent::AliasChanged { address, alias, .. } = &event {
            route.aliases.insert(address.clone(), alias.clone());
        }
        let mut finished = false;
        match event {
            FederationEvent::StatusChanged {
                status: LinkStatus::Connected,
                ..
            } => {
                if !route.opened {
                    route.opened = true;
                    let entries = std::mem::take(&mut route.pending_roster);
                    route.sink.opened(roster_contacts(&entries));
                    for notice in roster_requests(&entries) {
                        route.sink.notify(notice);
                    }
                }
            }
            FederationEvent::StatusChanged {
                status: LinkStatus::Disconnected,
                reason,
                ..
            } => {
                route.sink.failed(
                    reason.unwrap_or_else(|| "disconnected by the connection manager".to_owned()),
                );
                finished = true;
            }
            FederationEvent::StatusChanged {
                status: LinkStatus::Connecting,
                ..
            } => debug!(%account, "account connecting"),
            FederationEvent::Roster { entries, .. } => {
                route.remember_aliases(&entries);
                if route.opened {
                    for notice in roster_updates(&entries) {
                        route.sink.notify(notice);
                    }
                } else {
                    route.pending_roster.extend(entries);
                }
            }
            FederationEvent::SubscriptionChanged {
                address,
                subscription,
                ..
            } => {
                let alias = route.aliases.get(&address).map(String::as_str);
                for notice in subscription_notices(&address, alias, subscription) {
                    route.sink.notify(notice);
                }
            }
            other => {
                if let Some(notice) = account_notice(other) {
                    route.sink.notify(notice);
                }
            }
        }

        if finished || route.sink.is_closed() {
            routes.remove(&account);
        }
    }

    fn fail_all_routes(&self, reason: &str) {
        for (_, route) in self.routes().drain() {
            route.sink.failed(reason);
        }
    }
}

async fn run(inner: Arc<ProviderInner>, mut events: broadcast::Receiver<FederationEvent>) {
    match bring_up(&inner, &mut events).await {
        Ok((protocols, presence_statuses)) => {
            *inner.presence_statuses() = presence_statuses;
            if let Err(err) = inner.tracker.mark_ready(protocols) {
                warn!(%err, "federated provider could not become ready");
                return;
            }
        }
        Err(reason) => {
            if let Err(err) = inner.tracker.mark_failed(&reason) {
                debug!(%err, "federated provider already settled");
            }
            return;
        }
    }

    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => break,
            event = events.recv() => match event {
                Ok(event) => inner.route(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "connection manager events lagged; events dropped");
                }
                Err(RecvError::Closed) => {
                    inner.fail_all_routes("connection manager went away");
                    break;
                }
            }
        }
    }
    info!("federated provider event loop stopped");
}

/// Handshake with the manager, retrying with backoff.
async fn bring_up(
    inner: &ProviderInner,
    events: &mut broadcast::Receiver<FederationEvent>,
) -> Result<(Vec<String>, Vec<String>), String> {
    let retry = inner.config.retry;
    let timeout = Duration::from_millis(inner.config.handshake_timeout_ms);
    let mut attempt: u32 = 0;

    loop {
        inner
            .link
            .send(FederationCommand::Handshake)
            .await
            .map_err(|err| err.to_string())?;

        match tokio::time::timeout(timeout, wait_for_ready(events)).await {
            Ok(ready) => return ready,
            Err(_) => warn!(attempt, "connection manager handshake timed out"),
        }

        if !retry.allows_retry_after(attempt) {
            return Err(format!(
                "connection manager did not answer after {} attempts",
                attempt + 1
            ));
        }
        let delay = retry.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);

        tokio::select! {
            _ = inner.stop.cancelled() => return Err("provider shut down".to_owned()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn wait_for_ready(
    events: &mut broadcast::Receiver<FederationEvent>,
) -> Result<(Vec<String>, Vec<String>), String> {
    loop {
        match events.recv().await {
            Ok(FederationEvent::ManagerReady {
                protocols,
                presence_statuses,
            }) => return Ok((protocols, presence_statuses)),
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return Err("connection manager link closed".to_owned()),
        }
    }
}

struct FederatedTransport {
    account: Uuid,
    link: ProviderEnd,
    presence_statuses: Vec<String>,
}

impl FederatedTransport {
    fn command(&self, command: FederationCommand) {
        if let Err(err) = self.link.try_send(command) {
            warn!(account = %self.account, %err, "dropping command for connection manager");
        }
    }
}

impl ConnectionTransport for FederatedTransport {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            private_chat: true,
            public_chat: true,
            friend_requests: true,
            rejection_delivery: true,
            presence: true,
        }
    }

    fn open_chat_session(&self, target: &SessionTarget) -> Result<(), CommError> {
        self.link
            .try_send(FederationCommand::RequestChannel {
                account: self.account,
                target: target.clone(),
            })
            .map_err(|err| CommError::backend(err.to_string()))
    }

    fn send_chat_message(&self, target: &SessionTarget, text: &str) {
        self.command(FederationCommand::SendText {
            account: self.account,
            target: target.clone(),
            text: text.to_owned(),
        });
    }

    fn close_chat_session(&self, target: &SessionTarget) {
        self.command(FederationCommand::CloseChannel {
            account: self.account,
            target: target.clone(),
        });
    }

    fn send_friend_request(&self, to: &str, message: &str) {
        self.command(FederationCommand::RequestSubscription {
            account: self.account,
            address: to.to_owned(),
            message: message.to_owned(),
        });
    }

    fn answer_friend_request(&self, from: &str, accept: bool) {
        self.command(FederationCommand::AuthorizeSubscription {
            account: self.account,
            address: from.to_owned(),
            accept,
        });
    }

    fn remove_contact(&self, contact_id: &str) {
        self.command(FederationCommand::RemoveContact {
            account: self.account,
            address: contact_id.to_owned(),
        });
    }

    fn set_presence(&self, status: &str, message: &str) {
        self.command(FederationCommand::SetPresence {
            account: self.account,
            status: status.to_owned(),
            message: message.to_owned(),
        });
    }

    fn presence_status_options(&self) -> Vec<String> {
        self.presence_statuses.clone()
    }

    fn disconnect(&self) {
        self.command(FederationCommand::Disconnect {
            account: self.account,
        });
    }
}
