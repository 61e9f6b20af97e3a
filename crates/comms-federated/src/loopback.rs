use std::collections::HashMap;

use comms_core::SessionTarget;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::{
    FederationCommand, FederationEvent, LinkStatus, ManagerEnd, RosterEntry, Subscription,
};

const DEFAULT_STATUSES: [&str; 6] = ["available", "away", "busy", "offline", "unknown", "error"];

#[derive(Debug, Clone)]
struct Account {
    password: String,
    roster: Vec<RosterEntry>,
}

/// Connection manager that runs in-process and answers from fixed data.
///
/// Private messages are echoed back as if the peer repeated them.
#[derive(Debug)]
pub struct LoopbackManager {
    end: ManagerEnd,
    protocols: Vec<String>,
    presence_statuses: Vec<String>,
    accounts: HashMap<String, Account>,
    connected: HashMap<Uuid, String>,
    unreachable: Vec<String>,
    silent: bool,
}

impl LoopbackManager {
    pub fn new(end: ManagerEnd) -> Self {
        Self {
            end,
            protocols: vec!["jabber".to_owned()],
            presence_statuses: DEFAULT_STATUSES.iter().map(|s| (*s).to_owned()).collect(),
            accounts: HashMap::new(),
            connected: HashMap::new(),
            unreachable: Vec::new(),
            silent: false,
        }
    }

    pub fn with_protocols(mut self, protocols: &[&str]) -> Self {
        self.protocols = protocols.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    /// Accept logins for `user_id` with `password` and report `roster`.
    pub fn with_account(
        mut self,
        user_id: impl Into<String>,
        password: impl Into<String>,
        roster: Vec<RosterEntry>,
    ) -> Self {
        self.accounts.insert(
            user_id.into(),
            Account {
                password: password.into(),
                roster,
            },
        );
        self
    }

    /// Refuse private channels to `peers`.
    pub fn with_unreachable(mut self, peers: &[&str]) -> Self {
        self.unreachable = peers.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    /// Never answer anything, as a hung manager would.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn event_sender(&self) -> broadcast::Sender<FederationEvent> {
        self.end.event_sender()
    }

    /// Serve commands until every provider end is dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.end.recv().await {
            if self.silent {
                debug!(?command, "silent manager ignoring command");
                continue;
            }
            self.handle(command);
        }
        info!("loopback connection manager stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn handle(&mut self, command: FederationCommand) {
        match command {
            FederationCommand::Handshake => self.end.emit(FederationEvent::ManagerReady {
                protocols: self.protocols.clone(),
                presence_statuses: self.presence_statuses.clone(),
            }),
            FederationCommand::Connect {
                account,
                protocol,
                user_id,
                password,
                ..
            } => self.connect(account, &protocol, user_id, &password),
            FederationCommand::Disconnect { account } => {
                if self.connected.remove(&account).is_some() {
                    self.status(account, LinkStatus::Disconnected, Some("signed off"));
                }
            }
            FederationCommand::RequestChannel { account, target } => {
                let refusal = if !self.connected.contains_key(&account) {
                    Some("account is not connected")
                } else if !target.is_public()
                    && self.unreachable.iter().any(|peer| peer == target.id())
                {
                    Some("peer unreachable")
                } else {
                    None
                };
                match refusal {
                    Some(reason) => self.end.emit(FederationEvent::ChannelFailed {
                        account,
                        target,
                        reason: reason.to_owned(),
                    }),
                    None => self
                        .end
                        .emit(FederationEvent::ChannelReady { account, target }),
                }
            }
            FederationCommand::CloseChannel { account, target } => {
                self.end
                    .emit(FederationEvent::ChannelClosed { account, target });
            }
            FederationCommand::SendText {
                account,
                target,
                text,
            } => self.echo(account, target, text),
            FederationCommand::RequestSubscription {
                account, address, ..
            } => self.subscription(account, address, Subscription::Yes),
            FederationCommand::AuthorizeSubscription {
                account,
                address,
                accept,
            } => {
                let subscription = if accept {
                    Subscription::Yes
                } else {
                    Subscription::No
                };
                self.subscription(account, address, subscription);
            }
            FederationCommand::RemoveContact { account, address } => {
                self.subscription(account, address, Subscription::No);
            }
            FederationCommand::SetPresence {
                account, status, ..
            } => debug!(%account, status, "presence published"),
        }
    }

    fn connect(&mut self, account: Uuid, protocol: &str, user_id: String, password: &str) {
        self.status(account, LinkStatus::Connecting, None);
        if !self.protocols.iter().any(|known| known == protocol) {
            self.status(account, LinkStatus::Disconnected, Some("unsupported protocol"));
            return;
        }
        let roster = match self.accounts.get(&user_id) {
            Some(known) if known.password == password => known.roster.clone(),
            _ => {
                self.status(account, LinkStatus::Disconnected, Some("authentication failed"));
                return;
            }
        };

        self.connected.insert(account, user_id);
        self.end.emit(FederationEvent::Roster {
            account,
            entries: roster,
        });
        self.status(account, LinkStatus::Connected, None);
    }

    fn echo(&self, account: Uuid, target: SessionTarget, text: String) {
        let SessionTarget::Private(peer) = &target else {
            return;
        };
        let sender_alias = self
            .connected
            .get(&account)
            .and_then(|user_id| self.accounts.get(user_id))
            .and_then(|known| known.roster.iter().find(|entry| &entry.address == peer))
            .and_then(|entry| entry.alias.clone());
        self.end.emit(FederationEvent::TextReceived {
            account,
            sender: peer.clone(),
            target,
            sender_alias,
            resource: Some("loopback".to_owned()),
            text,
            timestamp_ms: None,
        });
    }

    fn subscription(&self, account: Uuid, address: String, subscription: Subscription) {
        if self.connected.contains_key(&account) {
            self.end.emit(FederationEvent::SubscriptionChanged {
                account,
                address,
                subscription,
            });
        }
    }

    fn status(&self, account: Uuid, status: LinkStatus, reason: Option<&str>) {
        self.end.emit(FederationEvent::StatusChanged {
            account,
            status,
            reason: reason.map(str::to_owned),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::{ProviderEnd, manager_link};

    async fn next(events: &mut broadcast::Receiver<FederationEvent>) -> FederationEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("manager should answer")
            .expect("link stays open")
    }

    fn start() -> (ProviderEnd, broadcast::Receiver<FederationEvent>) {
        let (provider, manager) = manager_link(16, 16);
        let events = provider.subscribe();
        LoopbackManager::new(manager)
            .with_account(
                "a@x",
                "secret",
                vec![RosterEntry::new("bob@x", Subscription::Yes).with_alias("Bob")],
            )
            .spawn();
        (provider, events)
    }

    async fn connect(provider: &ProviderEnd, account: Uuid, password: &str) {
        provider
            .send(FederationCommand::Connect {
                account,
                protocol: "jabber".into(),
                user_id: "a@x".into(),
                password: password.into(),
                server: "x".into(),
                port: 5222,
            })
            .await
            .expect("manager is running");
    }

    #[tokio::test]
    async fn login_reports_roster_before_connected() {
        let (provider, mut events) = start();
        let account = Uuid::new_v4();
        connect(&provider, account, "secret").await;

        assert!(matches!(
            next(&mut events).await,
            FederationEvent::StatusChanged { status: LinkStatus::Connecting, .. }
        ));
        assert!(matches!(
            next(&mut events).await,
            FederationEvent::Roster { ref entries, .. } if entries.len() == 1
        ));
        assert!(matches!(
            next(&mut events).await,
            FederationEvent::StatusChanged { status: LinkStatus::Connected, .. }
        ));
    }

    #[tokio::test]
    async fn bad_password_disconnects_with_reason() {
        let (provider, mut events) = start();
        let account = Uuid::new_v4();
        connect(&provider, account, "nope").await;

        next(&mut events).await;
        assert_eq!(
            next(&mut events).await,
            FederationEvent::StatusChanged {
                account,
                status: LinkStatus::Disconnected,
                reason: Some("authentication failed".into()),
            }
        );
    }

    #[tokio::test]
    async fn private_text_is_echoed_with_alias() {
        let (provider, mut events) = start();
        let account = Uuid::new_v4();
        connect(&provider, account, "secret").await;
        for _ in 0..3 {
            next(&mut events).await;
        }

        provider
            .send(FederationCommand::SendText {
                account,
                target: SessionTarget::Private("bob@x".into()),
                text: "ping".into(),
            })
            .await
            .expect("manager is running");

        let FederationEvent::TextReceived {
            sender,
            sender_alias,
            text,
            ..
        } = next(&mut events).await
        else {
            panic!("expected echoed text");
        };
        assert_eq!(sender, "bob@x");
        assert_eq!(sender_alias.as_deref(), Some("Bob"));
        assert_eq!(text, "ping");
    }

    #[tokio::test]
    async fn channel_for_disconnected_account_fails() {
        let (provider, mut events) = start();
        let account = Uuid::new_v4();

        provider
            .send(FederationCommand::RequestChannel {
                account,
                target: SessionTarget::Private("bob@x".into()),
            })
            .await
            .expect("manager is running");

        assert_eq!(
            next(&mut events).await,
            FederationEvent::ChannelFailed {
                account,
                target: SessionTarget::Private("bob@x".into()),
                reason: "account is not connected".into(),
            }
        );
    }
}
