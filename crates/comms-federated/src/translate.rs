use comms_core::{
    BackendPayload, Contact, ContactGroup, ConnectionNotice, MessageOrigin, UNKNOWN_PRESENCE,
};

use crate::protocol::{FederationEvent, RosterEntry, Subscription};

/// Name of the root group built from a roster.
pub const ROSTER_ROOT: &str = "friend list";

fn entry_contact(entry: &RosterEntry) -> Contact {
    Contact::new(
        &entry.address,
        entry.alias.as_deref().unwrap_or(&entry.address),
    )
    .with_presence(
        entry
            .presence_status
            .as_deref()
            .unwrap_or(UNKNOWN_PRESENCE),
        &entry.presence_message,
    )
}

fn incoming_request(address: &str, name: &str) -> ConnectionNotice {
    ConnectionNotice::FriendRequestReceived {
        originator_id: address.to_owned(),
        originator_name: name.to_owned(),
        message: String::new(),
    }
}

/// Mutual subscriptions become contacts, grouped by roster group.
pub fn roster_contacts(entries: &[RosterEntry]) -> ContactGroup {
    let mut root = ContactGroup::new(ROSTER_ROOT);
    let mut groups: Vec<ContactGroup> = Vec::new();

    for entry in entries
        .iter()
        .filter(|entry| entry.subscription == Subscription::Yes)
    {
        let contact = entry_contact(entry);
        match &entry.group {
            None => {
                root.insert(contact);
            }
            Some(name) => {
                let index = match groups.iter().position(|group| &group.name == name) {
                    Some(index) => index,
                    None => {
                        groups.push(ContactGroup::new(name));
                        groups.len() - 1
                    }
                };
                if !root.contains(&contact.id)
                    && !groups.iter().any(|group| group.contains(&contact.id))
                {
                    groups[index].insert(contact);
                }
            }
        }
    }

    for group in groups {
        root.insert_group(group);
    }
    root
}

/// Entries still waiting for our answer become incoming friend requests.
pub fn roster_requests(entries: &[RosterEntry]) -> Vec<ConnectionNotice> {
    entries
        .iter()
        .filter(|entry| entry.subscription == Subscription::Ask)
        .map(|entry| incoming_request(&entry.address, entry.alias.as_deref().unwrap_or(&entry.address)))
        .collect()
}

/// Roster pushed after the connection opened: new contacts and requests.
pub fn roster_updates(entries: &[RosterEntry]) -> Vec<ConnectionNotice> {
    let mut notices: Vec<ConnectionNotice> = entries
        .iter()
        .filter(|entry| entry.subscription == Subscription::Yes)
        .map(|entry| ConnectionNotice::ContactAdded(entry_contact(entry)))
        .collect();
    notices.extend(roster_requests(entries));
    notices
}

/// A subscription changed for `address`, known in the roster as `alias`.
///
/// `Yes` confirms a contact and accepts our pending request; `No` rejects it
/// and drops the contact; `Ask` is a new incoming request.
pub fn subscription_notices(
    address: &str,
    alias: Option<&str>,
    subscription: Subscription,
) -> Vec<ConnectionNotice> {
    let name = alias.unwrap_or(address);
    match subscription {
        Subscription::Yes => vec![
            ConnectionNotice::FriendRequestResolved {
                peer_id: address.to_owned(),
                accepted: true,
            },
            ConnectionNotice::ContactAdded(Contact::new(address, name)),
        ],
        Subscription::No => vec![
            ConnectionNotice::FriendRequestResolved {
                peer_id: address.to_owned(),
                accepted: false,
            },
            ConnectionNotice::ContactRemoved {
                contact_id: address.to_owned(),
            },
        ],
        Subscription::Ask => vec![incoming_request(address, name)],
    }
}

/// One-to-one translation of contact, channel and text events.
///
/// Status, roster and subscription events depend on per-connection state
/// and are handled by the router.
pub fn account_notice(event: FederationEvent) -> Option<ConnectionNotice> {
    match event {
        FederationEvent::PresenceChanged {
            address,
            status,
            message,
            ..
        } => Some(ConnectionNotice::PresenceChanged {
            contact_id: address,
            status,
            message,
        }),
        FederationEvent::AliasChanged { address, alias, .. } => {
            Some(ConnectionNotice::ContactRenamed {
                contact_id: address,
                name: alias,
            })
        }
        FederationEvent::ChannelReady { target, .. } => {
            Some(ConnectionNotice::SessionOpened { target })
        }
        FederationEvent::ChannelFailed { target, reason, .. } => {
            Some(ConnectionNotice::SessionFailed { target, reason })
        }
        FederationEvent::ChannelClosed { target, .. } => {
            Some(ConnectionNotice::SessionClosed { target })
        }
        FederationEvent::TextReceived {
            target,
            sender,
            sender_alias,
            resource,
            text,
            timestamp_ms,
            ..
        } => {
            let name = sender_alias.unwrap_or_else(|| sender.clone());
            Some(ConnectionNotice::MessageReceived {
                target,
                origin: MessageOrigin::new(sender, name)
                    .with_payload(BackendPayload::Federated { resource }),
                text,
                timestamp_ms,
            })
        }
        FederationEvent::ManagerReady { .. }
        | FederationEvent::StatusChanged { .. }
        | FederationEvent::Roster { .. }
        | FederationEvent::SubscriptionChanged { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use comms_core::SessionTarget;
    use uuid::Uuid;

    use super::*;

    fn roster() -> Vec<RosterEntry> {
        vec![
            RosterEntry::new("bob@x", Subscription::Yes).with_alias("Bob"),
            RosterEntry::new("eve@x", Subscription::Yes).in_group("work"),
            RosterEntry::new("carol@x", Subscription::Ask).with_alias("Carol"),
            RosterEntry::new("mallory@x", Subscription::No),
        ]
    }

    #[test]
    fn mutual_entries_become_grouped_contacts() {
        let contacts = roster_contacts(&roster());

        assert_eq!(contacts.name, ROSTER_ROOT);
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts.find("bob@x").map(|c| c.name.as_str()), Some("Bob"));
        assert_eq!(contacts.subgroups()[0].name, "work");
        assert!(contacts.subgroups()[0].contains("eve@x"));
        assert!(!contacts.contains("carol@x"));
        assert_eq!(
            contacts.find("eve@x").map(|c| c.presence_status.as_str()),
            Some(UNKNOWN_PRESENCE)
        );
    }

    #[test]
    fn pending_entries_become_requests() {
        assert_eq!(
            roster_requests(&roster()),
            vec![ConnectionNotice::FriendRequestReceived {
                originator_id: "carol@x".into(),
                originator_name: "Carol".into(),
                message: String::new(),
            }]
        );
    }

    #[test]
    fn subscription_no_rejects_and_removes() {
        let notices = subscription_notices("dave@x", None, Subscription::No);
        assert_eq!(
            notices[0],
            ConnectionNotice::FriendRequestResolved {
                peer_id: "dave@x".into(),
                accepted: false,
            }
        );
        assert!(matches!(notices[1], ConnectionNotice::ContactRemoved { .. }));
    }

    #[test]
    fn confirmed_subscription_keeps_roster_alias() {
        let notices = subscription_notices("carol@x", Some("Carol"), Subscription::Yes);
        assert_eq!(
            notices,
            vec![
                ConnectionNotice::FriendRequestResolved {
                    peer_id: "carol@x".into(),
                    accepted: true,
                },
                ConnectionNotice::ContactAdded(Contact::new("carol@x", "Carol")),
            ]
        );

        let unknown = subscription_notices("dave@x", None, Subscription::Yes);
        assert_eq!(
            unknown[1],
            ConnectionNotice::ContactAdded(Contact::new("dave@x", "dave@x"))
        );
    }

    #[test]
    fn text_keeps_sender_resource() {
        let notice = account_notice(FederationEvent::TextReceived {
            account: Uuid::new_v4(),
            target: SessionTarget::Private("bob@x".into()),
            sender: "bob@x".into(),
            sender_alias: None,
            resource: Some("laptop".into()),
            text: "hi".into(),
            timestamp_ms: Some(7),
        })
        .expect("text is translated");

        let ConnectionNotice::MessageReceived { origin, .. } = notice else {
            panic!("expected a message notice");
        };
        assert_eq!(origin.name, "bob@x");
        assert_eq!(
            origin.payload,
            BackendPayload::Federated {
                resource: Some("laptop".into())
            }
        );
    }
}
