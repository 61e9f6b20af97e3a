use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{
    channel::{EventHub, EventStream},
    connection::{Connection, ConnectionInner, ConnectionTransport},
    contact::Contact,
    error::CommError,
    history::{Message, MessageHistory, now_ms},
    state_machine::StateMachine,
    types::{BackendPayload, SessionState, SessionTarget},
};

/// Someone seen in a chat session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub name: String,
    /// Set when the participant is on the connection's friend list.
    pub contact: Option<Contact>,
    pub payload: BackendPayload,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, payload: BackendPayload) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            contact: None,
            payload,
        }
    }

    /// A participant that is not a friend, e.g. a chat-room nick.
    pub fn anonymous(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, BackendPayload::None)
    }

    pub fn from_contact(contact: &Contact) -> Self {
        Self {
            id: contact.id.clone(),
            name: contact.name.clone(),
            contact: Some(contact.clone()),
            payload: BackendPayload::None,
        }
    }

    pub fn with_contact(mut self, contact: Option<Contact>) -> Self {
        self.contact = contact;
        self
    }

    pub fn is_contact(&self) -> bool {
        self.contact.is_some()
    }

    /// Avatar id when the participant spoke in a virtual world.
    pub fn in_world_avatar(&self) -> Option<Uuid> {
        match &self.payload {
            BackendPayload::InWorld { avatar_id } => Some(*avatar_id),
            _ => None,
        }
    }

    /// Sending resource when the participant is on a federated network.
    pub fn federated_resource(&self) -> Option<&str> {
        match &self.payload {
            BackendPayload::Federated { resource } => resource.as_deref(),
            _ => None,
        }
    }
}

/// Events emitted by one chat session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatSessionEvent {
    StateChanged {
        state: SessionState,
        reason: Option<String>,
    },
    /// A message was appended to history, including the local echo of our own.
    MessageReceived(Message),
    /// First utterance from a sender id not seen before.
    ParticipantJoined(Participant),
}

#[derive(Debug)]
struct SessionShared {
    machine: StateMachine<SessionState>,
    reason: Option<String>,
    participants: Vec<Participant>,
    history: MessageHistory,
}

impl SessionShared {
    fn upsert_participant(&mut self, participant: Participant) -> (Participant, bool) {
        if let Some(existing) = self.participants.iter_mut().find(|p| p.id == participant.id) {
            if existing.contact.is_none() && participant.contact.is_some() {
                existing.contact = participant.contact;
            }
            if !participant.name.is_empty() && existing.name != participant.name {
                existing.name = participant.name;
            }
            return (existing.clone(), false);
        }
        self.participants.push(participant.clone());
        (participant, true)
    }
}

struct SessionInner {
    target: SessionTarget,
    connection_id: Uuid,
    local: Participant,
    transport: Arc<dyn ConnectionTransport>,
    connection: Weak<ConnectionInner>,
    shared: Mutex<SessionShared>,
    events: EventHub<ChatSessionEvent>,
}

/// Handle to a public or private text channel. Cloning shares the session.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    pub(crate) fn new(
        connection_id: Uuid,
        target: SessionTarget,
        local: Participant,
        participants: Vec<Participant>,
        transport: Arc<dyn ConnectionTransport>,
        connection: Weak<ConnectionInner>,
        event_buffer: usize,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                target,
                connection_id,
                local,
                transport,
                connection,
                shared: Mutex::new(SessionShared {
                    machine: StateMachine::new(SessionState::Initializing),
                    reason: None,
                    participants,
                    history: MessageHistory::new(),
                }),
                events: EventHub::new(event_buffer),
            }),
        }
    }

    /// Channel id for public sessions, peer id for private ones.
    pub fn id(&self) -> &str {
        self.inner.target.id()
    }

    pub fn target(&self) -> &SessionTarget {
        &self.inner.target
    }

    pub fn is_public(&self) -> bool {
        self.inner.target.is_public()
    }

    pub fn connection_id(&self) -> Uuid {
        self.inner.connection_id
    }

    pub fn state(&self) -> SessionState {
        self.lock().machine.state()
    }

    pub fn reason(&self) -> Option<String> {
        self.lock().reason.clone()
    }

    pub fn subscribe(&self) -> EventStream<ChatSessionEvent> {
        self.inner.events.subscribe()
    }

    /// Whether both handles refer to the same session.
    pub fn ptr_eq(&self, other: &ChatSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Send `text` to the session.
    ///
    /// The message is appended to history and emitted immediately; the
    /// backend is not asked to acknowledge it.
    pub fn send_chat_message(&self, text: &str) -> Result<Message, CommError> {
        let message = {
            let mut shared = self.lock();
            if shared.machine.state() != SessionState::Open {
                return Err(CommError::SessionClosed);
            }
            self.record(
                &mut shared,
                Message {
                    originator: self.inner.local.clone(),
                    timestamp_ms: now_ms(),
                    text: text.to_owned(),
                    own: true,
                },
            )
        };

        self.inner
            .transport
            .send_chat_message(&self.inner.target, text);
        Ok(message)
    }

    /// Full history, oldest first.
    pub fn message_history(&self) -> Vec<Message> {
        self.lock().history.snapshot()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.lock().participants.clone()
    }

    /// Close the session. Closing a session that is still being set up
    /// aborts the setup.
    pub fn close(&self) {
        let notify_backend = {
            let mut shared = self.lock();
            match shared.machine.state() {
                SessionState::Initializing => self.transition(
                    &mut shared,
                    SessionState::Error,
                    Some("closed before the session opened".to_owned()),
                ),
                SessionState::Open => self.transition(&mut shared, SessionState::Closed, None),
                SessionState::Closed | SessionState::Error => false,
            }
        };

        if !notify_backend {
            return;
        }
        match Connection::upgrade(&self.inner.connection) {
            Some(connection) => connection.release_session(self),
            None => self.inner.transport.close_chat_session(&self.inner.target),
        }
    }

    /// Insert or refresh a participant keyed by id.
    pub(crate) fn upsert_participant(&self, participant: Participant) -> Participant {
        let mut shared = self.lock();
        let (stored, joined) = shared.upsert_participant(participant);
        if joined {
            self.inner
                .events
                .emit(ChatSessionEvent::ParticipantJoined(stored.clone()));
        }
        stored
    }

    pub(crate) fn mark_open(&self) -> bool {
        let mut shared = self.lock();
        self.transition(&mut shared, SessionState::Open, None)
    }

    /// Backend could not set the session up.
    pub(crate) fn mark_failed(&self, reason: &str) -> bool {
        let mut shared = self.lock();
        match shared.machine.state() {
            SessionState::Initializing => {
                self.transition(&mut shared, SessionState::Error, Some(reason.to_owned()))
            }
            SessionState::Open => {
                self.transition(&mut shared, SessionState::Closed, Some(reason.to_owned()))
            }
            SessionState::Closed | SessionState::Error => false,
        }
    }

    /// Ended by the remote side or by the owning connection going away.
    pub(crate) fn end(&self, reason: &str) -> bool {
        self.mark_failed(reason)
    }

    pub(crate) fn receive_message(
        &self,
        sender: Participant,
        text: String,
        timestamp_ms: Option<u64>,
    ) -> Option<Message> {
        let mut shared = self.lock();
        if shared.machine.state() != SessionState::Open {
            debug!(
                session = %self.inner.target,
                state = ?shared.machine.state(),
                "dropping message for session that is not open"
            );
            return None;
        }
        Some(self.record(
            &mut shared,
            Message {
                originator: sender,
                timestamp_ms: timestamp_ms.unwrap_or_else(now_ms),
                text,
                own: false,
            },
        ))
    }

    fn record(&self, shared: &mut SessionShared, message: Message) -> Message {
        let (originator, joined) = shared.upsert_participant(message.originator.clone());
        if joined {
            self.inner
                .events
                .emit(ChatSessionEvent::ParticipantJoined(originator.clone()));
        }
        let stored = shared
            .history
            .append(Message {
                originator,
                ..message
            })
            .clone();
        self.inner
            .events
            .emit(ChatSessionEvent::MessageReceived(stored.clone()));
        stored
    }

    fn transition(
        &self,
        shared: &mut SessionShared,
        next: SessionState,
        reason: Option<String>,
    ) -> bool {
        if let Err(err) = shared.machine.advance(next) {
            debug!(session = %self.inner.target, %err, "ignoring session transition");
            return false;
        }
        if reason.is_some() {
            shared.reason = reason.clone();
        }
        debug!(session = %self.inner.target, state = ?next, "chat session state changed");
        self.inner
            .events
            .emit(ChatSessionEvent::StateChanged { state: next, reason });
        true
    }

    fn lock(&self) -> MutexGuard<'_, SessionShared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatSession")
            .field("target", &self.inner.target)
            .field("connection_id", &self.inner.connection_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;

    fn session(target: SessionTarget) -> (ChatSession, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let session = ChatSession::new(
            Uuid::new_v4(),
            target,
            Participant::anonymous("me@x", "Me"),
            Vec::new(),
            transport.clone(),
            Weak::new(),
            64,
        );
        (session, transport)
    }

    #[test]
    fn send_requires_open_session() {
        let (session, transport) = session(SessionTarget::Public("0".into()));
        let err = session
            .send_chat_message("too early")
            .expect_err("initializing session must reject sends");
        assert_eq!(err, CommError::SessionClosed);
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn echoes_own_message_before_backend_ack() {
        let (session, transport) = session(SessionTarget::Public("0".into()));
        assert!(session.mark_open());

        let sent = session.send_chat_message("hello").expect("open session sends");
        assert!(sent.own);
        assert_eq!(session.message_history(), vec![sent]);
        assert_eq!(transport.calls(), vec!["send channel:0 hello".to_owned()]);
    }

    #[test]
    fn interleaved_history_keeps_call_order() {
        let (session, _) = session(SessionTarget::Public("0".into()));
        session.mark_open();

        session.send_chat_message("a").expect("send a");
        session.receive_message(Participant::anonymous("u1", "Bob"), "b".into(), None);
        session.send_chat_message("c").expect("send c");
        session.receive_message(Participant::anonymous("u2", "Eve"), "d".into(), Some(1));

        let texts: Vec<_> = session
            .message_history()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn discovers_participants_by_first_utterance() {
        let (session, _) = session(SessionTarget::Public("0".into()));
        session.mark_open();
        let mut events = session.subscribe();

        session.receive_message(Participant::anonymous("u1", "Bob"), "hi".into(), None);
        session.receive_message(Participant::anonymous("u1", "Bob"), "again".into(), None);

        let participants = session.participants();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].name, "Bob");
        assert!(!participants[0].is_contact());

        assert!(matches!(
            events.try_recv(),
            Ok(ChatSessionEvent::ParticipantJoined(p)) if p.id == "u1"
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(ChatSessionEvent::MessageReceived(m)) if m.text == "hi"
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(ChatSessionEvent::MessageReceived(m)) if m.text == "again"
        ));
    }

    #[test]
    fn upsert_attaches_contact_when_learned_later() {
        let (session, _) = session(SessionTarget::Private("bob@x".into()));
        session.upsert_participant(Participant::anonymous("bob@x", "bob"));
        let stored = session.upsert_participant(
            Participant::anonymous("bob@x", "Bob").with_contact(Some(Contact::new("bob@x", "Bob"))),
        );
        assert!(stored.is_contact());
        assert_eq!(stored.name, "Bob");
        assert_eq!(session.participants().len(), 1);
    }

    #[test]
    fn close_is_terminal() {
        let (session, transport) = session(SessionTarget::Private("bob@x".into()));
        session.mark_open();
        session.close();
        session.close();

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.send_chat_message("after close"),
            Err(CommError::SessionClosed)
        );
        assert!(!session.mark_open());
        assert_eq!(transport.calls(), vec!["close private:bob@x".to_owned()]);
    }

    #[test]
    fn closing_during_setup_aborts_to_error() {
        let (session, _) = session(SessionTarget::Public("lobby".into()));
        session.close();
        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(
            session.reason().as_deref(),
            Some("closed before the session opened")
        );
    }

    #[test]
    fn messages_after_close_are_ignored() {
        let (session, _) = session(SessionTarget::Public("0".into()));
        session.mark_open();
        session.end("remote closed");
        assert!(
            session
                .receive_message(Participant::anonymous("u1", "Bob"), "late".into(), None)
                .is_none()
        );
        assert!(session.message_history().is_empty());
        assert_eq!(session.reason().as_deref(), Some("remote closed"));
    }
}
