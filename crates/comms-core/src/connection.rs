use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    channel::{
        DEFAULT_EVENT_BUFFER, EventHub, EventStream, NoticeReceiver, NoticeSender, notice_channel,
    },
    chat::{ChatSession, Participant},
    contact::{Contact, ContactGroup},
    error::CommError,
    friend_request::FriendRequest,
    service::LifecycleNotifier,
    state_machine::{Lifecycle, StateMachine},
    types::{
        BackendKind, BackendPayload, Capabilities, ConnectionState, Credentials,
        FriendRequestState, RequestDirection, SessionState, SessionTarget,
    },
};

/// Presence statuses a backend may report but a user cannot select.
pub const HIDDEN_PRESENCE_STATUSES: [&str; 3] = ["offline", "unknown", "error"];

/// Calls from the core into a backend.
///
/// Implementations must not block: they queue the work and report the
/// outcome later through the connection's [`BackendSink`].
pub trait ConnectionTransport: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Start setting up a session. Synchronous validation failures (such as
    /// an unknown channel) are returned; the session opens on
    /// [`ConnectionNotice::SessionOpened`].
    fn open_chat_session(&self, target: &SessionTarget) -> Result<(), CommError>;

    fn send_chat_message(&self, target: &SessionTarget, text: &str);

    /// Tear a session down. The backend confirms every call with exactly one
    /// [`ConnectionNotice::SessionClosed`] for `target`.
    fn close_chat_session(&self, target: &SessionTarget);

    fn send_friend_request(&self, to: &str, message: &str);

    fn answer_friend_request(&self, from: &str, accept: bool);

    fn remove_contact(&self, contact_id: &str);

    fn set_presence(&self, status: &str, message: &str);

    /// Every status the backend knows, including ones a user cannot select.
    fn presence_status_options(&self) -> Vec<String>;

    fn disconnect(&self);
}

/// Who sent an incoming message, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOrigin {
    pub id: String,
    pub name: String,
    pub payload: BackendPayload,
}

impl MessageOrigin {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            payload: BackendPayload::None,
        }
    }

    pub fn with_payload(mut self, payload: BackendPayload) -> Self {
        self.payload = payload;
        self
    }
}

/// Backend-to-core notices, applied in order by the connection's dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotice {
    /// Login finished; `contacts` is the initial friend list.
    Opened { contacts: ContactGroup },
    Failed { reason: String },
    ContactAdded(Contact),
    ContactRemoved { contact_id: String },
    PresenceChanged {
        contact_id: String,
        status: String,
        message: String,
    },
    ContactRenamed { contact_id: String, name: String },
    FriendRequestReceived {
        originator_id: String,
        originator_name: String,
        message: String,
    },
    /// The remote party answered (or another client of ours answered) a
    /// pending request.
    FriendRequestResolved { peer_id: String, accepted: bool },
    SessionOpened { target: SessionTarget },
    SessionFailed { target: SessionTarget, reason: String },
    /// The remote side ended the session, or the backend confirms a local
    /// close.
    SessionClosed { target: SessionTarget },
    MessageReceived {
        target: SessionTarget,
        origin: MessageOrigin,
        text: String,
        timestamp_ms: Option<u64>,
    },
}

/// Backend end of a connection's notice queue.
#[derive(Debug, Clone)]
pub struct BackendSink {
    notices: NoticeSender<ConnectionNotice>,
}

impl BackendSink {
    /// Queue a notice. Returns `false` once the connection stopped listening.
    pub fn notify(&self, notice: ConnectionNotice) -> bool {
        match self.notices.send(notice) {
            Ok(()) => true,
            Err(err) => {
                debug!(%err, "connection stopped listening; dropping backend notice");
                false
            }
        }
    }

    pub fn opened(&self, contacts: ContactGroup) -> bool {
        self.notify(ConnectionNotice::Opened { contacts })
    }

    pub fn failed(&self, reason: impl Into<String>) -> bool {
        self.notify(ConnectionNotice::Failed {
            reason: reason.into(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.notices.is_closed()
    }

    /// Resolves once the connection stopped listening.
    pub async fn closed(&self) {
        self.notices.closed().await
    }
}

/// Create the notice queue for one connection.
pub fn notice_queue() -> (BackendSink, NoticeReceiver<ConnectionNotice>) {
    let (notices, receiver) = notice_channel();
    (BackendSink { notices }, receiver)
}

/// Everything a provider decides about a connection before it exists.
#[derive(Debug, Clone)]
pub struct ConnectionInit {
    pub id: Uuid,
    pub name: String,
    pub backend: BackendKind,
    pub credentials: Credentials,
    /// How the local user appears as originator of own messages.
    pub local: Participant,
    pub event_buffer: usize,
}

impl ConnectionInit {
    pub fn new(backend: BackendKind, credentials: Credentials) -> Self {
        let name = format!("{} ({})", credentials.user_id, credentials.protocol);
        let local = Participant::anonymous(&credentials.user_id, &credentials.user_id);
        Self {
            id: Uuid::new_v4(),
            name,
            backend,
            credentials,
            local,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_local(mut self, local: Participant) -> Self {
        self.local = local;
        self
    }
}

/// Events emitted by one connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        state: ConnectionState,
        reason: Option<String>,
    },
    ContactAdded(Contact),
    ContactRemoved(Contact),
    PresenceChanged(Contact),
    ContactUpdated(Contact),
    /// A session the backend opened towards us, announced before its first
    /// message is appended.
    ChatSessionReceived(ChatSession),
    FriendRequestReceived(FriendRequest),
    FriendRequestResolved {
        peer_id: String,
        direction: RequestDirection,
        state: FriendRequestState,
    },
}

#[derive(Debug)]
struct ConnectionShared {
    machine: StateMachine<ConnectionState>,
    reason: Option<String>,
    contacts: ContactGroup,
    sessions: HashMap<SessionTarget, ChatSession>,
    /// Local closes the backend has not confirmed yet, per target.
    closing: HashMap<SessionTarget, usize>,
    incoming: Vec<FriendRequest>,
    outgoing: Vec<FriendRequest>,
    presence_status: String,
    presence_message: String,
}

pub(crate) struct ConnectionInner {
    id: Uuid,
    name: String,
    backend: BackendKind,
    credentials: Credentials,
    local: Participant,
    event_buffer: usize,
    transport: Arc<dyn ConnectionTransport>,
    notifier: Option<LifecycleNotifier>,
    stop: CancellationToken,
    shared: Mutex<ConnectionShared>,
    events: EventHub<ConnectionEvent>,
}

/// Handle to one logged-in backend account. Cloning shares the connection.
///
/// Locks nest only from a connection into its sessions and friend requests,
/// never the other way round.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a connection in `Initializing` and start draining `notices`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        init: ConnectionInit,
        transport: Arc<dyn ConnectionTransport>,
        notices: NoticeReceiver<ConnectionNotice>,
        notifier: Option<LifecycleNotifier>,
    ) -> Self {
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id: init.id,
                name: init.name,
                backend: init.backend,
                credentials: init.credentials,
                local: init.local,
                event_buffer: init.event_buffer,
                transport,
                notifier,
                stop: CancellationToken::new(),
                shared: Mutex::new(ConnectionShared {
                    machine: StateMachine::new(ConnectionState::Initializing),
                    reason: None,
                    contacts: ContactGroup::default(),
                    sessions: HashMap::new(),
                    closing: HashMap::new(),
                    incoming: Vec::new(),
                    outgoing: Vec::new(),
                    presence_status: String::new(),
                    presence_message: String::new(),
                }),
                events: EventHub::new(init.event_buffer),
            }),
        };

        debug!(
            connection = %connection.inner.id,
            protocol = %connection.protocol(),
            "connection created"
        );
        let dispatcher = connection.clone();
        tokio::spawn(async move { dispatcher.dispatch(notices).await });
        connection
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn protocol(&self) -> &str {
        &self.inner.credentials.protocol
    }

    pub fn server(&self) -> &str {
        &self.inner.credentials.server
    }

    pub fn user_id(&self) -> &str {
        &self.inner.credentials.user_id
    }

    pub fn backend(&self) -> BackendKind {
        self.inner.backend
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.transport.capabilities()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().machine.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().machine.is_terminal()
    }

    /// Why the connection reached `Error`, if it did.
    pub fn reason(&self) -> Option<String> {
        self.lock().reason.clone()
    }

    pub fn subscribe(&self) -> EventStream<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Friend list snapshot. Empty unless the connection is open.
    pub fn contacts(&self) -> ContactGroup {
        let shared = self.lock();
        if shared.machine.state() == ConnectionState::Open {
            shared.contacts.clone()
        } else {
            ContactGroup::default()
        }
    }

    /// Live private session with `contact`, created if there is none.
    pub fn open_private_chat_session(&self, contact: &Contact) -> Result<ChatSession, CommError> {
        self.open_private_chat_session_with(&contact.id)
    }

    pub fn open_private_chat_session_with(&self, peer_id: &str) -> Result<ChatSession, CommError> {
        self.open_session(SessionTarget::Private(peer_id.to_owned()))
    }

    /// Live public session on `channel_id`, created if there is none.
    pub fn open_chat_session(&self, channel_id: &str) -> Result<ChatSession, CommError> {
        self.open_session(SessionTarget::Public(channel_id.to_owned()))
    }

    /// Sessions that are initializing or open, ordered by target.
    pub fn chat_sessions(&self) -> Vec<ChatSession> {
        let shared = self.lock();
        let mut sessions: Vec<ChatSession> = shared
            .sessions
            .values()
            .filter(|session| !session.state().is_terminal())
            .cloned()
            .collect();
        sessions.sort_by_key(|session| session.target().to_string());
        sessions
    }

    /// Ask `to` to become a friend. Backends without friend requests accept
    /// the call and do nothing.
    pub fn send_friend_request(&self, to: &str, message: &str) -> Result<(), CommError> {
        let capabilities = self.inner.transport.capabilities();
        {
            let mut shared = self.lock();
            ensure_open(&shared)?;
            if !capabilities.friend_requests {
                debug!(connection = %self.inner.id, "backend has no friend requests; ignoring");
                return Ok(());
            }
            if shared
                .outgoing
                .iter()
                .any(|request| request.peer_id() == to)
            {
                debug!(connection = %self.inner.id, peer = to, "friend request already pending");
                return Ok(());
            }
            let request = FriendRequest::new(
                RequestDirection::Outgoing,
                to,
                to,
                message,
                self.user_id(),
                Arc::downgrade(&self.inner),
            );
            shared.outgoing.push(request);
        }

        self.inner.transport.send_friend_request(to, message);
        Ok(())
    }

    /// Pending requests other parties sent us.
    pub fn friend_requests(&self) -> Vec<FriendRequest> {
        self.lock().incoming.clone()
    }

    /// Pending requests we sent.
    pub fn outgoing_friend_requests(&self) -> Vec<FriendRequest> {
        self.lock().outgoing.clone()
    }

    /// Ask the backend to drop `contact`. The contact disappears locally
    /// once the backend confirms.
    pub fn remove_contact(&self, contact: &Contact) -> Result<(), CommError> {
        ensure_open(&self.lock())?;
        self.inner.transport.remove_contact(&contact.id);
        Ok(())
    }

    pub fn presence_status(&self) -> String {
        self.lock().presence_status.clone()
    }

    pub fn presence_message(&self) -> String {
        self.lock().presence_message.clone()
    }

    /// Statuses the user may pass to [`Connection::set_presence_status`].
    pub fn presence_status_options(&self) -> Vec<String> {
        if self.state() != ConnectionState::Open {
            return Vec::new();
        }
        self.inner
            .transport
            .presence_status_options()
            .into_iter()
            .filter(|status| !HIDDEN_PRESENCE_STATUSES.contains(&status.as_str()))
            .collect()
    }

    pub fn set_presence_status(&self, status: &str) -> Result<(), CommError> {
        let options = self.presence_status_options();
        let message = {
            let mut shared = self.lock();
            ensure_open(&shared)?;
            if !options.is_empty() && !options.iter().any(|option| option == status) {
                return Err(CommError::Unsupported(format!(
                    "presence status '{status}'"
                )));
            }
            shared.presence_status = status.to_owned();
            shared.presence_message.clone()
        };
        self.publish_presence(status, &message);
        Ok(())
    }

    pub fn set_presence_message(&self, message: &str) -> Result<(), CommError> {
        let status = {
            let mut shared = self.lock();
            ensure_open(&shared)?;
            shared.presence_message = message.to_owned();
            shared.presence_status.clone()
        };
        self.publish_presence(&status, message);
        Ok(())
    }

    /// Close the connection and every session it owns.
    ///
    /// Closing while still initializing cancels the login; closing a closed
    /// or failed connection does nothing.
    pub fn close(&self) {
        let disconnect = {
            let mut shared = self.lock();
            match shared.machine.state() {
                ConnectionState::Initializing => self.transition(
                    &mut shared,
                    ConnectionState::Error,
                    Some("closed before the connection opened".to_owned()),
                ),
                ConnectionState::Open => {
                    self.transition(&mut shared, ConnectionState::Closed, None)
                }
                ConnectionState::Closed | ConnectionState::Error => false,
            }
        };

        if disconnect {
            self.inner.transport.disconnect();
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ConnectionInner>) -> Option<Connection> {
        weak.upgrade().map(|inner| Connection { inner })
    }

    /// Settle an incoming request on the local user's behalf.
    pub(crate) fn answer_friend_request(
        &self,
        request: &FriendRequest,
        next: FriendRequestState,
    ) -> Result<(), CommError> {
        let capabilities = self.inner.transport.capabilities();
        // Held until the answer is queued so a concurrent close disconnects
        // after it.
        let mut shared = self.lock();
        ensure_open(&shared)?;
        request.settle(next)?;
        shared.incoming.retain(|pending| !pending.ptr_eq(request));
        self.inner
            .events
            .emit(ConnectionEvent::FriendRequestResolved {
                peer_id: request.peer_id().to_owned(),
                direction: request.direction(),
                state: next,
            });

        match next {
            FriendRequestState::Accepted => {
                self.inner
                    .transport
                    .answer_friend_request(request.peer_id(), true);
            }
            FriendRequestState::Rejected if capabilities.rejection_delivery => {
                self.inner
                    .transport
                    .answer_friend_request(request.peer_id(), false);
            }
            _ => {
                debug!(
                    connection = %self.inner.id,
                    peer = request.peer_id(),
                    "backend cannot deliver rejections; rejected locally"
                );
            }
        }
        Ok(())
    }

    /// Forget a session the user closed and ask the backend to tear it down.
    pub(crate) fn release_session(&self, session: &ChatSession) {
        let target = session.target();
        {
            let mut shared = self.lock();
            if shared
                .sessions
                .get(target)
                .is_some_and(|stored| stored.ptr_eq(session))
            {
                shared.sessions.remove(target);
            }
            *shared.closing.entry(target.clone()).or_default() += 1;
        }
        debug!(connection = %self.inner.id, session = %target, "chat session closed locally");
        self.inner.transport.close_chat_session(target);
    }

    fn open_session(&self, target: SessionTarget) -> Result<ChatSession, CommError> {
        let capabilities = self.inner.transport.capabilities();
        let session = {
            let mut shared = self.lock();
            let state = shared.machine.state();
            if state != ConnectionState::Open {
                return Err(CommError::SessionCreation(format!("connection is {state:?}")));
            }
            let (supported, kind) = if target.is_public() {
                (capabilities.public_chat, "public")
            } else {
                (capabilities.private_chat, "private")
            };
            if !supported {
                return Err(CommError::SessionCreation(format!(
                    "{kind} chat is not supported by this backend"
                )));
            }
            if let Some(existing) = live_session(&shared, &target) {
                return Ok(existing);
            }

            let session = self.new_session(&shared, target.clone());
            register_session(&mut shared, session.clone())?;
            session
        };

        if let Err(err) = self.inner.transport.open_chat_session(&target) {
            {
                let mut shared = self.lock();
                if shared
                    .sessions
                    .get(&target)
                    .is_some_and(|stored| stored.ptr_eq(&session))
                {
                    shared.sessions.remove(&target);
                }
            }
            session.mark_failed(&err.to_string());
            return Err(err);
        }

        debug!(connection = %self.inner.id, session = %target, "chat session requested");
        Ok(session)
    }

    fn new_session(&self, shared: &ConnectionShared, target: SessionTarget) -> ChatSession {
        let participants = match &target {
            SessionTarget::Private(peer_id) => vec![
                shared
                    .contacts
                    .find(peer_id)
                    .map(Participant::from_contact)
                    .unwrap_or_else(|| Participant::anonymous(peer_id, peer_id)),
            ],
            SessionTarget::Public(_) => Vec::new(),
        };
        ChatSession::new(
            self.inner.id,
            target,
            self.inner.local.clone(),
            participants,
            self.inner.transport.clone(),
            self.downgrade(),
            self.inner.event_buffer,
        )
    }

    /// Take over a session the backend opened, announcing it as received.
    fn adopt_session(&self, shared: &mut ConnectionShared, target: SessionTarget) -> ChatSession {
        let session = self.new_session(shared, target.clone());
        session.mark_open();
        shared.sessions.insert(target, session.clone());
        info!(
            connection = %self.inner.id,
            session = %session.target(),
            "backend opened a chat session"
        );
        self.inner
            .events
            .emit(ConnectionEvent::ChatSessionReceived(session.clone()));
        session
    }

    fn publish_presence(&self, status: &str, message: &str) {
        if self.inner.transport.capabilities().presence {
            self.inner.transport.set_presence(status, message);
        } else {
            debug!(connection = %self.inner.id, "backend has no presence; stored locally");
        }
    }

    async fn dispatch(self, mut notices: NoticeReceiver<ConnectionNotice>) {
        loop {
            tokio::select! {
                _ = self.inner.stop.cancelled() => break,
                notice = notices.recv() => {
                    let Some(notice) = notice else {
                        let mut shared = self.lock();
                        self.transition(
                            &mut shared,
                            ConnectionState::Error,
                            Some("backend went away".to_owned()),
                        );
                        break;
                    };
                    self.apply(notice);
                }
            }
        }
        debug!(connection = %self.inner.id, state = ?self.state(), "connection dispatcher stopped");
    }

    fn apply(&self, notice: ConnectionNotice) {
        let mut shared = self.lock();
        match notice {
            ConnectionNotice::Opened { contacts } => {
                if shared.machine.state() == ConnectionState::Initializing {
                    shared.contacts = contacts;
                }
                self.transition(&mut shared, ConnectionState::Open, None);
            }
            ConnectionNotice::Failed { reason } => {
                self.transition(&mut shared, ConnectionState::Error, Some(reason));
            }
            ConnectionNotice::ContactAdded(contact) => {
                if !self.accepts_notices(&shared, "contact added") {
                    return;
                }
                let added = contact.clone();
                if shared.contacts.insert(contact) {
                    self.inner.events.emit(ConnectionEvent::ContactAdded(added));
                } else {
                    debug!(connection = %self.inner.id, contact = %added.id, "contact already known");
                }
            }
            ConnectionNotice::ContactRemoved { contact_id } => {
                if !self.accepts_notices(&shared, "contact removed") {
                    return;
                }
                match shared.contacts.remove(&contact_id) {
                    Some(removed) => self
                        .inner
                        .events
                        .emit(ConnectionEvent::ContactRemoved(removed)),
                    None => debug!(connection = %self.inner.id, contact = %contact_id, "unknown contact removed"),
                }
            }
            ConnectionNotice::PresenceChanged {
                contact_id,
                status,
                message,
            } => {
                if !self.accepts_notices(&shared, "presence") {
                    return;
                }
                let updated = shared.contacts.update(&contact_id, |contact| {
                    contact.presence_status = status;
                    contact.presence_message = message;
                });
                match updated {
                    Some(contact) => self
                        .inner
                        .events
                        .emit(ConnectionEvent::PresenceChanged(contact)),
                    None => debug!(connection = %self.inner.id, contact = %contact_id, "presence for unknown contact"),
                }
            }
            ConnectionNotice::ContactRenamed { contact_id, name } => {
                if !self.accepts_notices(&shared, "rename") {
                    return;
                }
                if let Some(contact) = shared
                    .contacts
                    .update(&contact_id, |contact| contact.name = name)
                {
                    self.inner
                        .events
                        .emit(ConnectionEvent::ContactUpdated(contact));
                }
            }
            ConnectionNotice::FriendRequestReceived {
                originator_id,
                originator_name,
                message,
            } => {
                if !self.accepts_notices(&shared, "friend request") {
                    return;
                }
                if shared.contacts.contains(&originator_id)
                    || shared
                        .incoming
                        .iter()
                        .any(|request| request.peer_id() == originator_id)
                {
                    debug!(connection = %self.inner.id, peer = %originator_id, "duplicate friend request");
                    return;
                }
                let request = FriendRequest::new(
                    RequestDirection::Incoming,
                    &originator_id,
                    &originator_name,
                    &message,
                    self.user_id(),
                    self.downgrade(),
                );
                shared.incoming.push(request.clone());
                info!(connection = %self.inner.id, peer = %originator_id, "friend request received");
                self.inner
                    .events
                    .emit(ConnectionEvent::FriendRequestReceived(request));
            }
            ConnectionNotice::FriendRequestResolved { peer_id, accepted } => {
                if !self.accepts_notices(&shared, "friend request answer") {
                    return;
                }
                let request = take_pending(&mut shared.outgoing, &peer_id)
                    .or_else(|| take_pending(&mut shared.incoming, &peer_id));
                let Some(request) = request else {
                    debug!(connection = %self.inner.id, peer = %peer_id, "answer for unknown friend request");
                    return;
                };
                let next = if accepted {
                    FriendRequestState::Accepted
                } else {
                    FriendRequestState::Rejected
                };
                if request.settle(next).is_ok() {
                    self.inner
                        .events
                        .emit(ConnectionEvent::FriendRequestResolved {
                            peer_id,
                            direction: request.direction(),
                            state: next,
                        });
                }
            }
            ConnectionNotice::SessionOpened { target } => {
                if !self.accepts_notices(&shared, "session opened") {
                    return;
                }
                match live_session(&shared, &target) {
                    Some(session) => {
                        session.mark_open();
                    }
                    None if shared.closing.contains_key(&target) => {
                        debug!(connection = %self.inner.id, session = %target, "late open for a session closed locally");
                    }
                    None => {
                        self.adopt_session(&mut shared, target);
                    }
                }
            }
            ConnectionNotice::SessionFailed { target, reason } => {
                if shared.closing.contains_key(&target) {
                    debug!(connection = %self.inner.id, session = %target, %reason, "late failure for a session closed locally");
                    return;
                }
                if let Some(session) = live_session(&shared, &target) {
                    shared.sessions.remove(&target);
                    warn!(connection = %self.inner.id, session = %target, %reason, "chat session failed");
                    session.mark_failed(&reason);
                }
            }
            ConnectionNotice::SessionClosed { target } => {
                if confirm_close(&mut shared.closing, &target) {
                    debug!(connection = %self.inner.id, session = %target, "backend confirmed chat session close");
                    return;
                }
                if let Some(session) = live_session(&shared, &target) {
                    shared.sessions.remove(&target);
                    session.end("closed by the remote party");
                }
            }
            ConnectionNotice::MessageReceived {
                target,
                origin,
                text,
                timestamp_ms,
            } => {
                if !self.accepts_notices(&shared, "message") {
                    return;
                }
                let session = match live_session(&shared, &target) {
                    Some(session) => session,
                    None => self.adopt_session(&mut shared, target),
                };
                if session.state() == SessionState::Initializing {
                    session.mark_open();
                }
                let participant = Participant {
                    contact: shared.contacts.find(&origin.id).cloned(),
                    id: origin.id,
                    name: origin.name,
                    payload: origin.payload,
                };
                session.receive_message(participant, text, timestamp_ms);
            }
        }
    }

    fn accepts_notices(&self, shared: &ConnectionShared, kind: &str) -> bool {
        let state = shared.machine.state();
        if state == ConnectionState::Open {
            return true;
        }
        debug!(connection = %self.inner.id, ?state, kind, "ignoring notice for connection that is not open");
        false
    }

    /// Take a lifecycle edge. Terminal edges end every owned session.
    fn transition(
        &self,
        shared: &mut ConnectionShared,
        next: ConnectionState,
        reason: Option<String>,
    ) -> bool {
        if let Err(err) = shared.machine.advance(next) {
            debug!(connection = %self.inner.id, %err, "ignoring connection transition");
            return false;
        }
        if reason.is_some() {
            shared.reason = reason.clone();
        }

        match (next, reason.as_deref()) {
            (ConnectionState::Error, Some(reason)) => {
                warn!(connection = %self.inner.id, reason, "connection failed")
            }
            _ => info!(connection = %self.inner.id, state = ?next, "connection state changed"),
        }
        self.inner.events.emit(ConnectionEvent::StateChanged {
            state: next,
            reason: reason.clone(),
        });

        if next.is_terminal() {
            self.inner.stop.cancel();
            let session_reason = reason.unwrap_or_else(|| "connection closed".to_owned());
            for (_, session) in shared.sessions.drain() {
                session.end(&session_reason);
            }
            shared.closing.clear();
            shared.incoming.clear();
            shared.outgoing.clear();
        }

        if let Some(notifier) = &self.inner.notifier {
            match next {
                ConnectionState::Open => notifier.connection_opened(self.inner.id, self.protocol()),
                ConnectionState::Closed | ConnectionState::Error => notifier.connection_closed(
                    self.inner.id,
                    self.protocol(),
                    next,
                    shared.reason.clone(),
                ),
                ConnectionState::Initializing => {}
            }
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionShared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("backend", &self.inner.backend)
            .field("state", &self.state())
            .finish()
    }
}

fn ensure_open(shared: &ConnectionShared) -> Result<(), CommError> {
    match shared.machine.state() {
        ConnectionState::Open => Ok(()),
        state => Err(CommError::ConnectionNotOpen(state)),
    }
}

fn live_session(shared: &ConnectionShared, target: &SessionTarget) -> Option<ChatSession> {
    shared
        .sessions
        .get(target)
        .filter(|session| !session.state().is_terminal())
        .cloned()
}

/// Store a new session, refusing a second live session for the same target.
fn register_session(shared: &mut ConnectionShared, session: ChatSession) -> Result<(), CommError> {
    if live_session(shared, session.target()).is_some() {
        return Err(match session.target() {
            SessionTarget::Private(peer_id) => CommError::DuplicatePrivateSession(peer_id.clone()),
            SessionTarget::Public(channel) => {
                CommError::SessionCreation(format!("channel '{channel}' already has a session"))
            }
        });
    }
    shared.sessions.insert(session.target().clone(), session);
    Ok(())
}

/// Consume one outstanding local close for `target`.
fn confirm_close(closing: &mut HashMap<SessionTarget, usize>, target: &SessionTarget) -> bool {
    let Some(pending) = closing.get_mut(target) else {
        return false;
    };
    *pending -= 1;
    if *pending == 0 {
        closing.remove(target);
    }
    true
}

fn take_pending(requests: &mut Vec<FriendRequest>, peer_id: &str) -> Option<FriendRequest> {
    let index = requests
        .iter()
        .position(|request| request.peer_id() == peer_id)?;
    Some(requests.remove(index))
}
