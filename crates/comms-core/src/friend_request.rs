use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use crate::{
    connection::{Connection, ConnectionInner},
    error::CommError,
    state_machine::StateMachine,
    types::{ConnectionState, FriendRequestState, RequestDirection},
};

struct RequestInner {
    direction: RequestDirection,
    peer_id: String,
    peer_name: String,
    message: String,
    local_id: String,
    machine: Mutex<StateMachine<FriendRequestState>>,
    connection: Weak<ConnectionInner>,
}

/// A pending or settled friendship request. Cloning shares the request.
///
/// A request leaves `Pending` exactly once.
#[derive(Clone)]
pub struct FriendRequest {
    inner: Arc<RequestInner>,
}

impl FriendRequest {
    pub(crate) fn new(
        direction: RequestDirection,
        peer_id: impl Into<String>,
        peer_name: impl Into<String>,
        message: impl Into<String>,
        local_id: impl Into<String>,
        connection: Weak<ConnectionInner>,
    ) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                direction,
                peer_id: peer_id.into(),
                peer_name: peer_name.into(),
                message: message.into(),
                local_id: local_id.into(),
                machine: Mutex::new(StateMachine::new(FriendRequestState::Pending)),
                connection,
            }),
        }
    }

    pub fn direction(&self) -> RequestDirection {
        self.inner.direction
    }

    /// The remote party: sender of an incoming request, addressee of an
    /// outgoing one.
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn peer_name(&self) -> &str {
        &self.inner.peer_name
    }

    /// Who asked.
    pub fn originator_id(&self) -> &str {
        match self.inner.direction {
            RequestDirection::Incoming => &self.inner.peer_id,
            RequestDirection::Outgoing => &self.inner.local_id,
        }
    }

    pub fn originator_name(&self) -> &str {
        match self.inner.direction {
            RequestDirection::Incoming => &self.inner.peer_name,
            RequestDirection::Outgoing => &self.inner.local_id,
        }
    }

    pub fn message(&self) -> &str {
        &self.inner.message
    }

    pub fn state(&self) -> FriendRequestState {
        self.lock().state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == FriendRequestState::Pending
    }

    pub fn ptr_eq(&self, other: &FriendRequest) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Accept an incoming request. The contact shows up once the backend
    /// confirms it.
    pub fn accept(&self) -> Result<(), CommError> {
        self.answer(FriendRequestState::Accepted)
    }

    /// Reject an incoming request.
    pub fn reject(&self) -> Result<(), CommError> {
        self.answer(FriendRequestState::Rejected)
    }

    fn answer(&self, next: FriendRequestState) -> Result<(), CommError> {
        if self.inner.direction == RequestDirection::Outgoing {
            return Err(CommError::Unsupported(
                "outgoing friend requests are answered by the remote party".to_owned(),
            ));
        }
        let connection = Connection::upgrade(&self.inner.connection)
            .ok_or(CommError::ConnectionNotOpen(ConnectionState::Closed))?;
        connection.answer_friend_request(self, next)
    }

    /// Move out of `Pending`. Fails if the request was already settled.
    pub(crate) fn settle(&self, next: FriendRequestState) -> Result<(), CommError> {
        self.lock().advance(next).map(|_| ())
    }

    fn lock(&self) -> MutexGuard<'_, StateMachine<FriendRequestState>> {
        self.inner
            .machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for FriendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FriendRequest")
            .field("direction", &self.inner.direction)
            .field("peer_id", &self.inner.peer_id)
            .field("state", &self.state())
            .finish()
    }
}
