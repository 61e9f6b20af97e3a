use std::fmt::Debug;

use crate::{
    error::CommError,
    types::{ConnectionState, FriendRequestState, ProviderState, SessionState},
};

/// A lifecycle state enum with a fixed transition graph.
pub trait Lifecycle: Copy + Eq + Debug {
    /// Whether `self -> next` is an edge of the graph.
    fn permits(self, next: Self) -> bool;

    fn is_terminal(self) -> bool;
}

impl Lifecycle for ConnectionState {
    fn permits(self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Initializing, Open) | (Initializing, Error) | (Open, Closed) | (Open, Error)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

impl Lifecycle for SessionState {
    fn permits(self, next: Self) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Initializing, Open) | (Initializing, Error) | (Open, Closed)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

impl Lifecycle for FriendRequestState {
    fn permits(self, next: Self) -> bool {
        self == Self::Pending && next != Self::Pending
    }

    fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

impl Lifecycle for ProviderState {
    fn permits(self, next: Self) -> bool {
        self == Self::Initializing && next != Self::Initializing
    }

    fn is_terminal(self) -> bool {
        self == Self::Error
    }
}

/// Current state plus the guard that only graph edges are taken.
#[derive(Debug, Clone)]
pub struct StateMachine<S: Lifecycle> {
    state: S,
}

impl<S: Lifecycle> StateMachine<S> {
    pub fn new(initial: S) -> Self {
        Self { state: initial }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next`, returning the previous state.
    pub fn advance(&mut self, next: S) -> Result<S, CommError> {
        if !self.state.permits(next) {
            return Err(CommError::invalid_transition(self.state, next));
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECTION_STATES: [ConnectionState; 4] = [
        ConnectionState::Initializing,
        ConnectionState::Open,
        ConnectionState::Closed,
        ConnectionState::Error,
    ];

    const SESSION_STATES: [SessionState; 4] = [
        SessionState::Initializing,
        SessionState::Open,
        SessionState::Closed,
        SessionState::Error,
    ];

    #[test]
    fn connection_graph_has_exactly_four_edges() {
        let mut edges = Vec::new();
        for from in CONNECTION_STATES {
            for to in CONNECTION_STATES {
                let mut sm = StateMachine::new(from);
                match sm.advance(to) {
                    Ok(previous) => {
                        assert_eq!(previous, from);
                        assert_eq!(sm.state(), to);
                        edges.push((from, to));
                    }
                    Err(err) => {
                        assert_eq!(err.code(), "invalid_state_transition");
                        assert_eq!(sm.state(), from, "failed advance must not move");
                    }
                }
            }
        }

        use ConnectionState::*;
        assert_eq!(
            edges,
            vec![
                (Initializing, Open),
                (Initializing, Error),
                (Open, Closed),
                (Open, Error)
            ]
        );
    }

    #[test]
    fn terminal_connection_states_have_no_way_out() {
        for from in CONNECTION_STATES.into_iter().filter(|s| s.is_terminal()) {
            assert!(CONNECTION_STATES.iter().all(|to| !from.permits(*to)));
        }
    }

    #[test]
    fn session_graph_matches_lifecycle() {
        use SessionState::*;
        let permitted: Vec<_> = SESSION_STATES
            .iter()
            .flat_map(|from| SESSION_STATES.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.permits(*to))
            .collect();
        assert_eq!(
            permitted,
            vec![(Initializing, Open), (Initializing, Error), (Open, Closed)]
        );
    }

    #[test]
    fn friend_request_transitions_exactly_once() {
        let mut sm = StateMachine::new(FriendRequestState::Pending);
        sm.advance(FriendRequestState::Accepted)
            .expect("pending request can be accepted");
        sm.advance(FriendRequestState::Rejected)
            .expect_err("accepted request must never become rejected");
        assert_eq!(sm.state(), FriendRequestState::Accepted);
        assert!(sm.is_terminal());
    }

    #[test]
    fn provider_leaves_initializing_once() {
        let mut sm = StateMachine::new(ProviderState::Initializing);
        sm.advance(ProviderState::Ready).expect("provider becomes ready");
        sm.advance(ProviderState::Error)
            .expect_err("ready provider cannot be re-initialized into error");
    }
}
