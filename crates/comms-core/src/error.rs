use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used by callers to decide how to react.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller asked for something the registry or backend cannot serve.
    Config,
    /// Operation is not valid in the current lifecycle state.
    State,
    /// Transport-reported failure.
    Backend,
}

/// Errors returned synchronously by the public operations.
///
/// Asynchronous backend failures are never returned here; they surface as a
/// transition to the `Error` state with a reason string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
pub enum CommError {
    #[error("no registered provider supports protocol '{0}'")]
    UnsupportedProtocol(String),
    #[error("protocol '{protocol}' is already provided by '{provider}'")]
    DuplicateProtocol { protocol: String, provider: String },
    #[error("provider '{0}' is not ready")]
    ProviderNotReady(String),
    #[error("connection is not open (state {0:?})")]
    ConnectionNotOpen(ConnectionState),
    #[error("cannot create chat session: {0}")]
    SessionCreation(String),
    #[error("chat session is not open")]
    SessionClosed,
    #[error("invalid channel '{0}'")]
    InvalidChannel(String),
    #[error("a private session with '{0}' is already live")]
    DuplicatePrivateSession(String),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl CommError {
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend(reason.into())
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_transition(from: impl Debug, to: impl Debug) -> Self {
        Self::InvalidTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedProtocol(_) => "unsupported_protocol",
            Self::DuplicateProtocol { .. } => "duplicate_protocol",
            Self::ProviderNotReady(_) => "provider_not_ready",
            Self::ConnectionNotOpen(_) => "connection_not_open",
            Self::SessionCreation(_) => "session_creation_failed",
            Self::SessionClosed => "session_closed",
            Self::InvalidChannel(_) => "invalid_channel",
            Self::DuplicatePrivateSession(_) => "duplicate_private_session",
            Self::InvalidTransition { .. } => "invalid_state_transition",
            Self::Unsupported(_) => "unsupported_operation",
            Self::Backend(_) => "backend_error",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnsupportedProtocol(_)
            | Self::DuplicateProtocol { .. }
            | Self::InvalidChannel(_)
            | Self::Unsupported(_) => ErrorCategory::Config,
            Self::ProviderNotReady(_)
            | Self::ConnectionNotOpen(_)
            | Self::SessionCreation(_)
            | Self::SessionClosed
            | Self::DuplicatePrivateSession(_)
            | Self::InvalidTransition { .. } => ErrorCategory::State,
            Self::Backend(_) => ErrorCategory::Backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionState;

    #[test]
    fn keeps_invalid_transition_code_stable() {
        let err = CommError::invalid_transition(SessionState::Closed, SessionState::Open);
        assert_eq!(err.code(), "invalid_state_transition");
        assert_eq!(err.category(), ErrorCategory::State);
        assert_eq!(err.to_string(), "invalid transition from Closed to Open");
    }

    #[test]
    fn classifies_registry_errors_as_config() {
        assert_eq!(
            CommError::UnsupportedProtocol("irc".into()).category(),
            ErrorCategory::Config
        );
        assert_eq!(
            CommError::InvalidChannel("1".into()).code(),
            "invalid_channel"
        );
        assert_eq!(
            CommError::backend("socket reset").category(),
            ErrorCategory::Backend
        );
    }
}
