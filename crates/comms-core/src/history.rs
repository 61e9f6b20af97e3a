use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::chat::Participant;

/// One chat line. Immutable once appended to a history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub originator: Participant,
    /// Milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    pub text: String,
    /// Sent by the local user.
    pub own: bool,
}

/// Append-only in-memory message log of one session.
///
/// Timestamps never decrease: a message stamped earlier than the previous
/// one is re-stamped with the previous timestamp.
#[derive(Debug, Clone, Default)]
pub struct MessageHistory {
    messages: Vec<Message>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append `message`, returning the stored copy.
    pub fn append(&mut self, mut message: Message) -> &Message {
        if let Some(last) = self.messages.last() {
            message.timestamp_ms = message.timestamp_ms.max(last.timestamp_ms);
        }
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    /// Owned copy unaffected by later appends.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }
}

/// Current wall-clock time in milliseconds since Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
