use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use uuid::Uuid;

/// What kind of object spoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatSourceType {
    System,
    Agent,
    Object,
}

/// Volume or meaning of a chat packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatType {
    Whisper,
    Normal,
    Shout,
    StartTyping,
    StopTyping,
    OwnerSay,
}

impl ChatType {
    /// Typing indicators carry no text.
    pub fn is_typing_indicator(self) -> bool {
        matches!(self, Self::StartTyping | Self::StopTyping)
    }
}

/// Chat line relayed by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatFromSimulator {
    pub from_name: String,
    pub source_id: Uuid,
    pub owner_id: Uuid,
    pub source_type: ChatSourceType,
    pub chat_type: ChatType,
    pub message: String,
}

impl ChatFromSimulator {
    /// Normal-volume chat spoken by an avatar.
    pub fn said(from_name: impl Into<String>, source_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            from_name: from_name.into(),
            source_id,
            owner_id: source_id,
            source_type: ChatSourceType::Agent,
            chat_type: ChatType::Normal,
            message: message.into(),
        }
    }
}

/// A logged-in world session that can carry chat.
///
/// Owned by the world login code; the chat provider only borrows it.
pub trait WorldStream: Send + Sync {
    fn sim_name(&self) -> String;

    fn agent_id(&self) -> Uuid;

    fn agent_name(&self) -> String;

    /// Queue a ChatFromViewer packet.
    fn send_chat_from_viewer(&self, text: &str, channel: i32);

    /// Feed of incoming chat. Closes when the world session ends.
    fn chat_packets(&self) -> broadcast::Receiver<ChatFromSimulator>;
}

/// In-process world stream. Chat sent from the viewer is echoed back the way
/// a simulator does.
#[derive(Debug)]
pub struct LocalWorldStream {
    sim_name: String,
    agent_id: Uuid,
    agent_name: String,
    packets: Mutex<Option<broadcast::Sender<ChatFromSimulator>>>,
    sent: Mutex<Vec<(String, i32)>>,
}

impl LocalWorldStream {
    pub fn new(sim_name: impl Into<String>, agent_id: Uuid, agent_name: impl Into<String>) -> Self {
        let (packets, _) = broadcast::channel(256);
        Self {
            sim_name: sim_name.into(),
            agent_id,
            agent_name: agent_name.into(),
            packets: Mutex::new(Some(packets)),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Deliver a packet as if the simulator sent it. Returns `false` when the
    /// stream is closed or nobody listens.
    pub fn inject(&self, packet: ChatFromSimulator) -> bool {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|packets| packets.send(packet).is_ok())
    }

    /// Text and channel of every ChatFromViewer packet so far.
    pub fn sent(&self) -> Vec<(String, i32)> {
        self.sent_log().clone()
    }

    /// End the world session; chat feeds close.
    pub fn close(&self) {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn sent_log(&self) -> MutexGuard<'_, Vec<(String, i32)>> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorldStream for LocalWorldStream {
    fn sim_name(&self) -> String {
        self.sim_name.clone()
    }

    fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    fn agent_name(&self) -> String {
        self.agent_name.clone()
    }

    fn send_chat_from_viewer(&self, text: &str, channel: i32) {
        self.sent_log().push((text.to_owned(), channel));
        self.inject(ChatFromSimulator::said(
            self.agent_name.clone(),
            self.agent_id,
            text,
        ));
    }

    fn chat_packets(&self) -> broadcast::Receiver<ChatFromSimulator> {
        match self
            .packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(packets) => packets.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}
