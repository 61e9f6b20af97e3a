use comms_core::{BackendPayload, CommError, ConnectionNotice, MessageOrigin, SessionTarget};
use uuid::Uuid;

use crate::{
    PUBLIC_CHANNEL,
    world::{ChatFromSimulator, ChatSourceType},
};

/// Map a channel id to the simulator channel number.
pub fn parse_channel(channel_id: &str) -> Result<i32, CommError> {
    if channel_id == PUBLIC_CHANNEL {
        Ok(0)
    } else {
        Err(CommError::InvalidChannel(channel_id.to_owned()))
    }
}

/// Turn a simulator chat packet into a message notice for the public channel.
///
/// Typing indicators, empty lines and the simulator's echo of our own chat
/// yield `None`.
pub fn translate_chat(packet: &ChatFromSimulator, agent_id: Uuid) -> Option<ConnectionNotice> {
    if packet.chat_type.is_typing_indicator() {
        return None;
    }
    if packet.message.trim().is_empty() {
        return None;
    }
    if packet.source_type == ChatSourceType::Agent && packet.source_id == agent_id {
        return None;
    }

    let origin = MessageOrigin::new(packet.source_id.to_string(), &packet.from_name).with_payload(
        BackendPayload::InWorld {
            avatar_id: packet.source_id,
        },
    );
    Some(ConnectionNotice::MessageReceived {
        target: SessionTarget::Public(PUBLIC_CHANNEL.to_owned()),
        origin,
        text: packet.message.clone(),
        timestamp_ms: None,
    })
}
