use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use comms_core::{
    BackendKind, BackendPayload, BackendSink, Capabilities, CommError, Connection, ConnectionInit,
    ConnectionNotice, ConnectionProvider, ConnectionTracker, ConnectionTransport, ContactGroup,
    Credentials, LifecycleNotifier, Participant, ProviderState, SessionTarget, notice_queue,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    PROTOCOL,
    packets::{parse_channel, translate_chat},
    world::{ChatFromSimulator, WorldStream},
};

const DESCRIPTION: &str = "in-world chat";

/// Serves [`PROTOCOL`] on top of an attached [`WorldStream`].
///
/// The provider stays `Initializing` until a world stream is attached.
pub struct InWorldChatProvider {
    tracker: ConnectionTracker,
    world: Mutex<Option<Arc<dyn WorldStream>>>,
}

impl InWorldChatProvider {
    pub fn new() -> Self {
        Self {
            tracker: ConnectionTracker::new(DESCRIPTION, vec![PROTOCOL.to_owned()]),
            world: Mutex::new(None),
        }
    }

    /// Use `world` for every connection and become `Ready`.
    pub fn attach_world(&self, world: Arc<dyn WorldStream>) -> Result<(), CommError> {
        let sim_name = world.sim_name();
        *self.world_slot() = Some(world);
        self.tracker.mark_ready(vec![PROTOCOL.to_owned()])?;
        info!(sim = %sim_name, "world stream attached to in-world chat");
        Ok(())
    }

    fn world_slot(&self) -> MutexGuard<'_, Option<Arc<dyn WorldStream>>> {
        self.world.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InWorldChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionProvider for InWorldChatProvider {
    fn description(&self) -> String {
        DESCRIPTION.to_owned()
    }

    fn state(&self) -> ProviderState {
        self.tracker.state()
    }

    fn supported_protocols(&self) -> Vec<String> {
        self.tracker.protocols()
    }

    fn open_connection(&self, credentials: &Credentials) -> Result<Connection, CommError> {
        self.tracker.ensure_protocol(&credentials.protocol)?;
        self.tracker.ensure_ready()?;
        let world = self
            .world_slot()
            .clone()
            .ok_or_else(|| CommError::ProviderNotReady(DESCRIPTION.to_owned()))?;

        let agent_id = world.agent_id();
        let agent_name = world.agent_name();
        let local = Participant::new(
            agent_id.to_string(),
            &agent_name,
            BackendPayload::InWorld {
                avatar_id: agent_id,
            },
        );
        let init = ConnectionInit::new(BackendKind::InWorld, credentials.clone())
            .with_name(format!("{agent_name} @ {}", world.sim_name()))
            .with_local(local);

        // Subscribe before the connection opens so no early chat is missed.
        let packets = world.chat_packets();
        let (sink, notices) = notice_queue();
        let transport = Arc::new(InWorldTransport {
            world,
            sink: sink.clone(),
        });
        let connection = Connection::spawn(init, transport, notices, self.tracker.notifier());

        sink.opened(ContactGroup::new("in-world"));
        tokio::spawn(pump_chat(packets, sink, agent_id));

        self.tracker.track(connection.clone());
        Ok(connection)
    }

    fn connections(&self) -> Vec<Connection> {
        self.tracker.connections()
    }

    fn bind(&self, notifier: LifecycleNotifier) {
        self.tracker.bind(notifier);
    }

    fn shutdown(&self) {
        self.tracker.close_all();
    }
}

/// Forward simulator chat until the world or the connection goes away.
async fn pump_chat(
    mut packets: broadcast::Receiver<ChatFromSimulator>,
    sink: BackendSink,
    agent_id: Uuid,
) {
    loop {
        tokio::select! {
            _ = sink.closed() => break,
            packet = packets.recv() => match packet {
                Ok(packet) => {
                    if let Some(notice) = translate_chat(&packet, agent_id)
                        && !sink.notify(notice)
                    {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "in-world chat feed lagged; packets dropped");
                }
                Err(RecvError::Closed) => {
                    sink.failed("world stream closed");
                    break;
                }
            }
        }
    }
    debug!(agent = %agent_id, "in-world chat pump stopped");
}

struct InWorldTransport {
    world: Arc<dyn WorldStream>,
    sink: BackendSink,
}

impl ConnectionTransport for InWorldTransport {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            public_chat: true,
            ..Capabilities::default()
        }
    }

    fn open_chat_session(&self, target: &SessionTarget) -> Result<(), CommError> {
        match target {
            SessionTarget::Public(channel) => {
                parse_channel(channel)?;
                self.sink.notify(ConnectionNotice::SessionOpened {
                    target: target.clone(),
                });
                Ok(())
            }
            SessionTarget::Private(_) => Err(CommError::SessionCreation(
                "private chat is not available in-world".to_owned(),
            )),
        }
    }

    fn send_chat_message(&self, target: &SessionTarget, text: &str) {
        match parse_channel(target.id()) {
            Ok(channel) => self.world.send_chat_from_viewer(text, channel),
            Err(err) => warn!(%err, "dropping chat for unknown channel"),
        }
    }

    fn close_chat_session(&self, target: &SessionTarget) {
        debug!(session = %target, "in-world channel stays open on the simulator");
        self.sink.notify(ConnectionNotice::SessionClosed {
            target: target.clone(),
        });
    }

    fn send_friend_request(&self, to: &str, _message: &str) {
        debug!(to, "in-world chat has no friend requests");
    }

    fn answer_friend_request(&self, from: &str, _accept: bool) {
        debug!(from, "in-world chat has no friend requests");
    }

    fn remove_contact(&self, contact_id: &str) {
        debug!(contact_id, "in-world chat has no contact list");
    }

    fn set_presence(&self, status: &str, _message: &str) {
        debug!(status, "in-world chat has no presence");
    }

    fn presence_status_options(&self) -> Vec<String> {
        Vec::new()
    }

    fn disconnect(&self) {
        debug!(sim = %self.world.sim_name(), "in-world chat detached; world session left running");
    }
}
