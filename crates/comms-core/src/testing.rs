//! Fakes shared by the unit tests of this crate.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    connection::{BackendSink, Connection, ConnectionInit, ConnectionTransport, notice_queue},
    contact::ContactGroup,
    error::CommError,
    provider::{ConnectionProvider, ConnectionTracker},
    service::LifecycleNotifier,
    types::{BackendKind, Capabilities, ConnectionState, Credentials, ProviderState, SessionTarget},
};

/// Transport that records every call as one line of text.
pub(crate) struct RecordingTransport {
    calls: Mutex<Vec<String>>,
    capabilities: Capabilities,
    rejected_channels: Vec<String>,
    presence_options: Vec<String>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            capabilities: Self::full_capabilities(),
            rejected_channels: Vec::new(),
            presence_options: Vec::new(),
        }
    }
}

impl RecordingTransport {
    pub(crate) fn full_capabilities() -> Capabilities {
        Capabilities {
            private_chat: true,
            public_chat: true,
            friend_requests: true,
            rejection_delivery: true,
            presence: true,
        }
    }

    pub(crate) fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub(crate) fn rejecting_channels(mut self, channels: &[&str]) -> Self {
        self.rejected_channels = channels.iter().map(|c| (*c).to_owned()).collect();
        self
    }

    pub(crate) fn with_presence_options(mut self, options: &[&str]) -> Self {
        self.presence_options = options.iter().map(|o| (*o).to_owned()).collect();
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

impl ConnectionTransport for RecordingTransport {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn open_chat_session(&self, target: &SessionTarget) -> Result<(), CommError> {
        if let SessionTarget::Public(channel) = target
            && self.rejected_channels.contains(channel)
        {
            return Err(CommError::InvalidChannel(channel.clone()));
        }
        self.record(format!("open {target}"));
        Ok(())
    }

    fn send_chat_message(&self, target: &SessionTarget, text: &str) {
        self.record(format!("send {target} {text}"));
    }

    fn close_chat_session(&self, target: &SessionTarget) {
        self.record(format!("close {target}"));
    }

    fn send_friend_request(&self, to: &str, message: &str) {
        self.record(format!("friend {to} {message}"));
    }

    fn answer_friend_request(&self, from: &str, accept: bool) {
        let answer = if accept { "accept" } else { "reject" };
        self.record(format!("answer {from} {answer}"));
    }

    fn remove_contact(&self, contact_id: &str) {
        self.record(format!("remove {contact_id}"));
    }

    fn set_presence(&self, status: &str, message: &str) {
        self.record(format!("presence {status} {message}"));
    }

    fn presence_status_options(&self) -> Vec<String> {
        self.presence_options.clone()
    }

    fn disconnect(&self) {
        self.record("disconnect".to_owned());
    }
}

fn test_credentials() -> Credentials {
    Credentials::new("jabber", "a@x", "secret", "x", 5222)
}

/// Spawn a connection whose backend side is driven by the returned sink.
pub(crate) fn spawn_connection(transport: Arc<RecordingTransport>) -> (Connection, BackendSink) {
    let (sink, notices) = notice_queue();
    let connection = Connection::spawn(
        ConnectionInit::new(BackendKind::Other, test_credentials()),
        transport,
        notices,
        None,
    );
    (connection, sink)
}

/// Spawn a connection and wait until it is open with `roster`.
pub(crate) async fn open_connection(
    transport: Arc<RecordingTransport>,
    roster: ContactGroup,
) -> (Connection, BackendSink) {
    let (connection, sink) = spawn_connection(transport);
    assert!(sink.opened(roster));
    wait_until(|| connection.state() == ConnectionState::Open).await;
    (connection, sink)
}

/// Poll `check` until it holds, failing the test after two seconds.
pub(crate) async fn wait_until<F>(check: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition should hold within two seconds");
}

/// Provider whose connections are driven by the test through their sinks.
pub(crate) struct TestProvider {
    tracker: ConnectionTracker,
    transport: Arc<RecordingTransport>,
    sinks: Mutex<Vec<BackendSink>>,
}

impl TestProvider {
    pub(crate) fn new(description: &str, protocols: &[&str]) -> Self {
        Self {
            tracker: ConnectionTracker::new(
                description,
                protocols.iter().map(|p| (*p).to_owned()).collect(),
            ),
            transport: Arc::new(RecordingTransport::default()),
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn ready(self) -> Self {
        self.tracker
            .mark_ready(Vec::new())
            .expect("test provider becomes ready once");
        self
    }

    pub(crate) fn opened(&self) -> usize {
        self.sinks.lock().expect("sinks lock").len()
    }

    pub(crate) fn last_sink(&self) -> BackendSink {
        self.sinks
            .lock()
            .expect("sinks lock")
            .last()
            .cloned()
            .expect("a connection was opened")
    }
}

impl ConnectionProvider for TestProvider {
    fn description(&self) -> String {
        self.tracker.description().to_owned()
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
        let (sink, notices) = notice_queue();
        let connection = Connection::spawn(
            ConnectionInit::new(BackendKind::Other, credentials.clone()),
            self.transport.clone(),
            notices,
            self.tracker.notifier(),
        );
        self.tracker.track(connection.clone());
        self.sinks.lock().expect("sinks lock").push(sink);
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
