mod config;
mod logging;

use std::{process::ExitCode, sync::Arc, time::Duration};

use comms_core::{
    ChatSession, CommError, CommunicationService, Connection, ConnectionProvider, ConnectionState,
    ProviderState, SessionState,
};
use comms_federated::{
    FederatedConfig, FederatedImProvider, LoopbackManager, RosterEntry, Subscription,
    manager_link,
};
use comms_inworld::{ChatFromSimulator, InWorldChatProvider, LocalWorldStream};
use comms_platform::{CredentialVault, InMemorySecretStore};
use config::SmokeConfig;
use tracing::{error, info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(reason) => {
            error!(%reason, "smoke run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: SmokeConfig) -> Result<(), String> {
    let wait = Duration::from_millis(config.wait_ms);
    let service = CommunicationService::new();
    spawn_service_logger(&service);

    let world = Arc::new(LocalWorldStream::new(
        "Smoke Sim",
        Uuid::new_v4(),
        config.credentials.user_id.clone(),
    ));
    let in_world = Arc::new(InWorldChatProvider::new());
    service
        .register_connection_provider(in_world.clone())
        .map_err(describe)?;
    in_world.attach_world(world.clone()).map_err(describe)?;

    let (provider_end, manager_end) = manager_link(64, 256);
    LoopbackManager::new(manager_end)
        .with_protocols(&["jabber"])
        .with_account(
            config.credentials.user_id.clone(),
            config.credentials.password.clone(),
            vec![
                RosterEntry::new("echo@loopback", Subscription::Yes).with_alias("Echo"),
                RosterEntry::new("stranger@loopback", Subscription::Ask),
            ],
        )
        .spawn();
    let federated = FederatedImProvider::start(provider_end, FederatedConfig::default());
    service
        .register_connection_provider(Arc::new(federated.clone()))
        .map_err(describe)?;
    wait_for(wait, || federated.state() != ProviderState::Initializing).await;
    info!(protocols = ?service.supported_protocols(), "providers registered");

    let vault = CredentialVault::new(InMemorySecretStore::default());
    let key = vault.save(&config.credentials).map_err(|err| err.to_string())?;
    let credentials = vault
        .load(&key)
        .map_err(|err| err.to_string())?
        .ok_or_else(|| format!("saved credentials '{key}' vanished"))?;

    let connection = service.open_connection(&credentials).map_err(describe)?;
    wait_for(wait, || connection.state() != ConnectionState::Initializing).await;
    if connection.state() != ConnectionState::Open {
        return Err(format!(
            "connection ended in {:?}: {}",
            connection.state(),
            connection.reason().unwrap_or_default()
        ));
    }
    info!(
        connection = %connection.id(),
        contacts = connection.contacts().len(),
        requests = connection.friend_requests().len(),
        "connection open"
    );

    let session = open_session(&connection, config.channel.as_deref())?;
    wait_for(wait, || session.state() != SessionState::Initializing).await;
    if session.state() != SessionState::Open {
        return Err(format!("chat session {} did not open", session.id()));
    }

    session.send_chat_message(&config.message).map_err(describe)?;
    if session.is_public() {
        world.inject(ChatFromSimulator::said("Bob", Uuid::new_v4(), "hello back"));
    }
    wait_for(wait, || session.message_history().len() >= 2).await;

    for message in session.message_history() {
        println!(
            "[{}] {}: {}",
            message.timestamp_ms, message.originator.name, message.text
        );
    }

    service.shutdown();
    Ok(())
}

fn open_session(connection: &Connection, channel: Option<&str>) -> Result<ChatSession, String> {
    if let Some(channel) = channel {
        return connection.open_chat_session(channel).map_err(describe);
    }
    let contacts = connection.contacts();
    let Some(peer) = contacts.all_contacts().into_iter().next() else {
        return Err("no contact to chat with; set COMMS_CHANNEL".to_owned());
    };
    connection.open_private_chat_session(peer).map_err(describe)
}

fn spawn_service_logger(service: &CommunicationService) {
    let mut events = service.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "service event");
        }
    });
}

async fn wait_for<F: Fn() -> bool>(limit: Duration, done: F) {
    let polled = tokio::time::timeout(limit, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if polled.is_err() {
        warn!(?limit, "gave up waiting");
    }
}

fn describe(err: CommError) -> String {
    format!("{} ({})", err, err.code())
}
