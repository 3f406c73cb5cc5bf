//! Runtime builder API.
//!
//! Wires identity material, configuration, and a set of [`Link`]s into a
//! running [`Dispatcher`] task, handing the caller back a lightweight
//! [`RuntimeHandle`] for the Application API surface.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use bitchat_core::errors::Result;
use bitchat_core::identity::SecureIdentityStateManager;
use bitchat_core::link::Link;
use bitchat_core::noise::{IdentityKeyPair, NoiseKeyPair};
use bitchat_core::types::{Fingerprint, PeerId};
use bitchat_core::BitchatConfig;

use crate::dispatcher::Dispatcher;
use crate::events::{AppEvent, Command};
use crate::logger::{ConsoleLogger, LoggerWrapper, NoOpLogger};

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const APP_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Assembles a [`Dispatcher`] from its inputs and spawns it as a task.
pub struct RuntimeBuilder {
    peer_id: PeerId,
    noise_key: NoiseKeyPair,
    signing_key: IdentityKeyPair,
    nickname: String,
    identity: SecureIdentityStateManager,
    config: BitchatConfig,
    links: Vec<Arc<dyn Link>>,
    enable_logging: bool,
}

impl RuntimeBuilder {
    pub fn new(
        peer_id: PeerId,
        noise_key: NoiseKeyPair,
        signing_key: IdentityKeyPair,
        nickname: String,
        identity: SecureIdentityStateManager,
    ) -> Self {
        Self {
            peer_id,
            noise_key,
            signing_key,
            nickname,
            identity,
            config: BitchatConfig::default(),
            links: Vec::new(),
            enable_logging: true,
        }
    }

    pub fn with_config(mut self, config: BitchatConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_link(mut self, link: Arc<dyn Link>) -> Self {
        self.links.push(link);
        self
    }

    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.enable_logging = enabled;
        self
    }

    /// Spawn the dispatcher task and return a handle to it.
    pub fn start(self) -> RuntimeHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (app_event_tx, app_event_rx) = mpsc::channel(APP_EVENT_CHANNEL_CAPACITY);

        let logger = if self.enable_logging {
            LoggerWrapper::Console(ConsoleLogger)
        } else {
            LoggerWrapper::NoOp(NoOpLogger)
        };

        let dispatcher = Dispatcher::new(
            self.peer_id,
            self.noise_key,
            self.signing_key,
            self.nickname,
            self.identity,
            self.config,
            self.links,
            command_rx,
            app_event_tx,
            logger,
        );

        let join_handle = tokio::spawn(dispatcher.run());

        RuntimeHandle { peer_id: self.peer_id, command_tx, app_event_rx: Some(app_event_rx), join_handle }
    }
}

/// Handle to a running dispatcher task: the only thing application code
/// touches after `RuntimeBuilder::start`.
pub struct RuntimeHandle {
    peer_id: PeerId,
    command_tx: mpsc::Sender<Command>,
    app_event_rx: Option<mpsc::Receiver<AppEvent>>,
    join_handle: JoinHandle<Result<()>>,
}

impl RuntimeHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Take ownership of the event stream. Can only be called once; later
    /// calls return `None`, matching the single-consumer `subscribe_events()`
    /// contract.
    pub fn subscribe_events(&mut self) -> Option<mpsc::Receiver<AppEvent>> {
        self.app_event_rx.take()
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| bitchat_core::errors::BitchatError::configuration("dispatcher command channel closed"))
    }

    pub async fn send_public(&self, content: String, mentions: Vec<String>, channel: Option<String>) -> Result<()> {
        self.send_command(Command::SendPublic { content, mentions, channel }).await
    }

    pub async fn send_private(&self, peer_fingerprint: Fingerprint, content: String) -> Result<()> {
        self.send_command(Command::SendPrivate { peer_fingerprint, content }).await
    }

    pub async fn set_channel_password(&self, channel: String, password: String) -> Result<()> {
        self.send_command(Command::SetChannelPassword { channel, password }).await
    }

    pub async fn remove_channel_password(&self, channel: String) -> Result<()> {
        self.send_command(Command::RemoveChannelPassword { channel }).await
    }

    pub async fn toggle_favorite(&self, fingerprint: Fingerprint) -> Result<()> {
        self.send_command(Command::ToggleFavorite { fingerprint }).await
    }

    pub async fn block(&self, fingerprint: Fingerprint) -> Result<()> {
        self.send_command(Command::Block { fingerprint }).await
    }

    pub async fn panic_wipe(&self) -> Result<()> {
        self.send_command(Command::PanicWipe).await
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.send_command(Command::Shutdown).await;
        match self.join_handle.await {
            Ok(result) => result,
            Err(_) => Err(bitchat_core::errors::BitchatError::configuration("dispatcher task panicked")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitchat_core::identity::storage::MemorySecretStore;
    use rand_core::OsRng;

    fn test_identity() -> (PeerId, NoiseKeyPair, IdentityKeyPair, SecureIdentityStateManager) {
        let noise_key = NoiseKeyPair::generate(&mut OsRng);
        let signing_key = IdentityKeyPair::generate(&mut OsRng);
        let peer_id = PeerId::random(&mut OsRng);
        let identity = SecureIdentityStateManager::with_storage(Box::new(MemorySecretStore::new()));
        (peer_id, noise_key, signing_key, identity)
    }

    #[tokio::test]
    async fn builder_starts_and_shuts_down_with_no_links() {
        let (peer_id, noise_key, signing_key, identity) = test_identity();
        let handle = RuntimeBuilder::new(peer_id, noise_key, signing_key, "tester".into(), identity)
            .with_config(BitchatConfig::permissive())
            .with_logging(false)
            .start();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_events_only_yields_once() {
        let (peer_id, noise_key, signing_key, identity) = test_identity();
        let mut handle = RuntimeBuilder::new(peer_id, noise_key, signing_key, "tester".into(), identity)
            .with_config(BitchatConfig::permissive())
            .with_logging(false)
            .start();
        assert!(handle.subscribe_events().is_some());
        assert!(handle.subscribe_events().is_none());
        handle.shutdown().await.unwrap();
    }
}
