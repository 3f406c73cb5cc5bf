//! End-to-end dispatcher tests over an in-memory loopback link.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use bitchat_core::errors::BitchatError;
use bitchat_core::identity::storage::MemorySecretStore;
use bitchat_core::identity::SecureIdentityStateManager;
use bitchat_core::link::{Link, LinkEvent};
use bitchat_core::noise::{IdentityKeyPair, NoiseKeyPair};
use bitchat_core::types::PeerId;
use bitchat_core::BitchatConfig;
use bitchat_runtime::{AppEvent, RuntimeBuilder};
use rand_core::OsRng;

/// One end of an in-memory point-to-point link; fires a single `PeerUp`
/// event the first time `next_event` is polled, mirroring a transport that
/// is connected from the moment it's constructed.
struct LoopbackLink {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    announced: Mutex<bool>,
}

#[async_trait::async_trait]
impl Link for LoopbackLink {
    async fn send(&self, frame: Vec<u8>) -> Result<(), BitchatError> {
        self.tx.send(frame).await.map_err(|_| BitchatError::configuration("loopback peer gone"))
    }

    async fn recv(&self) -> Result<Vec<u8>, BitchatError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| BitchatError::configuration("loopback peer gone"))
    }

    async fn next_event(&self) -> Option<LinkEvent> {
        let mut announced = self.announced.lock().await;
        if *announced {
            std::future::pending::<()>().await;
            unreachable!()
        }
        *announced = true;
        Some(LinkEvent::PeerUp(None))
    }
}

fn loopback_pair() -> (Arc<dyn Link>, Arc<dyn Link>) {
    let (a_to_b, b_from_a) = mpsc::channel(64);
    let (b_to_a, a_from_b) = mpsc::channel(64);
    let a = Arc::new(LoopbackLink { tx: a_to_b, rx: Mutex::new(a_from_b), announced: Mutex::new(false) });
    let b = Arc::new(LoopbackLink { tx: b_to_a, rx: Mutex::new(b_from_a), announced: Mutex::new(false) });
    (a, b)
}

fn node() -> (PeerId, NoiseKeyPair, IdentityKeyPair, SecureIdentityStateManager) {
    let noise_key = NoiseKeyPair::generate(&mut OsRng);
    let signing_key = IdentityKeyPair::generate(&mut OsRng);
    let peer_id = PeerId::random(&mut OsRng);
    let identity = SecureIdentityStateManager::with_storage(Box::new(MemorySecretStore::new()));
    (peer_id, noise_key, signing_key, identity)
}

#[tokio::test]
async fn public_message_reaches_the_other_node() {
    let (link_a, link_b) = loopback_pair();

    let (peer_a, noise_a, signing_a, identity_a) = node();
    let (peer_b, noise_b, signing_b, identity_b) = node();

    let handle_a = RuntimeBuilder::new(peer_a, noise_a, signing_a, "alice".into(), identity_a)
        .with_config(BitchatConfig::permissive())
        .with_link(link_a)
        .with_logging(false)
        .start();
    let mut handle_b = RuntimeBuilder::new(peer_b, noise_b, signing_b, "bob".into(), identity_b)
        .with_config(BitchatConfig::permissive())
        .with_link(link_b)
        .with_logging(false)
        .start();

    let mut events_b = handle_b.subscribe_events().unwrap();

    // Let both sides exchange their startup announce before sending.
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle_a.send_public("hello mesh".into(), Vec::new(), None).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events_b.recv().await {
                Some(AppEvent::Message { content, .. }) => return content,
                Some(_) => continue,
                None => panic!("event channel closed before message arrived"),
            }
        }
    })
    .await
    .expect("timed out waiting for message");

    assert_eq!(received, "hello mesh");

    handle_a.shutdown().await.unwrap();
    handle_b.shutdown().await.unwrap();
}

#[tokio::test]
async fn channel_password_roundtrip_does_not_error() {
    let (peer_id, noise_key, signing_key, identity) = node();
    let handle = RuntimeBuilder::new(peer_id, noise_key, signing_key, "carol".into(), identity)
        .with_config(BitchatConfig::permissive())
        .with_logging(false)
        .start();

    handle.set_channel_password("#general".into(), "hunter2".into()).await.unwrap();
    handle.remove_channel_password("#general".into()).await.unwrap();
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn panic_wipe_does_not_error_with_no_links() {
    let (peer_id, noise_key, signing_key, identity) = node();
    let handle = RuntimeBuilder::new(peer_id, noise_key, signing_key, "dave".into(), identity)
        .with_config(BitchatConfig::permissive())
        .with_logging(false)
        .start();

    handle.panic_wipe().await.unwrap();
    handle.shutdown().await.unwrap();
}
