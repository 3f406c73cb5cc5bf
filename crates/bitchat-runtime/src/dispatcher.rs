//! The mesh dispatcher: the single task that owns every piece of mutable
//! protocol state and pumps packets between the application channel and
//! the registered [`Link`]s.
//!
//! One task reads commands from the application and events/frames from
//! every registered link, and every suspension point is either
//! `Link::send`/`Link::recv` or a channel recv — nothing else blocks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use bincode;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use bitchat_core::channel_keys::{self, ChannelEpoch, ChannelEpochStore};
use bitchat_core::control::{self, ChannelMetadata, NegotiationSession, VersionAck, VersionHello};
use bitchat_core::delivery::DeliveryTracker;
use bitchat_core::errors::{BitchatError, ChannelError, Result};
use bitchat_core::fragmentation::{Fragment, FragmentHeader, MessageFragmenter, MessageReassembler, FRAGMENT_ID_SIZE};
use bitchat_core::identity::{CryptographicIdentity, PeerIdentityBinding, SecureIdentityStateManager};
use bitchat_core::link::{Link, LinkEvent};
use bitchat_core::noise::{IdentityKeyPair, NoiseKeyPair, SessionTable};
use bitchat_core::packet::{MessageType, Packet};
use bitchat_core::relay::{self, RelayDecision, RelayDedupSet, StoreAndForwardCache};
use bitchat_core::types::{Fingerprint, PeerId, SystemTimeSource, TimeSource, Timestamp, Ttl};
use bitchat_core::BitchatConfig;

use crate::events::{AppEvent, ChannelInfo, Command, InnerMessage};
use crate::logger::{LogLevel, LoggerWrapper, TaskId};

/// Wire-friendly mirror of [`Fragment`] (which doesn't itself derive serde,
/// keeping `bitchat-core` serde-free at the fragment layer).
#[derive(Serialize, Deserialize)]
struct FragmentWire {
    fragment_id: [u8; FRAGMENT_ID_SIZE],
    index: u16,
    total: u16,
    original_type: u8,
    data: Vec<u8>,
}

impl From<Fragment> for FragmentWire {
    fn from(f: Fragment) -> Self {
        Self { fragment_id: f.header.fragment_id, index: f.header.index, total: f.header.total, original_type: f.header.original_type, data: f.data }
    }
}

impl From<FragmentWire> for Fragment {
    fn from(w: FragmentWire) -> Self {
        Fragment {
            header: FragmentHeader { fragment_id: w.fragment_id, index: w.index, total: w.total, original_type: w.original_type },
            data: w.data,
        }
    }
}

/// Protocol versions this build accepts, highest-preferred first.
const SUPPORTED_PROTOCOL_VERSIONS: &[u8] = &[1];

/// Wire-friendly mirror of [`VersionHello`].
#[derive(Serialize, Deserialize)]
struct VersionHelloWire {
    supported_versions: Vec<u8>,
    preferred_version: u8,
    client_version: String,
    platform: String,
}

impl From<&VersionHelloWire> for VersionHello {
    fn from(w: &VersionHelloWire) -> Self {
        VersionHello {
            supported_versions: w.supported_versions.clone(),
            preferred_version: w.preferred_version,
            client_version: w.client_version.clone(),
            platform: w.platform.clone(),
            capabilities: None,
        }
    }
}

/// Wire-friendly mirror of [`VersionAck`].
#[derive(Serialize, Deserialize)]
struct VersionAckWire {
    agreed_version: Option<u8>,
    server_version: String,
    platform: String,
    rejected: bool,
    reason: Option<String>,
}

impl From<&VersionAckWire> for VersionAck {
    fn from(w: &VersionAckWire) -> Self {
        VersionAck {
            agreed_version: w.agreed_version,
            server_version: w.server_version.clone(),
            platform: w.platform.clone(),
            capabilities: None,
            rejected: w.rejected,
            reason: w.reason.clone(),
        }
    }
}

/// Cleartext-channel broadcast envelope: `channel` travels unencrypted so a
/// receiver without the channel's key can still tell which channel an
/// undecryptable `body` belongs to, per the broadcast message's data model.
#[derive(Serialize, Deserialize)]
struct BroadcastEnvelopeWire {
    channel: Option<String>,
    body: Vec<u8>,
}

/// Wire-friendly mirror of [`ChannelMetadata`].
#[derive(Serialize, Deserialize, Clone)]
struct ChannelMetadataWire {
    channel: String,
    creator_id: PeerId,
    creator_fingerprint: Fingerprint,
    created_at: Timestamp,
    is_password_protected: bool,
    key_commitment: Option<String>,
}

impl From<&ChannelMetadata> for ChannelMetadataWire {
    fn from(m: &ChannelMetadata) -> Self {
        Self {
            channel: m.channel.clone(),
            creator_id: m.creator_id,
            creator_fingerprint: m.creator_fingerprint.clone(),
            created_at: m.created_at,
            is_password_protected: m.is_password_protected,
            key_commitment: m.key_commitment.clone(),
        }
    }
}

impl From<ChannelMetadataWire> for ChannelMetadata {
    fn from(w: ChannelMetadataWire) -> Self {
        ChannelMetadata {
            channel: w.channel,
            creator_id: w.creator_id,
            creator_fingerprint: w.creator_fingerprint,
            created_at: w.created_at,
            is_password_protected: w.is_password_protected,
            key_commitment: w.key_commitment,
        }
    }
}

/// Wire form of a `channelKeyVerifyRequest`: a joiner publishes its derived
/// key's commitment for whoever holds the channel to check.
#[derive(Serialize, Deserialize)]
struct ChannelKeyVerifyRequestWire {
    channel: String,
    commitment: String,
}

/// Wire form of a `channelKeyVerifyResponse`.
#[derive(Serialize, Deserialize)]
struct ChannelKeyVerifyResponseWire {
    channel: String,
    verified: bool,
}

/// Wire form of a `channelPasswordUpdate`: `encrypted_password` is the new
/// password encrypted under the recipient's own Noise session, so this
/// message is built fresh per recipient rather than broadcast once.
#[derive(Serialize, Deserialize)]
struct ChannelPasswordUpdateWire {
    channel: String,
    owner_fingerprint: Fingerprint,
    encrypted_password: Vec<u8>,
    new_key_commitment: String,
}

enum LinkMessage {
    Frame(usize, Vec<u8>),
    Event(usize, LinkEvent),
}

struct PendingPrivate {
    message_id: Uuid,
    content: String,
}

pub struct Dispatcher {
    peer_id: PeerId,
    noise_key: NoiseKeyPair,
    signing_key: IdentityKeyPair,
    nickname: String,
    sessions: SessionTable<SystemTimeSource>,
    channels: ChannelEpochStore,
    dedup: RelayDedupSet,
    store_forward: StoreAndForwardCache,
    reassembler: MessageReassembler,
    delivery: DeliveryTracker<SystemTimeSource>,
    rate_limiter: bitchat_core::rate_limiter::RateLimiter<SystemTimeSource>,
    identity: SecureIdentityStateManager,
    known_peers: BTreeMap<Fingerprint, PeerId>,
    pending_private: BTreeMap<Fingerprint, Vec<PendingPrivate>>,
    joined_channels: Vec<String>,
    known_channels: BTreeMap<String, ChannelMetadata>,
    negotiations: BTreeMap<PeerId, NegotiationSession>,
    config: BitchatConfig,
    links: Vec<Arc<dyn Link>>,
    command_rx: mpsc::Receiver<Command>,
    app_event_tx: mpsc::Sender<AppEvent>,
    logger: LoggerWrapper,
    time_source: SystemTimeSource,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_id: PeerId,
        noise_key: NoiseKeyPair,
        signing_key: IdentityKeyPair,
        nickname: String,
        identity: SecureIdentityStateManager,
        config: BitchatConfig,
        links: Vec<Arc<dyn Link>>,
        command_rx: mpsc::Receiver<Command>,
        app_event_tx: mpsc::Sender<AppEvent>,
        logger: LoggerWrapper,
    ) -> Self {
        let time_source = SystemTimeSource;
        Self {
            sessions: SessionTable::new(NoiseKeyPair::from_bytes(noise_key.private_key_bytes()), time_source),
            channels: ChannelEpochStore::new(config.channel.max_epochs),
            dedup: RelayDedupSet::new(&config.relay),
            store_forward: StoreAndForwardCache::new(config.relay.clone()),
            reassembler: MessageReassembler::new(config.fragment.clone()),
            delivery: DeliveryTracker::with_config(bitchat_core::delivery::DeliveryConfig::default(), time_source),
            rate_limiter: bitchat_core::rate_limiter::RateLimiter::with_config(config.rate_limit.clone(), time_source),
            identity,
            known_peers: BTreeMap::new(),
            pending_private: BTreeMap::new(),
            joined_channels: Vec::new(),
            known_channels: BTreeMap::new(),
            negotiations: BTreeMap::new(),
            config,
            links,
            command_rx,
            app_event_tx,
            logger,
            time_source,
            peer_id,
            noise_key,
            signing_key,
            nickname,
        }
    }

    /// Drive the dispatcher until a [`Command::Shutdown`] or every channel closes.
    pub async fn run(mut self) -> Result<()> {
        self.logger.log_task_event(TaskId::Dispatcher, LogLevel::Info, "dispatcher starting");

        let (link_tx, mut link_rx) = mpsc::channel::<LinkMessage>(256);
        for (idx, link) in self.links.iter().cloned().enumerate() {
            let tx = link_tx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        frame = link.recv() => match frame {
                            Ok(bytes) => { if tx.send(LinkMessage::Frame(idx, bytes)).await.is_err() { break; } }
                            Err(_) => break,
                        },
                        event = link.next_event() => match event {
                            Some(evt) => { if tx.send(LinkMessage::Event(idx, evt)).await.is_err() { break; } }
                            None => break,
                        },
                    }
                }
            });
        }
        drop(link_tx);

        let mut rotation_sleep = Box::pin(tokio::time::sleep(random_duration(
            self.config.identity.rotation_interval_min,
            self.config.identity.rotation_interval_max,
        )));

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => {
                        if let Err(e) = self.handle_command(cmd).await {
                            self.logger.log_task_event(TaskId::Dispatcher, LogLevel::Warn, &format!("command error: {e}"));
                        }
                    }
                },
                msg = link_rx.recv() => match msg {
                    Some(LinkMessage::Frame(idx, frame)) => {
                        if let Err(e) = self.handle_frame(idx, frame).await {
                            self.logger.log_task_event(TaskId::Dispatcher, LogLevel::Warn, &format!("frame error: {e}"));
                        }
                    }
                    Some(LinkMessage::Event(idx, LinkEvent::PeerUp(peer))) => {
                        self.handle_peer_up(idx, peer).await;
                    }
                    Some(LinkMessage::Event(_idx, LinkEvent::PeerDown(peer))) => {
                        if let Some(peer_id) = peer {
                            let _ = self.app_event_tx.send(AppEvent::PeerLost { peer_id }).await;
                        }
                    }
                    None => {}
                },
                _ = &mut rotation_sleep => {
                    self.rotate_identity().await;
                    rotation_sleep = Box::pin(tokio::time::sleep(random_duration(
                        self.config.identity.rotation_interval_min,
                        self.config.identity.rotation_interval_max,
                    )));
                }
            }

            self.reassembler.evict_expired(self.time_source.now());
            self.store_forward.evict_expired(self.time_source.now());
            self.delivery.cleanup();
        }

        self.logger.log_task_event(TaskId::Dispatcher, LogLevel::Info, "dispatcher stopped");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::SendPublic { content, mentions, channel } => self.send_public(content, mentions, channel).await,
            Command::SendPrivate { peer_fingerprint, content } => self.send_private(peer_fingerprint, content).await,
            Command::SetChannelPassword { channel, password } => self.set_channel_password(channel, password).await,
            Command::RemoveChannelPassword { channel } => self.remove_channel_password(channel),
            Command::ToggleFavorite { fingerprint } => self.toggle_favorite(fingerprint),
            Command::Block { fingerprint } => self.identity.set_blocked(&fingerprint, true),
            Command::PanicWipe => {
                self.panic_wipe();
                Ok(())
            }
            Command::Shutdown => Ok(()),
        }
    }

    async fn send_public(&mut self, content: String, mentions: Vec<String>, channel: Option<String>) -> Result<()> {
        let inner = InnerMessage { channel: channel.clone(), mentions, content };
        let plaintext = bincode::serialize(&inner).map_err(|e| BitchatError::configuration(e.to_string()))?;

        let body = match &channel {
            Some(name) => {
                let epoch = self.channels.current(name).ok_or(ChannelError::KeyMissing)?;
                channel_keys::encrypt(epoch, &plaintext, &mut rand_core::OsRng)?
            }
            None => plaintext,
        };
        let envelope = BroadcastEnvelopeWire { channel: channel.clone(), body };
        let payload = bincode::serialize(&envelope).map_err(|e| BitchatError::configuration(e.to_string()))?;

        let mut packet = Packet::new(MessageType::Message, self.peer_id, payload);
        packet.ttl = Ttl::new(self.config.relay.default_ttl);
        packet.sign(|bytes| self.signing_key.sign(bytes));

        let message_id = Uuid::new_v4();
        self.delivery.track_message(message_id, PeerId::BROADCAST, inner.content.into_bytes());
        self.broadcast(packet).await
    }

    async fn send_private(&mut self, peer_fingerprint: Fingerprint, content: String) -> Result<()> {
        let Some(&peer_id) = self.known_peers.get(&peer_fingerprint) else {
            return Err(BitchatError::configuration("no known peer-id for this fingerprint yet"));
        };

        if let Some(session) = self.sessions.get_mut(&peer_id) {
            if session.is_established() {
                let inner = InnerMessage { channel: None, mentions: Vec::new(), content: content.clone() };
                let plaintext = bincode::serialize(&inner).map_err(|e| BitchatError::configuration(e.to_string()))?;
                let ciphertext = session.encrypt(&plaintext, &self.time_source)?;
                let mut packet = Packet::new(MessageType::NoiseEncrypted, self.peer_id, ciphertext).with_recipient(peer_id);
                packet.sign(|bytes| self.signing_key.sign(bytes));
                let message_id = Uuid::new_v4();
                self.delivery.track_message(message_id, peer_id, content.into_bytes());
                return self.send_to_peer(peer_id, packet).await;
            }
        }

        self.pending_private.entry(peer_fingerprint).or_default().push(PendingPrivate { message_id: Uuid::new_v4(), content });
        let session = self.sessions.start_outbound(peer_id)?;
        let msg1 = session.create_handshake_message(&[], &self.time_source)?;
        let mut packet = Packet::new(MessageType::NoiseHandshakeInit, self.peer_id, msg1).with_recipient(peer_id);
        packet.sign(|bytes| self.signing_key.sign(bytes));
        self.send_to_peer(peer_id, packet).await
    }

    /// Derive and install a channel epoch, then tell the mesh about it: a
    /// first-time password publishes a `channelKeyVerifyRequest` so whoever
    /// already holds the channel can confirm it; rotating an existing
    /// password instead pushes a `channelPasswordUpdate` to every peer we
    /// have an established session with (§4.4).
    async fn set_channel_password(&mut self, channel: String, password: String) -> Result<()> {
        channel_keys::validate_channel_name(&channel)?;
        let our_fingerprint = self.noise_key.fingerprint();
        let epoch_number = self.channels.epoch_count(&channel) as u64;
        let previous_commitment = self.channels.current(&channel).map(|e| e.commitment.clone());
        let is_rotation = previous_commitment.is_some();
        let epoch = ChannelEpoch::derive(&channel, &password, &our_fingerprint, epoch_number, previous_commitment, &self.config.channel, self.time_source.now());
        self.channels.push(epoch.clone());
        self.identity.put_secret(&bitchat_core::identity::storage::channel_password_key(&channel), password.clone().into_bytes());
        if !self.joined_channels.contains(&channel) {
            self.joined_channels.push(channel.clone());
        }

        let metadata = ChannelMetadata {
            channel: channel.clone(),
            creator_id: self.peer_id,
            creator_fingerprint: our_fingerprint.clone(),
            created_at: epoch.created_at,
            is_password_protected: true,
            key_commitment: Some(epoch.commitment.clone()),
        };
        self.known_channels.insert(channel.clone(), metadata.clone());
        if let Ok(payload) = bincode::serialize(&ChannelMetadataWire::from(&metadata)) {
            let announce = Packet::new(MessageType::ChannelMetadata, self.peer_id, payload);
            let _ = self.broadcast(announce).await;
        }

        if is_rotation {
            self.broadcast_password_update(&channel, &our_fingerprint, &password, &epoch.commitment).await;
        } else {
            self.broadcast_key_verify_request(&channel, &epoch.commitment).await;
        }
        Ok(())
    }

    async fn broadcast_key_verify_request(&mut self, channel: &str, commitment: &str) {
        let request = ChannelKeyVerifyRequestWire { channel: channel.to_string(), commitment: commitment.to_string() };
        if let Ok(payload) = bincode::serialize(&request) {
            let packet = Packet::new(MessageType::ChannelKeyVerifyRequest, self.peer_id, payload);
            let _ = self.broadcast(packet).await;
        }
    }

    /// Encrypt the new password once per established peer session and send
    /// each recipient its own copy; there is no single ciphertext that every
    /// member could share since each Noise session has its own key.
    async fn broadcast_password_update(&mut self, channel: &str, owner_fingerprint: &Fingerprint, password: &str, new_key_commitment: &str) {
        let members: Vec<PeerId> = self.known_peers.values().copied().collect();
        for peer_id in members {
            let established = self.sessions.get(&peer_id).map(|s| s.is_established()).unwrap_or(false);
            if !established {
                continue;
            }
            let Some(session) = self.sessions.get_mut(&peer_id) else { continue };
            let Ok(encrypted_password) = session.encrypt(password.as_bytes(), &self.time_source) else { continue };
            let update = ChannelPasswordUpdateWire {
                channel: channel.to_string(),
                owner_fingerprint: owner_fingerprint.clone(),
                encrypted_password,
                new_key_commitment: new_key_commitment.to_string(),
            };
            if let Ok(payload) = bincode::serialize(&update) {
                let mut packet = Packet::new(MessageType::ChannelPasswordUpdate, self.peer_id, payload).with_recipient(peer_id);
                packet.sign(|bytes| self.signing_key.sign(bytes));
                let _ = self.send_to_peer(peer_id, packet).await;
            }
        }
    }

    fn remove_channel_password(&mut self, channel: String) -> Result<()> {
        self.channels.remove_channel(&channel);
        self.identity.delete_secret(&bitchat_core::identity::storage::channel_password_key(&channel));
        self.joined_channels.retain(|c| c != &channel);
        Ok(())
    }

    fn toggle_favorite(&mut self, fingerprint: Fingerprint) -> Result<()> {
        let currently_favorite = self.identity.get_social_identity(&fingerprint).map(|s| s.is_favorite).unwrap_or(false);
        self.identity.set_favorite(&fingerprint, !currently_favorite)?;
        self.store_forward.set_favorite(fingerprint, !currently_favorite);
        Ok(())
    }

    fn panic_wipe(&mut self) {
        self.identity.panic_clear_all_data();
        self.sessions = SessionTable::new(NoiseKeyPair::from_bytes(self.noise_key.private_key_bytes()), self.time_source);
        self.channels = ChannelEpochStore::new(self.config.channel.max_epochs);
        self.dedup = RelayDedupSet::new(&self.config.relay);
        self.store_forward = StoreAndForwardCache::new(self.config.relay.clone());
        self.known_peers.clear();
        self.pending_private.clear();
        self.joined_channels.clear();
        self.known_channels.clear();
        self.negotiations.clear();
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    async fn handle_peer_up(&mut self, _link_idx: usize, peer: Option<PeerId>) {
        if let Some(peer_id) = peer {
            if let Some(frames) = self.store_forward_flush(peer_id) {
                for frame in frames {
                    let _ = self.send_frame_on_all(frame).await;
                }
            }
            let _ = self.app_event_tx.send(AppEvent::PeerDiscovered { peer_id, fingerprint: None, nickname: None }).await;
        }
        let announce = Packet::new(MessageType::Announce, self.peer_id, self.nickname.clone().into_bytes());
        let _ = self.broadcast(announce).await;

        let mut session = NegotiationSession::new();
        session.send_hello(self.time_source.now());
        if let Some(peer_id) = peer {
            self.negotiations.insert(peer_id, session);
        }
        let hello = VersionHelloWire {
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS.to_vec(),
            preferred_version: SUPPORTED_PROTOCOL_VERSIONS[0],
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
        };
        if let Ok(payload) = bincode::serialize(&hello) {
            let packet = Packet::new(MessageType::VersionHello, self.peer_id, payload);
            let _ = self.broadcast(packet).await;
        }
    }

    fn store_forward_flush(&mut self, peer_id: PeerId) -> Option<Vec<Vec<u8>>> {
        let fingerprint = self.known_peers.iter().find(|(_, &id)| id == peer_id).map(|(fp, _)| fp.clone())?;
        let frames = self.store_forward.flush(&fingerprint);
        if frames.is_empty() { None } else { Some(frames) }
    }

    async fn handle_frame(&mut self, link_idx: usize, frame: Vec<u8>) -> Result<()> {
        let packet = Packet::decode(&frame)?;
        if packet.msg_type.is_fragment() {
            return self.handle_fragment(link_idx, packet).await;
        }
        self.handle_packet(link_idx, packet).await
    }

    async fn handle_fragment(&mut self, link_idx: usize, packet: Packet) -> Result<()> {
        let wire: FragmentWire = bincode::deserialize(&packet.payload).map_err(|e| BitchatError::configuration(e.to_string()))?;
        let fragment: Fragment = wire.into();
        if let Some((_original_type, reassembled)) = self.reassembler.process(fragment, self.time_source.now())? {
            let inner = Packet::decode(&reassembled)?;
            self.handle_packet(link_idx, inner).await?;
        }
        Ok(())
    }

    async fn handle_packet(&mut self, link_idx: usize, packet: Packet) -> Result<()> {
        let key = relay::dedup_key(packet.msg_type, packet.sender_id, &packet.payload);
        if self.dedup.check_and_insert(key, self.time_source.now()) {
            return Ok(());
        }

        let addressed_to_us = packet.recipient_id.map(|r| r == self.peer_id || r.is_broadcast()).unwrap_or(true);
        let decision = relay::relay_decision(packet.recipient_id, self.peer_id, packet.ttl);

        if addressed_to_us {
            self.process_locally(packet.clone()).await?;
        }
        if let RelayDecision::Forward(next_ttl) = decision {
            let mut forwarded = packet;
            forwarded.ttl = next_ttl;
            self.forward_except(link_idx, forwarded).await?;
        }
        Ok(())
    }

    async fn process_locally(&mut self, packet: Packet) -> Result<()> {
        match packet.msg_type {
            MessageType::Announce => {
                let nickname = String::from_utf8(packet.payload).ok();
                let fingerprint = self.known_peers.iter().find(|(_, &id)| id == packet.sender_id).map(|(fp, _)| fp.clone());
                let _ = self.app_event_tx.send(AppEvent::PeerDiscovered { peer_id: packet.sender_id, fingerprint, nickname }).await;
            }
            MessageType::Leave => {
                let _ = self.app_event_tx.send(AppEvent::PeerLost { peer_id: packet.sender_id }).await;
            }
            MessageType::Message => {
                self.rate_limiter.check_message_allowed(&packet.sender_id)?;
                self.rate_limiter.record_message(&packet.sender_id);
                let (channel, result) = self.decode_broadcast_payload(&packet.payload);
                match result {
                    Ok(inner) => self.emit_message(packet.sender_id, inner).await,
                    Err(BitchatError::Channel(ChannelError::KeyMissing | ChannelError::DecryptionFailed)) => {
                        self.emit_locked_channel_placeholder(packet.sender_id, channel).await;
                    }
                    Err(e) => return Err(e),
                }
            }
            MessageType::NoiseHandshakeInit | MessageType::NoiseHandshakeResp => {
                self.pump_handshake(packet).await?;
            }
            MessageType::NoiseEncrypted => {
                self.rate_limiter.check_message_allowed(&packet.sender_id)?;
                self.rate_limiter.record_message(&packet.sender_id);
                self.decrypt_private(packet).await?;
            }
            MessageType::NoiseIdentityAnnounce => {
                self.process_identity_announce(packet).await?;
            }
            MessageType::DeliveryAck => {
                if let Ok(id) = bincode::deserialize::<Uuid>(&packet.payload) {
                    if self.delivery.confirm_delivery(&id, packet.sender_id) {
                        if let Some(tracked) = self.delivery.get_tracked(&id) {
                            let _ = self.app_event_tx.send(AppEvent::DeliveryUpdate { message_id: id, status: tracked.status.clone() }).await;
                        }
                    }
                }
            }
            MessageType::ReadReceipt => {
                if let Ok(id) = bincode::deserialize::<Uuid>(&packet.payload) {
                    if self.delivery.confirm_read(&id, packet.sender_id) {
                        if let Some(tracked) = self.delivery.get_tracked(&id) {
                            let _ = self.app_event_tx.send(AppEvent::DeliveryUpdate { message_id: id, status: tracked.status.clone() }).await;
                        }
                    }
                }
            }
            MessageType::ChannelMetadata => {
                if let Ok(wire) = bincode::deserialize::<ChannelMetadataWire>(&packet.payload) {
                    let metadata: ChannelMetadata = wire.into();
                    self.known_channels.insert(metadata.channel.clone(), metadata.clone());
                    let _ = self.app_event_tx.send(AppEvent::ChannelMetadata(ChannelInfo {
                        channel: metadata.channel,
                        creator_fingerprint: metadata.creator_fingerprint,
                        is_password_protected: metadata.is_password_protected,
                    })).await;
                }
            }
            MessageType::VersionHello => {
                if let Ok(wire) = bincode::deserialize::<VersionHelloWire>(&packet.payload) {
                    let hello: VersionHello = (&wire).into();
                    let agreed = control::negotiate(&hello.supported_versions, SUPPORTED_PROTOCOL_VERSIONS);
                    let ack = VersionAckWire {
                        agreed_version: agreed,
                        server_version: env!("CARGO_PKG_VERSION").to_string(),
                        platform: std::env::consts::OS.to_string(),
                        rejected: agreed.is_none(),
                        reason: if agreed.is_none() { Some("no overlapping protocol version".to_string()) } else { None },
                    };
                    if let Ok(payload) = bincode::serialize(&ack) {
                        let reply = Packet::new(MessageType::VersionAck, self.peer_id, payload);
                        let _ = self.send_to_peer(packet.sender_id, reply).await;
                    }
                }
            }
            MessageType::VersionAck => {
                if let Ok(wire) = bincode::deserialize::<VersionAckWire>(&packet.payload) {
                    let ack: VersionAck = (&wire).into();
                    self.negotiations.entry(packet.sender_id).or_insert_with(NegotiationSession::new).receive_ack(&ack);
                }
            }
            MessageType::ChannelKeyVerifyRequest => {
                if let Ok(request) = bincode::deserialize::<ChannelKeyVerifyRequestWire>(&packet.payload) {
                    if let Some(epoch) = self.channels.current(&request.channel) {
                        let verified = channel_keys::verify_commitment(epoch, &request.commitment);
                        let response = ChannelKeyVerifyResponseWire { channel: request.channel, verified };
                        if let Ok(payload) = bincode::serialize(&response) {
                            let mut reply = Packet::new(MessageType::ChannelKeyVerifyResponse, self.peer_id, payload).with_recipient(packet.sender_id);
                            reply.sign(|bytes| self.signing_key.sign(bytes));
                            let _ = self.send_to_peer(packet.sender_id, reply).await;
                        }
                    }
                }
            }
            MessageType::ChannelKeyVerifyResponse => {
                if let Ok(response) = bincode::deserialize::<ChannelKeyVerifyResponseWire>(&packet.payload) {
                    if response.verified {
                        if let Some(meta) = self.known_channels.get_mut(&response.channel) {
                            meta.is_password_protected = true;
                        }
                    } else {
                        self.logger.log_task_event(TaskId::Dispatcher, LogLevel::Warn, &format!("channel key commitment mismatch for {}", response.channel));
                        self.remove_channel_password(response.channel)?;
                    }
                }
            }
            MessageType::ChannelPasswordUpdate => {
                if let Ok(update) = bincode::deserialize::<ChannelPasswordUpdateWire>(&packet.payload) {
                    self.apply_channel_password_update(packet.sender_id, update).await?;
                }
            }
            MessageType::ChannelAnnounce | MessageType::ChannelRetention | MessageType::DeliveryStatusRequest => {
                self.logger.log_task_event(TaskId::Dispatcher, LogLevel::Debug, "message type not yet wired into the dispatcher");
            }
            MessageType::FragmentStart | MessageType::FragmentContinue | MessageType::FragmentEnd => unreachable!("handled before dedup"),
        }
        Ok(())
    }

    /// Returns the cleartext channel name (if any) alongside the decode
    /// result, so a decryption failure still tells the caller which channel
    /// the message was for.
    fn decode_broadcast_payload(&self, payload: &[u8]) -> (Option<String>, Result<InnerMessage>) {
        let envelope = match bincode::deserialize::<BroadcastEnvelopeWire>(payload) {
            Ok(envelope) => envelope,
            Err(e) => return (None, Err(BitchatError::configuration(e.to_string()))),
        };
        let Some(channel) = envelope.channel.clone() else {
            let inner = bincode::deserialize::<InnerMessage>(&envelope.body).map_err(|e| BitchatError::configuration(e.to_string()));
            return (None, inner);
        };

        if self.channels.current(&channel).is_none() {
            return (Some(channel), Err(ChannelError::KeyMissing.into()));
        }
        let window = self.channels.decryption_window(&channel);
        let result = channel_keys::decrypt(window, &envelope.body)
            .and_then(|plaintext| bincode::deserialize::<InnerMessage>(&plaintext).map_err(|e| BitchatError::configuration(e.to_string())));
        (Some(channel), result)
    }

    /// Surface an otherwise-undecryptable channel message as a placeholder
    /// and record the channel as password-protected if it wasn't already.
    async fn emit_locked_channel_placeholder(&mut self, sender: PeerId, channel: Option<String>) {
        let Some(channel) = channel else { return };
        self.mark_channel_password_protected(&channel, sender);
        let fingerprint = self.known_peers.iter().find(|(_, &id)| id == sender).map(|(fp, _)| fp.clone());
        let _ = self.app_event_tx.send(AppEvent::Message {
            message_id: Uuid::new_v4(),
            from: sender,
            fingerprint,
            channel: Some(channel),
            content: "<encrypted message: channel password required>".to_string(),
        }).await;
    }

    fn mark_channel_password_protected(&mut self, channel: &str, reporter: PeerId) {
        if let Some(meta) = self.known_channels.get_mut(channel) {
            meta.is_password_protected = true;
            return;
        }
        let creator_fingerprint = self.known_peers.iter().find(|(_, &id)| id == reporter).map(|(fp, _)| fp.clone()).unwrap_or_else(|| Fingerprint::new([0u8; 32]));
        self.known_channels.insert(channel.to_string(), ChannelMetadata {
            channel: channel.to_string(),
            creator_id: reporter,
            creator_fingerprint,
            created_at: self.time_source.now(),
            is_password_protected: true,
            key_commitment: None,
        });
    }

    /// Verify and apply a `channelPasswordUpdate` pushed by a channel's
    /// owner: the new password arrives Noise-encrypted for us specifically,
    /// and is only trusted if re-deriving the epoch from it reproduces the
    /// advertised commitment.
    async fn apply_channel_password_update(&mut self, sender: PeerId, update: ChannelPasswordUpdateWire) -> Result<()> {
        let established = self.sessions.get(&sender).map(|s| s.is_established()).unwrap_or(false);
        if !established {
            return Ok(());
        }
        let Some(session) = self.sessions.get_mut(&sender) else { return Ok(()) };
        let password_bytes = session.decrypt(&update.encrypted_password, &self.time_source)?;
        let password = String::from_utf8(password_bytes).map_err(|e| BitchatError::configuration(e.to_string()))?;

        let epoch_number = self.channels.epoch_count(&update.channel) as u64;
        let previous_commitment = self.channels.current(&update.channel).map(|e| e.commitment.clone());
        let epoch = ChannelEpoch::derive(&update.channel, &password, &update.owner_fingerprint, epoch_number, previous_commitment, &self.config.channel, self.time_source.now());
        if !channel_keys::verify_commitment(&epoch, &update.new_key_commitment) {
            self.logger.log_task_event(TaskId::Dispatcher, LogLevel::Warn, "channel password update commitment mismatch, dropping");
            return Ok(());
        }

        self.channels.push(epoch.clone());
        self.identity.put_secret(&bitchat_core::identity::storage::channel_password_key(&update.channel), password.into_bytes());
        if !self.joined_channels.contains(&update.channel) {
            self.joined_channels.push(update.channel.clone());
        }
        match self.known_channels.get_mut(&update.channel) {
            Some(meta) => {
                meta.key_commitment = Some(epoch.commitment);
                meta.is_password_protected = true;
            }
            None => {
                self.known_channels.insert(update.channel.clone(), ChannelMetadata {
                    channel: update.channel,
                    creator_id: sender,
                    creator_fingerprint: update.owner_fingerprint,
                    created_at: epoch.created_at,
                    is_password_protected: true,
                    key_commitment: Some(epoch.commitment),
                });
            }
        }
        Ok(())
    }

    async fn emit_message(&mut self, sender: PeerId, inner: InnerMessage) {
        let fingerprint = self.known_peers.iter().find(|(_, &id)| id == sender).map(|(fp, _)| fp.clone());
        let _ = self.app_event_tx.send(AppEvent::Message {
            message_id: Uuid::new_v4(),
            from: sender,
            fingerprint,
            channel: inner.channel,
            content: inner.content,
        }).await;
    }

    async fn pump_handshake(&mut self, packet: Packet) -> Result<()> {
        let peer_id = packet.sender_id;
        self.rate_limiter.check_handshake_allowed(&peer_id)?;
        self.rate_limiter.record_handshake(&peer_id);

        if self.sessions.get(&peer_id).is_none() {
            self.sessions.start_inbound(peer_id)?;
        }
        let session = self.sessions.get_mut(&peer_id).expect("just ensured present");
        let _ = session.process_handshake_message(&packet.payload, &self.time_source)?;

        if session.is_established() {
            self.on_session_established(peer_id).await?;
            return Ok(());
        }

        let next = session.create_handshake_message(&[], &self.time_source)?;
        let mut response = Packet::new(MessageType::NoiseHandshakeResp, self.peer_id, next).with_recipient(peer_id);
        response.sign(|bytes| self.signing_key.sign(bytes));
        let established_now = self.sessions.get(&peer_id).map(|s| s.is_established()).unwrap_or(false);
        self.send_to_peer(peer_id, response).await?;
        if established_now {
            self.on_session_established(peer_id).await?;
        }
        Ok(())
    }

    async fn on_session_established(&mut self, peer_id: PeerId) -> Result<()> {
        let binding = self.build_identity_binding(peer_id, None);
        let payload = bincode::serialize(&binding).map_err(|e| BitchatError::configuration(e.to_string()))?;
        let announce = Packet::new(MessageType::NoiseIdentityAnnounce, self.peer_id, payload).with_recipient(peer_id);
        self.send_to_peer(peer_id, announce).await?;

        if let Some(fingerprint) = self.sessions.get(&peer_id).and_then(|s| s.peer_fingerprint()).cloned() {
            if let Some(pending) = self.pending_private.remove(&fingerprint) {
                for item in pending {
                    self.send_private_established(peer_id, item).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_private_established(&mut self, peer_id: PeerId, item: PendingPrivate) -> Result<()> {
        let inner = InnerMessage { channel: None, mentions: Vec::new(), content: item.content.clone() };
        let plaintext = bincode::serialize(&inner).map_err(|e| BitchatError::configuration(e.to_string()))?;
        let session = self.sessions.get_mut(&peer_id).ok_or(bitchat_core::errors::SessionError::NotFound(peer_id))?;
        let ciphertext = session.encrypt(&plaintext, &self.time_source)?;
        let mut packet = Packet::new(MessageType::NoiseEncrypted, self.peer_id, ciphertext).with_recipient(peer_id);
        packet.sign(|bytes| self.signing_key.sign(bytes));
        self.delivery.track_message(item.message_id, peer_id, item.content.into_bytes());
        self.send_to_peer(peer_id, packet).await
    }

    async fn decrypt_private(&mut self, packet: Packet) -> Result<()> {
        let peer_id = packet.sender_id;
        let session = self.sessions.get_mut(&peer_id).ok_or(bitchat_core::errors::SessionError::NotFound(peer_id))?;
        let plaintext = session.decrypt(&packet.payload, &self.time_source)?;
        let inner: InnerMessage = bincode::deserialize(&plaintext).map_err(|e| BitchatError::configuration(e.to_string()))?;
        self.emit_message(peer_id, inner).await;
        Ok(())
    }

    async fn process_identity_announce(&mut self, packet: Packet) -> Result<()> {
        let binding: PeerIdentityBinding = bincode::deserialize(&packet.payload).map_err(|e| BitchatError::configuration(e.to_string()))?;
        binding.verify()?;

        if let Some(previous) = binding.previous_peer_id {
            self.sessions.remap_peer_id(&previous, binding.current_peer_id);
            self.identity.remap_peer_id(&previous, binding.current_peer_id);
        }
        self.known_peers.insert(binding.fingerprint.clone(), binding.current_peer_id);
        self.identity.upsert_cryptographic_identity(CryptographicIdentity::new(binding.static_pub, Some(binding.signing_pub)))?;
        self.identity.get_or_create_social_identity(&binding.fingerprint).set_claimed_nickname(Some(binding.nickname.clone()));

        let _ = self.app_event_tx.send(AppEvent::PeerDiscovered {
            peer_id: binding.current_peer_id,
            fingerprint: Some(binding.fingerprint),
            nickname: Some(binding.nickname),
        }).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Identity rotation
    // ------------------------------------------------------------------

    async fn rotate_identity(&mut self) {
        let old = self.peer_id;
        let new_id = PeerId::random(&mut rand_core::OsRng);
        self.identity.remap_peer_id(&old, new_id);
        self.sessions.remap_peer_id(&old, new_id);
        if let Some(negotiation) = self.negotiations.remove(&old) {
            self.negotiations.insert(new_id, negotiation);
        }
        self.peer_id = new_id;

        let binding = self.build_identity_binding(PeerId::BROADCAST, Some(old));
        if let Ok(payload) = bincode::serialize(&binding) {
            let packet = Packet::new(MessageType::NoiseIdentityAnnounce, self.peer_id, payload);
            let _ = self.broadcast(packet).await;
        }
    }

    fn build_identity_binding(&self, _recipient: PeerId, previous_peer_id: Option<PeerId>) -> PeerIdentityBinding {
        PeerIdentityBinding::new(
            self.peer_id,
            self.noise_key.public_key_bytes(),
            self.noise_key.fingerprint(),
            &self.signing_key,
            self.nickname.clone(),
            self.time_source.now(),
            previous_peer_id,
        )
    }

    // ------------------------------------------------------------------
    // Outbound framing helpers
    // ------------------------------------------------------------------

    async fn broadcast(&mut self, packet: Packet) -> Result<()> {
        self.send_frame_on_all(self.frame(&packet)).await
    }

    async fn send_to_peer(&mut self, _peer_id: PeerId, packet: Packet) -> Result<()> {
        // Mesh links don't address individual peers; every link carries
        // every frame and the recipient field lets remote nodes ignore it.
        self.send_frame_on_all(self.frame(&packet)).await
    }

    async fn forward_except(&mut self, origin_link: usize, packet: Packet) -> Result<()> {
        let frame = self.frame(&packet);
        for (idx, link) in self.links.iter().enumerate() {
            if idx == origin_link {
                continue;
            }
            let _ = link.send(frame.clone()).await;
        }
        Ok(())
    }

    fn frame(&self, packet: &Packet) -> Vec<u8> {
        packet.encode(&mut rand_core::OsRng)
    }

    async fn send_frame_on_all(&mut self, frame: Vec<u8>) -> Result<()> {
        if frame.len() > self.config.fragment.mtu {
            let fragments = MessageFragmenter::fragment(&frame, 0, &self.config.fragment, &mut rand_core::OsRng);
            for fragment in fragments {
                let wire_type = fragment.wire_type();
                let wire: FragmentWire = fragment.into();
                let payload = bincode::serialize(&wire).map_err(|e| BitchatError::configuration(e.to_string()))?;
                let packet = Packet::new(wire_type, self.peer_id, payload);
                let inner_frame = self.frame(&packet);
                for link in &self.links {
                    let _ = link.send(inner_frame.clone()).await;
                }
            }
            return Ok(());
        }
        for link in &self.links {
            let _ = link.send(frame.clone()).await;
        }
        Ok(())
    }
}

fn random_duration(min: StdDuration, max: StdDuration) -> StdDuration {
    let span = max.as_millis().saturating_sub(min.as_millis()).max(1) as u64;
    let mut buf = [0u8; 8];
    rand_core::OsRng.fill_bytes(&mut buf);
    let offset = u64::from_le_bytes(buf) % span;
    min + StdDuration::from_millis(offset)
}
