//! Application-facing command/event types for the dispatcher's channel API.
//!
//! `Command` crosses into the dispatcher from [`crate::builder::RuntimeHandle`];
//! `AppEvent` is what `subscribe_events()` hands back out.

use bitchat_core::delivery::DeliveryStatus;
use bitchat_core::types::{Fingerprint, PeerId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What the application is told about a channel's announced metadata (§4.8).
/// Mirrors `bitchat_core::control::ChannelMetadata` minus `creator_id`/
/// `key_commitment`, which are dispatcher-internal bookkeeping.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub channel: String,
    pub creator_fingerprint: Fingerprint,
    pub is_password_protected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerMessage {
    pub channel: Option<String>,
    pub mentions: Vec<String>,
    pub content: String,
}

#[derive(Debug, Clone)]
pub enum Command {
    SendPublic { content: String, mentions: Vec<String>, channel: Option<String> },
    SendPrivate { peer_fingerprint: Fingerprint, content: String },
    SetChannelPassword { channel: String, password: String },
    RemoveChannelPassword { channel: String },
    ToggleFavorite { fingerprint: Fingerprint },
    Block { fingerprint: Fingerprint },
    PanicWipe,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    Message {
        message_id: Uuid,
        from: PeerId,
        fingerprint: Option<Fingerprint>,
        channel: Option<String>,
        content: String,
    },
    PeerDiscovered { peer_id: PeerId, fingerprint: Option<Fingerprint>, nickname: Option<String> },
    PeerLost { peer_id: PeerId },
    DeliveryUpdate { message_id: Uuid, status: DeliveryStatus },
    ChannelMetadata(ChannelInfo),
}
