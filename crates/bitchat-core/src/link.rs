//! The transport boundary the protocol core consumes (§6)
//!
//! The core never talks to a radio directly. Anything that can deliver and
//! accept framed byte blobs and tell the core when a peer comes up or down
//! implements [`Link`]; BLE, Nostr, or an in-memory loopback for tests are
//! all equally valid behind this trait.

use alloc::vec::Vec;

use crate::errors::BitchatError;
use crate::types::PeerId;

/// A peer coming up or going down at the transport layer. The peer-id is
/// often unknown until the core learns it from the first announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    PeerUp(Option<PeerId>),
    PeerDown(Option<PeerId>),
}

#[async_trait::async_trait]
pub trait Link: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), BitchatError>;

    async fn recv(&self) -> Result<Vec<u8>, BitchatError>;

    async fn next_event(&self) -> Option<LinkEvent>;
}
