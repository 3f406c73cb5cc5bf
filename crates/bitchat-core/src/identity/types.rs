//! Core identity types and enums

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::errors::{BitchatError, IdentityError};
use crate::noise::IdentityKeyPair;
use crate::types::{Fingerprint, PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Handshake State
// ----------------------------------------------------------------------------

/// Handshake state for a peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    /// No handshake initiated
    None,
    /// Handshake in progress
    InProgress,
    /// Handshake completed successfully
    Completed { fingerprint: Fingerprint },
    /// Handshake failed
    Failed { reason: String },
}

impl HandshakeState {
    /// Check if handshake is complete
    pub fn is_complete(&self) -> bool {
        matches!(self, HandshakeState::Completed { .. })
    }

    /// Get the fingerprint if handshake is complete
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match self {
            HandshakeState::Completed { fingerprint } => Some(fingerprint),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Trust Level
// ----------------------------------------------------------------------------

/// Trust level for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Unknown peer (default)
    Unknown = 0,
    /// Known but not trusted
    Known = 1,
    /// Trusted peer
    Trusted = 2,
    /// Verified peer (fingerprint confirmed out-of-band)
    Verified = 3,
}

impl Default for TrustLevel {
    fn default() -> Self {
        Self::Unknown
    }
}

// ----------------------------------------------------------------------------
// Peer Identity Binding
// ----------------------------------------------------------------------------

/// Binds an ephemeral peer-id to a long-lived static key, broadcast on
/// startup and on every peer-id rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentityBinding {
    pub current_peer_id: PeerId,
    pub fingerprint: Fingerprint,
    pub static_pub: [u8; 32],
    pub signing_pub: [u8; 32],
    pub nickname: String,
    pub binding_timestamp: Timestamp,
    pub previous_peer_id: Option<PeerId>,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl PeerIdentityBinding {
    /// `signature = Ed25519(peer_id ‖ static_pub ‖ ASCII(timestamp_ms))`
    fn signed_bytes(peer_id: PeerId, static_pub: &[u8; 32], timestamp: Timestamp) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + 32 + 20);
        bytes.extend_from_slice(peer_id.as_bytes());
        bytes.extend_from_slice(static_pub);
        bytes.extend_from_slice(alloc::format!("{}", timestamp.as_millis()).as_bytes());
        bytes
    }

    pub fn new(
        current_peer_id: PeerId,
        static_pub: [u8; 32],
        fingerprint: Fingerprint,
        signing: &IdentityKeyPair,
        nickname: String,
        binding_timestamp: Timestamp,
        previous_peer_id: Option<PeerId>,
    ) -> Self {
        let signature = signing.sign(&Self::signed_bytes(current_peer_id, &static_pub, binding_timestamp));
        Self {
            current_peer_id,
            fingerprint,
            static_pub,
            signing_pub: signing.public_key_bytes(),
            nickname,
            binding_timestamp,
            previous_peer_id,
            signature,
        }
    }

    /// Verify `signature` against `signing_pub`; used on receipt before the
    /// binding is accepted and any keyed state is remapped.
    pub fn verify(&self) -> Result<(), BitchatError> {
        let message = Self::signed_bytes(self.current_peer_id, &self.static_pub, self.binding_timestamp);
        if IdentityKeyPair::verify(&self.signing_pub, &message, &self.signature) {
            Ok(())
        } else {
            Err(IdentityError::InvalidSignature.into())
        }
    }
}

#[cfg(test)]
mod binding_tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn binding_round_trips_signature() {
        let signing = IdentityKeyPair::generate(&mut OsRng);
        let peer_id = PeerId::random(&mut OsRng);
        let binding = PeerIdentityBinding::new(
            peer_id,
            [7u8; 32],
            Fingerprint::new([1u8; 32]),
            &signing,
            "alice".into(),
            Timestamp::new(1000),
            None,
        );
        assert!(binding.verify().is_ok());
    }

    #[test]
    fn tampered_binding_fails_verification() {
        let signing = IdentityKeyPair::generate(&mut OsRng);
        let peer_id = PeerId::random(&mut OsRng);
        let mut binding = PeerIdentityBinding::new(
            peer_id,
            [7u8; 32],
            Fingerprint::new([1u8; 32]),
            &signing,
            "alice".into(),
            Timestamp::new(1000),
            None,
        );
        binding.nickname = "mallory".into();
        assert!(binding.verify().is_err());
    }
}
