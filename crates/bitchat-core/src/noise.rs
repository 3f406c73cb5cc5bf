//! Noise session layer (C3)
//!
//! Identity key material, the `Noise_XX_25519_ChaChaPoly_SHA256` handshake
//! state machine (via `snow`), and per-peer session lifecycle with the
//! rekey/expiry rules from the session config.

use alloc::vec::Vec;
use hashbrown::HashMap;
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use crate::config::SessionConfig;
use crate::errors::{BitchatError, SessionError};
use crate::types::{Fingerprint, PeerId, TimeSource, Timestamp};

pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

// ----------------------------------------------------------------------------
// Identity signing key (Ed25519)
// ----------------------------------------------------------------------------

/// Long-lived Ed25519 key used to sign identity bindings
pub struct IdentityKeyPair {
    signing: ed25519_dalek::SigningKey,
}

impl IdentityKeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self { signing: ed25519_dalek::SigningKey::generate(rng) }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self { signing: ed25519_dalek::SigningKey::from_bytes(bytes) }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        use ed25519_dalek::Signer;
        self.signing.sign(message).to_bytes()
    }

    pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
        use ed25519_dalek::Verifier;
        let Ok(verifying) = ed25519_dalek::VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        verifying.verify(message, &sig).is_ok()
    }
}

// ----------------------------------------------------------------------------
// Noise static key agreement (X25519)
// ----------------------------------------------------------------------------

/// Long-lived Curve25519 key agreement key used as the Noise static key
pub struct NoiseKeyPair {
    private: curve25519_dalek::scalar::Scalar,
    public: curve25519_dalek::montgomery::MontgomeryPoint,
}

impl NoiseKeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let private = curve25519_dalek::scalar::Scalar::from_bytes_mod_order(bytes);
        let public = private * curve25519_dalek::constants::X25519_BASEPOINT;
        Self { private, public }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.private.to_bytes()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        generate_fingerprint(&self.public_key_bytes())
    }
}

/// `lowercase_hex(SHA-256(static_pub))`, truncated to the 32-byte digest
pub fn generate_fingerprint(public_key: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    let digest: [u8; 32] = hasher.finalize().into();
    Fingerprint::new(digest)
}

/// Reject remote keys that can't possibly be a valid Curve25519 point: the
/// all-zero and all-`0xFF` sentinels. A zero DH result would also be
/// rejected here if this resolver intercepted the raw DH step; `snow`'s
/// default resolver performs that step internally, so this check covers
/// the remote static key exposed after the handshake completes.
pub fn validate_remote_public_key(bytes: &[u8]) -> Result<(), BitchatError> {
    if bytes.len() != 32 {
        return Err(SessionError::InvalidPublicKey.into());
    }
    if bytes.iter().all(|&b| b == 0x00) || bytes.iter().all(|&b| b == 0xFF) {
        return Err(SessionError::InvalidPublicKey.into());
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Handshake / transport wrappers around snow
// ----------------------------------------------------------------------------

pub struct NoiseHandshake {
    state: snow::HandshakeState,
}

impl NoiseHandshake {
    pub fn initiator(local_key: &NoiseKeyPair) -> Result<Self, BitchatError> {
        let params: snow::params::NoiseParams =
            NOISE_PATTERN.parse().expect("static pattern string is valid");
        let key_bytes = local_key.private_key_bytes();
        let state = snow::Builder::new(params)
            .local_private_key(&key_bytes)
            .build_initiator()
            .map_err(|_| SessionError::HandshakeFailed)?;
        Ok(Self { state })
    }

    pub fn responder(local_key: &NoiseKeyPair) -> Result<Self, BitchatError> {
        let params: snow::params::NoiseParams =
            NOISE_PATTERN.parse().expect("static pattern string is valid");
        let key_bytes = local_key.private_key_bytes();
        let state = snow::Builder::new(params)
            .local_private_key(&key_bytes)
            .build_responder()
            .map_err(|_| SessionError::HandshakeFailed)?;
        Ok(Self { state })
    }

    /// Write the next handshake message, optionally piggybacking `payload`.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, BitchatError> {
        let mut buf = alloc::vec![0u8; payload.len() + 256];
        let len = self.state.write_message(payload, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Consume a handshake message, returning any piggybacked payload.
    pub fn read_message(&mut self, input: &[u8]) -> Result<Vec<u8>, BitchatError> {
        let mut buf = alloc::vec![0u8; input.len()];
        let len = self.state.read_message(input, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    pub fn is_handshake_finished(&self) -> bool {
        self.state.is_handshake_finished()
    }

    pub fn get_remote_static(&self) -> Option<[u8; 32]> {
        self.state.get_remote_static().and_then(|s| s.try_into().ok())
    }

    pub fn into_transport_mode(self) -> Result<NoiseTransport, BitchatError> {
        let transport = self
            .state
            .into_transport_mode()
            .map_err(|_| SessionError::HandshakeFailed)?;
        Ok(NoiseTransport { state: transport })
    }
}

pub struct NoiseTransport {
    state: snow::TransportState,
}

impl NoiseTransport {
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, BitchatError> {
        let mut buf = alloc::vec![0u8; plaintext.len() + 16];
        let len = self
            .state
            .write_message(plaintext, &mut buf)
            .map_err(BitchatError::from)?;
        buf.truncate(len);
        Ok(buf)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, BitchatError> {
        let mut buf = alloc::vec![0u8; ciphertext.len()];
        let len = self
            .state
            .read_message(ciphertext, &mut buf)
            .map_err(|_| SessionError::DecryptionFailed)?;
        buf.truncate(len);
        Ok(buf)
    }

    pub fn send_counter(&self) -> u64 {
        self.state.sending_nonce()
    }

    pub fn recv_counter(&self) -> u64 {
        self.state.receiving_nonce()
    }
}

// ----------------------------------------------------------------------------
// Session lifecycle
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    Handshaking,
    Established,
    Expired,
    Failed,
}

/// Per-peer Noise session: handshake state machine, then transport ciphers.
pub struct NoiseSession {
    peer_id: PeerId,
    role: SessionRole,
    peer_fingerprint: Option<Fingerprint>,
    state: SessionLifecycle,
    handshake: Option<NoiseHandshake>,
    transport: Option<NoiseTransport>,
    created_at: Timestamp,
    last_activity: Timestamp,
}

impl NoiseSession {
    pub fn new_outbound<T: TimeSource>(
        peer_id: PeerId,
        local_key: &NoiseKeyPair,
        time_source: &T,
    ) -> Result<Self, BitchatError> {
        let now = time_source.now();
        Ok(Self {
            peer_id,
            role: SessionRole::Initiator,
            peer_fingerprint: None,
            state: SessionLifecycle::Handshaking,
            handshake: Some(NoiseHandshake::initiator(local_key)?),
            transport: None,
            created_at: now,
            last_activity: now,
        })
    }

    pub fn new_inbound<T: TimeSource>(
        peer_id: PeerId,
        local_key: &NoiseKeyPair,
        time_source: &T,
    ) -> Result<Self, BitchatError> {
        let now = time_source.now();
        Ok(Self {
            peer_id,
            role: SessionRole::Responder,
            peer_fingerprint: None,
            state: SessionLifecycle::Handshaking,
            handshake: Some(NoiseHandshake::responder(local_key)?),
            transport: None,
            created_at: now,
            last_activity: now,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn peer_fingerprint(&self) -> Option<&Fingerprint> {
        self.peer_fingerprint.as_ref()
    }

    pub fn lifecycle(&self) -> SessionLifecycle {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionLifecycle::Established
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn last_activity(&self) -> Timestamp {
        self.last_activity
    }

    fn finish_if_complete(&mut self) -> Result<(), BitchatError> {
        let Some(handshake) = self.handshake.as_ref() else {
            return Ok(());
        };
        if !handshake.is_handshake_finished() {
            return Ok(());
        }
        if let Some(remote_static) = handshake.get_remote_static() {
            validate_remote_public_key(&remote_static)?;
            self.peer_fingerprint = Some(generate_fingerprint(&remote_static));
        }
        let handshake = self.handshake.take().expect("checked above");
        self.transport = Some(handshake.into_transport_mode()?);
        self.state = SessionLifecycle::Established;
        Ok(())
    }

    /// Initiator step: produce the next outbound handshake message.
    pub fn create_handshake_message<T: TimeSource>(
        &mut self,
        payload: &[u8],
        time_source: &T,
    ) -> Result<Vec<u8>, BitchatError> {
        let handshake = self.handshake.as_mut().ok_or(SessionError::HandshakeFailed)?;
        let output = handshake.write_message(payload)?;
        self.finish_if_complete()?;
        self.last_activity = time_source.now();
        Ok(output)
    }

    /// Responder/initiator step: consume an inbound handshake message.
    pub fn process_handshake_message<T: TimeSource>(
        &mut self,
        input: &[u8],
        time_source: &T,
    ) -> Result<Vec<u8>, BitchatError> {
        let handshake = self.handshake.as_mut().ok_or(SessionError::HandshakeFailed)?;
        let output = handshake.read_message(input)?;
        self.finish_if_complete()?;
        self.last_activity = time_source.now();
        Ok(output)
    }

    pub fn encrypt<T: TimeSource>(&mut self, plaintext: &[u8], time_source: &T) -> Result<Vec<u8>, BitchatError> {
        if !self.is_established() {
            return Err(SessionError::HandshakeFailed.into());
        }
        let transport = self.transport.as_mut().ok_or(SessionError::HandshakeFailed)?;
        let ciphertext = transport.encrypt(plaintext)?;
        self.last_activity = time_source.now();
        Ok(ciphertext)
    }

    pub fn decrypt<T: TimeSource>(&mut self, ciphertext: &[u8], time_source: &T) -> Result<Vec<u8>, BitchatError> {
        if !self.is_established() {
            return Err(SessionError::HandshakeFailed.into());
        }
        let transport = self.transport.as_mut().ok_or(SessionError::HandshakeFailed)?;
        let plaintext = transport.decrypt(ciphertext)?;
        self.last_activity = time_source.now();
        Ok(plaintext)
    }

    pub fn send_counter(&self) -> u64 {
        self.transport.as_ref().map(|t| t.send_counter()).unwrap_or(0)
    }

    /// `send_counter >= rekey_threshold` or inactive past `inactivity_timeout`.
    pub fn needs_rekey<T: TimeSource>(&self, config: &SessionConfig, time_source: &T) -> bool {
        if self.send_counter() >= config.rekey_threshold {
            return true;
        }
        let idle = time_source.now().duration_since(self.last_activity);
        idle >= config.inactivity_timeout
    }

    /// `send_counter >= rekey_hard_limit`: the session must not be used further.
    pub fn is_expired(&self, config: &SessionConfig) -> bool {
        self.send_counter() >= config.rekey_hard_limit
    }

    pub fn mark_failed(&mut self) {
        self.state = SessionLifecycle::Failed;
        self.handshake = None;
        self.transport = None;
    }
}

/// Owns every peer's [`NoiseSession`], keyed by ephemeral peer-id.
pub struct SessionTable<T: TimeSource> {
    local_key: NoiseKeyPair,
    sessions: HashMap<PeerId, NoiseSession>,
    time_source: T,
}

impl<T: TimeSource> SessionTable<T> {
    pub fn new(local_key: NoiseKeyPair, time_source: T) -> Self {
        Self { local_key, sessions: HashMap::new(), time_source }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&NoiseSession> {
        self.sessions.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut NoiseSession> {
        self.sessions.get_mut(peer_id)
    }

    /// Start a new outbound handshake, replacing any existing session for this peer.
    pub fn start_outbound(&mut self, peer_id: PeerId) -> Result<&mut NoiseSession, BitchatError> {
        let session = NoiseSession::new_outbound(peer_id, &self.local_key, &self.time_source)?;
        self.sessions.insert(peer_id, session);
        Ok(self.sessions.get_mut(&peer_id).expect("just inserted"))
    }

    /// Auto-initialize on first unsolicited handshake init, per the session lifecycle rule.
    pub fn start_inbound(&mut self, peer_id: PeerId) -> Result<&mut NoiseSession, BitchatError> {
        let session = NoiseSession::new_inbound(peer_id, &self.local_key, &self.time_source)?;
        self.sessions.insert(peer_id, session);
        Ok(self.sessions.get_mut(&peer_id).expect("just inserted"))
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<NoiseSession> {
        self.sessions.remove(peer_id)
    }

    /// Re-key any session past its threshold: caller drives the actual
    /// handshake; this only reports which peers need one.
    pub fn sessions_needing_rekey(&self, config: &SessionConfig) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.is_established() && s.needs_rekey(config, &self.time_source))
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Remap a session from an old ephemeral peer-id to a newly rotated one,
    /// as required after a verified identity rotation announcement.
    pub fn remap_peer_id(&mut self, old: &PeerId, new: PeerId) {
        if let Some(session) = self.sessions.remove(old) {
            self.sessions.insert(new, session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SystemTimeSource;
    use rand_core::OsRng;

    fn full_handshake() -> (NoiseTransport, NoiseTransport) {
        let alice_key = NoiseKeyPair::generate(&mut OsRng);
        let bob_key = NoiseKeyPair::generate(&mut OsRng);
        let mut alice = NoiseHandshake::initiator(&alice_key).unwrap();
        let mut bob = NoiseHandshake::responder(&bob_key).unwrap();

        let m1 = alice.write_message(&[]).unwrap();
        bob.read_message(&m1).unwrap();
        let m2 = bob.write_message(&[]).unwrap();
        alice.read_message(&m2).unwrap();
        let m3 = alice.write_message(&[]).unwrap();
        bob.read_message(&m3).unwrap();

        assert!(alice.is_handshake_finished());
        assert!(bob.is_handshake_finished());
        (alice.into_transport_mode().unwrap(), bob.into_transport_mode().unwrap())
    }

    #[test]
    fn handshake_then_transport_roundtrip() {
        let (mut alice, mut bob) = full_handshake();
        let ct = alice.encrypt(b"hi").unwrap();
        let pt = bob.decrypt(&ct).unwrap();
        assert_eq!(pt, b"hi");
    }

    #[test]
    fn sequential_ciphertexts_differ() {
        let (mut alice, _bob) = full_handshake();
        let a = alice.encrypt(b"hi").unwrap();
        let b = alice.encrypt(b"hi").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn replayed_ciphertext_fails() {
        let (mut alice, mut bob) = full_handshake();
        let ct = alice.encrypt(b"hi").unwrap();
        bob.decrypt(&ct).unwrap();
        assert!(bob.decrypt(&ct).is_err());
    }

    #[test]
    fn all_zero_remote_key_rejected() {
        assert!(validate_remote_public_key(&[0u8; 32]).is_err());
        assert!(validate_remote_public_key(&[0xFFu8; 32]).is_err());
    }

    #[test]
    fn session_level_handshake_establishes() {
        let time = SystemTimeSource::new();
        let alice_key = NoiseKeyPair::generate(&mut OsRng);
        let bob_key = NoiseKeyPair::generate(&mut OsRng);
        let mut alice = NoiseSession::new_outbound(PeerId::new([1; 8]), &alice_key, &time).unwrap();
        let mut bob = NoiseSession::new_inbound(PeerId::new([2; 8]), &bob_key, &time).unwrap();

        let m1 = alice.create_handshake_message(&[], &time).unwrap();
        bob.process_handshake_message(&m1, &time).unwrap();
        let m2 = bob.create_handshake_message(&[], &time).unwrap();
        alice.process_handshake_message(&m2, &time).unwrap();
        let m3 = alice.create_handshake_message(&[], &time).unwrap();
        bob.process_handshake_message(&m3, &time).unwrap();

        assert!(alice.is_established());
        assert!(bob.is_established());
        assert!(alice.peer_fingerprint().is_some());
    }
}
