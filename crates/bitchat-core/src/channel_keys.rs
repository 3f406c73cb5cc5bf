//! Channel (group) key derivation and epoch rotation (C4)
//!
//! Channels are named strings beginning with `#`. Membership is proved by
//! knowledge of a PBKDF2-derived symmetric key; epochs let a channel rotate
//! its key while late joiners still decrypt recent history.

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use hashbrown::HashMap;
use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use crate::config::ChannelConfig;
use crate::errors::{BitchatError, ChannelError};
use crate::types::{Fingerprint, Timestamp};

const MAX_CHANNEL_NAME_LEN: usize = 50;
const NONCE_SIZE: usize = 12;

/// Validates a channel name: `#` prefix, ≤ 50 chars, letters/digits/`_`/`-`.
pub fn validate_channel_name(name: &str) -> Result<(), BitchatError> {
    if !name.starts_with('#') || name.len() > MAX_CHANNEL_NAME_LEN {
        return Err(ChannelError::InvalidName.into());
    }
    let body = &name[1..];
    if body.is_empty() || !body.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Err(ChannelError::InvalidName.into());
    }
    Ok(())
}

/// Derive the PBKDF2-HMAC-SHA256 key for one channel epoch.
pub fn derive_epoch_key(
    password: &str,
    channel: &str,
    creator_fingerprint: &Fingerprint,
    epoch_number: u64,
    config: &ChannelConfig,
) -> [u8; 32] {
    let mut salt = Vec::with_capacity(channel.len() + 32 + 8);
    salt.extend_from_slice(channel.as_bytes());
    salt.extend_from_slice(creator_fingerprint.as_bytes());
    salt.extend_from_slice(&epoch_number.to_le_bytes());

    let mut key = [0u8; 32];
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), &salt, config.pbkdf2_iterations, &mut key)
        .expect("32-byte output is within HMAC-SHA256's output range");
    key
}

/// `SHA256(key)`, rendered as 64 lowercase hex characters.
pub fn commit(key: &[u8; 32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hex::encode(hasher.finalize())
}

/// Whether a claimed commitment matches this epoch's own key commitment.
///
/// Used on both sides of the `channelKeyVerifyRequest`/`Response` exchange:
/// a joiner's claimed commitment is checked against the verifier's current
/// epoch, and a received `channelPasswordUpdate` is checked against the
/// commitment it advertises before being trusted.
pub fn verify_commitment(epoch: &ChannelEpoch, commitment: &str) -> bool {
    epoch.commitment == commitment
}

#[derive(Debug, Clone)]
pub struct ChannelEpoch {
    pub channel: String,
    pub epoch_number: u64,
    pub key: [u8; 32],
    pub commitment: String,
    pub created_at: Timestamp,
    pub previous_commitment: Option<String>,
}

impl ChannelEpoch {
    pub fn derive(
        channel: &str,
        password: &str,
        creator_fingerprint: &Fingerprint,
        epoch_number: u64,
        previous_commitment: Option<String>,
        config: &ChannelConfig,
        now: Timestamp,
    ) -> Self {
        let key = derive_epoch_key(password, channel, creator_fingerprint, epoch_number, config);
        Self {
            channel: channel.to_string(),
            epoch_number,
            commitment: commit(&key),
            key,
            created_at: now,
            previous_commitment,
        }
    }
}

/// Encrypt `plaintext` under the channel's current epoch key, prepending a
/// fresh random nonce to the ChaCha20-Poly1305 ciphertext.
pub fn encrypt(epoch: &ChannelEpoch, plaintext: &[u8], rng: &mut (impl RngCore + CryptoRng)) -> Result<Vec<u8>, BitchatError> {
    use chacha20poly1305::aead::Aead;
    use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let cipher = ChaCha20Poly1305::new((&epoch.key).into());
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| ChannelError::DecryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Try every epoch key in `candidates` (current first) until one
/// authenticates `data`.
pub fn decrypt<'a>(candidates: impl Iterator<Item = &'a ChannelEpoch>, data: &[u8]) -> Result<Vec<u8>, BitchatError> {
    use chacha20poly1305::aead::Aead;
    use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};

    if data.len() < NONCE_SIZE {
        return Err(ChannelError::DecryptionFailed.into());
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    for epoch in candidates {
        let cipher = ChaCha20Poly1305::new((&epoch.key).into());
        if let Ok(plaintext) = cipher.decrypt(nonce, ciphertext) {
            return Ok(plaintext);
        }
    }
    Err(ChannelError::DecryptionFailed.into())
}

/// Per-channel epoch history, newest last, bounded to `max_epochs`.
pub struct ChannelEpochStore {
    epochs: HashMap<String, VecDeque<ChannelEpoch>>,
    max_epochs: usize,
}

impl ChannelEpochStore {
    pub fn new(max_epochs: usize) -> Self {
        Self { epochs: HashMap::new(), max_epochs }
    }

    /// Install a fresh epoch as the channel's current one, evicting the
    /// oldest epoch if the store is already at capacity.
    pub fn push(&mut self, epoch: ChannelEpoch) {
        let history = self.epochs.entry(epoch.channel.clone()).or_default();
        history.push_back(epoch);
        while history.len() > self.max_epochs {
            history.pop_front();
        }
    }

    /// Current (newest) epoch for a channel.
    pub fn current(&self, channel: &str) -> Option<&ChannelEpoch> {
        self.epochs.get(channel).and_then(|h| h.back())
    }

    /// All epochs for decryption, newest first.
    pub fn decryption_window(&self, channel: &str) -> impl Iterator<Item = &ChannelEpoch> {
        self.epochs.get(channel).into_iter().flat_map(|h| h.iter().rev())
    }

    pub fn epoch_count(&self, channel: &str) -> usize {
        self.epochs.get(channel).map(|h| h.len()).unwrap_or(0)
    }

    pub fn remove_channel(&mut self, channel: &str) {
        self.epochs.remove(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn fp() -> Fingerprint {
        Fingerprint::new([7u8; 32])
    }

    fn fast_config() -> ChannelConfig {
        ChannelConfig { pbkdf2_iterations: 1000, max_epochs: 7 }
    }

    #[test]
    fn same_inputs_derive_same_key() {
        let config = fast_config();
        let a = derive_epoch_key("pw", "#test", &fp(), 0, &config);
        let b = derive_epoch_key("pw", "#test", &fp(), 0, &config);
        assert_eq!(a, b);
    }

    #[test]
    fn different_epoch_or_fingerprint_changes_key() {
        let config = fast_config();
        let base = derive_epoch_key("pw", "#test", &fp(), 0, &config);
        assert_ne!(base, derive_epoch_key("pw", "#test", &fp(), 1, &config));
        assert_ne!(base, derive_epoch_key("pw", "#test", &Fingerprint::new([9u8; 32]), 0, &config));
    }

    #[test]
    fn commitment_is_64_hex_chars() {
        let key = derive_epoch_key("pw", "#test", &fp(), 0, &fast_config());
        let commitment = commit(&key);
        assert_eq!(commitment.len(), 64);
        assert!(commitment.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn commitment_verification_catches_wrong_password() {
        let config = fast_config();
        let epoch = ChannelEpoch::derive("#test", "correct", &fp(), 0, None, &config, Timestamp::new(0));
        let claimed = commit(&derive_epoch_key("correct", "#test", &fp(), 0, &config));
        assert!(verify_commitment(&epoch, &claimed));

        let wrong = commit(&derive_epoch_key("wrong", "#test", &fp(), 0, &config));
        assert!(!verify_commitment(&epoch, &wrong));
    }

    #[test]
    fn epoch_store_bounds_history_and_keeps_latest() {
        let config = fast_config();
        let mut store = ChannelEpochStore::new(config.max_epochs);
        for epoch_number in 0..10u64 {
            let epoch = ChannelEpoch::derive("#test", "pw", &fp(), epoch_number, None, &config, Timestamp::new(0));
            store.push(epoch);
        }
        assert_eq!(store.epoch_count("#test"), 7);
        assert_eq!(store.current("#test").unwrap().epoch_number, 9);
    }

    #[test]
    fn encrypt_decrypt_roundtrip_across_epoch_window() {
        let config = fast_config();
        let epoch = ChannelEpoch::derive("#test", "pw", &fp(), 0, None, &config, Timestamp::new(0));
        let ciphertext = encrypt(&epoch, b"hello channel", &mut OsRng).unwrap();
        let plaintext = decrypt(core::iter::once(&epoch), &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello channel");
    }

    #[test]
    fn channel_name_validation() {
        assert!(validate_channel_name("#general").is_ok());
        assert!(validate_channel_name("general").is_err());
        assert!(validate_channel_name("#").is_err());
        assert!(validate_channel_name(&alloc::format!("#{}", "a".repeat(60))).is_err());
    }
}
