//! Secure Identity State Manager
//!
//! Central manager for the three-layer identity model: ephemeral per-session
//! state, long-lived cryptographic identity, and user-assigned social
//! metadata, persisted through whatever [`SecretStore`] the binding provides.

use alloc::{
    boxed::Box,
    collections::BTreeMap,
    string::{String, ToString},
    vec::Vec,
};

use super::{
    storage::{MemorySecretStore, SecretStore, IDENTITY_CACHE},
    CryptographicIdentity, EphemeralIdentity, HandshakeState, IdentityCache, SocialIdentity, TrustLevel,
};
use crate::errors::{BitchatError, Result};
use crate::types::{Fingerprint, PeerId, Timestamp};

/// Cache save interval to avoid excessive I/O
const CACHE_SAVE_INTERVAL_MS: u64 = 2000;

/// Maximum age for ephemeral sessions before cleanup
const MAX_EPHEMERAL_AGE_MS: u64 = 3600_000;

/// Secure identity state manager implementing the three-layer identity model
pub struct SecureIdentityStateManager {
    ephemeral_sessions: BTreeMap<PeerId, EphemeralIdentity>,
    identity_cache: IdentityCache,
    storage: Box<dyn SecretStore>,
    last_cache_save: Timestamp,
    cache_dirty: bool,
}

impl SecureIdentityStateManager {
    /// Create a new identity state manager over an in-memory store, for
    /// tests and the reference CLI binding.
    pub fn new_for_testing() -> Self {
        Self::with_storage(Box::new(MemorySecretStore::new()))
    }

    pub fn with_storage(storage: Box<dyn SecretStore>) -> Self {
        let mut manager = Self {
            ephemeral_sessions: BTreeMap::new(),
            identity_cache: IdentityCache::new(),
            storage,
            last_cache_save: Timestamp::now(),
            cache_dirty: false,
        };
        manager.load_cache();
        manager
    }

    // ----------------------------------------------------------------------------
    // Ephemeral Identity Management
    // ----------------------------------------------------------------------------

    pub fn register_ephemeral_identity(&mut self, peer_id: PeerId) -> &mut EphemeralIdentity {
        let ephemeral = EphemeralIdentity::new(peer_id);
        self.ephemeral_sessions.insert(peer_id, ephemeral);
        self.ephemeral_sessions.get_mut(&peer_id).unwrap()
    }

    pub fn get_ephemeral_identity(&self, peer_id: &PeerId) -> Option<&EphemeralIdentity> {
        self.ephemeral_sessions.get(peer_id)
    }

    pub fn get_ephemeral_identity_mut(&mut self, peer_id: &PeerId) -> Option<&mut EphemeralIdentity> {
        self.ephemeral_sessions.get_mut(peer_id)
    }

    /// Move all ephemeral and cache state keyed on `old` onto `new`; used
    /// when a verified `noiseIdentityAnnounce` reports a peer-id rotation.
    pub fn remap_peer_id(&mut self, old: &PeerId, new: PeerId) {
        if let Some(ephemeral) = self.ephemeral_sessions.remove(old) {
            self.ephemeral_sessions.insert(new, ephemeral);
        }
    }

    pub fn update_handshake_state(&mut self, peer_id: &PeerId, state: HandshakeState) -> Result<()> {
        let fingerprint = if let Some(ephemeral) = self.ephemeral_sessions.get_mut(peer_id) {
            ephemeral.set_handshake_state(state);
            ephemeral.get_fingerprint().cloned()
        } else {
            return Err(BitchatError::configuration("ephemeral identity not found"));
        };

        if let Some(fingerprint) = fingerprint {
            self.update_last_handshake(&fingerprint)?;
        }

        Ok(())
    }

    pub fn cleanup_ephemeral_sessions(&mut self) {
        let now = Timestamp::now();
        let cutoff = now.as_millis().saturating_sub(MAX_EPHEMERAL_AGE_MS);
        self.ephemeral_sessions.retain(|_, ephemeral| ephemeral.session_start.as_millis() >= cutoff);
    }

    pub fn get_active_ephemeral_sessions(&self) -> Vec<&EphemeralIdentity> {
        self.ephemeral_sessions.values().collect()
    }

    // ----------------------------------------------------------------------------
    // Cryptographic Identity Management
    // ----------------------------------------------------------------------------

    pub fn upsert_cryptographic_identity(&mut self, identity: CryptographicIdentity) -> Result<()> {
        self.identity_cache.upsert_cryptographic_identity(identity);
        self.mark_cache_dirty();
        self.save_cache_if_needed()
    }

    pub fn get_cryptographic_identity(&self, fingerprint: &Fingerprint) -> Option<&CryptographicIdentity> {
        self.identity_cache.get_cryptographic_identity(fingerprint)
    }

    pub fn update_last_handshake(&mut self, fingerprint: &Fingerprint) -> Result<()> {
        if let Some(crypto) = self.identity_cache.cryptographic_identities.get_mut(fingerprint) {
            crypto.update_handshake_time();
            self.mark_cache_dirty();
            self.save_cache_if_needed()
        } else {
            Ok(())
        }
    }

    pub fn create_cryptographic_identity(
        &mut self,
        noise_public_key: [u8; 32],
        signing_public_key: Option<[u8; 32]>,
    ) -> Result<Fingerprint> {
        let identity = CryptographicIdentity::new(noise_public_key, signing_public_key);
        let fingerprint = identity.fingerprint.clone();
        self.upsert_cryptographic_identity(identity)?;
        Ok(fingerprint)
    }

    // ----------------------------------------------------------------------------
    // Social Identity Management
    // ----------------------------------------------------------------------------

    pub fn get_or_create_social_identity(&mut self, fingerprint: &Fingerprint) -> &mut SocialIdentity {
        if !self.identity_cache.social_identities.contains_key(fingerprint) {
            let social = SocialIdentity::new(fingerprint.clone());
            self.identity_cache.upsert_social_identity(social);
            self.mark_cache_dirty();
        }
        self.identity_cache.social_identities.get_mut(fingerprint).unwrap()
    }

    pub fn get_social_identity(&self, fingerprint: &Fingerprint) -> Option<&SocialIdentity> {
        self.identity_cache.get_social_identity(fingerprint)
    }

    pub fn update_social_identity<F>(&mut self, fingerprint: &Fingerprint, update_fn: F) -> Result<()>
    where
        F: FnOnce(&mut SocialIdentity),
    {
        let social = self.get_or_create_social_identity(fingerprint);
        update_fn(social);
        self.mark_cache_dirty();
        self.save_cache_if_needed()
    }

    pub fn set_nickname(&mut self, fingerprint: &Fingerprint, nickname: Option<String>) -> Result<()> {
        self.update_social_identity(fingerprint, |social| social.set_claimed_nickname(nickname))
    }

    pub fn set_petname(&mut self, fingerprint: &Fingerprint, petname: Option<String>) -> Result<()> {
        self.update_social_identity(fingerprint, |social| social.set_petname(petname))
    }

    pub fn set_trust_level(&mut self, fingerprint: &Fingerprint, level: TrustLevel) -> Result<()> {
        self.update_social_identity(fingerprint, |social| social.set_trust_level(level))
    }

    pub fn set_verified(&mut self, fingerprint: &Fingerprint, verified: bool) -> Result<()> {
        self.identity_cache.set_verified(fingerprint, verified);
        self.mark_cache_dirty();
        self.save_cache_if_needed()
    }

    pub fn is_verified(&self, fingerprint: &Fingerprint) -> bool {
        self.identity_cache.is_verified(fingerprint)
    }

    pub fn get_verified_fingerprints(&self) -> Vec<Fingerprint> {
        self.identity_cache.get_verified_fingerprints()
    }

    pub fn set_favorite(&mut self, fingerprint: &Fingerprint, favorite: bool) -> Result<()> {
        self.update_social_identity(fingerprint, |social| social.set_favorite(favorite))
    }

    pub fn set_blocked(&mut self, fingerprint: &Fingerprint, blocked: bool) -> Result<()> {
        self.update_social_identity(fingerprint, |social| social.set_blocked(blocked))
    }

    pub fn is_blocked(&self, fingerprint: &Fingerprint) -> bool {
        self.get_social_identity(fingerprint).is_some_and(|s| s.is_blocked)
    }

    // ----------------------------------------------------------------------------
    // Search and Lookup
    // ----------------------------------------------------------------------------

    pub fn find_by_nickname(&self, nickname: &str) -> Option<&Fingerprint> {
        self.identity_cache.find_by_nickname(nickname)
    }

    pub fn get_display_name(&self, fingerprint: &Fingerprint) -> Option<String> {
        self.get_social_identity(fingerprint).and_then(|social| social.display_name().map(|s| s.to_string()))
    }

    pub fn get_all_social_identities(&self) -> Vec<&SocialIdentity> {
        self.identity_cache.social_identities.values().collect()
    }

    pub fn get_all_cryptographic_identities(&self) -> Vec<&CryptographicIdentity> {
        self.identity_cache.cryptographic_identities.values().collect()
    }

    // ----------------------------------------------------------------------------
    // Cleanup and Maintenance
    // ----------------------------------------------------------------------------

    pub fn cleanup_old_identities(&mut self, max_age_ms: u64) -> Result<()> {
        self.identity_cache.cleanup_old_identities(max_age_ms);
        self.cleanup_ephemeral_sessions();
        self.mark_cache_dirty();
        self.save_cache_if_needed()
    }

    pub fn remove_identity(&mut self, fingerprint: &Fingerprint) -> Result<()> {
        self.identity_cache.remove_identity(fingerprint);
        self.mark_cache_dirty();
        self.save_cache_if_needed()
    }

    /// Panic mode: wipe every owned secret and all in-memory identity state.
    pub fn panic_clear_all_data(&mut self) -> usize {
        self.ephemeral_sessions.clear();
        self.identity_cache = IdentityCache::new();
        self.cache_dirty = false;
        self.storage.delete_all_owned()
    }

    // ----------------------------------------------------------------------------
    // Raw secret passthrough (static keys, channel passwords)
    // ----------------------------------------------------------------------------

    /// Direct access to the underlying [`SecretStore`] for names the manager
    /// itself doesn't own, e.g. `noiseStaticKey`/`signingKey` at startup or
    /// `channelPassword:<channel>` entries maintained by the dispatcher.
    pub fn get_secret(&self, name: &str) -> Option<Vec<u8>> {
        self.storage.get(name)
    }

    pub fn put_secret(&mut self, name: &str, data: Vec<u8>) -> bool {
        self.storage.put(name, data)
    }

    pub fn delete_secret(&mut self, name: &str) -> bool {
        self.storage.delete(name)
    }

    // ----------------------------------------------------------------------------
    // Statistics
    // ----------------------------------------------------------------------------

    pub fn get_cache_stats(&self) -> super::IdentityCacheStats {
        self.identity_cache.stats()
    }

    pub fn get_ephemeral_session_count(&self) -> usize {
        self.ephemeral_sessions.len()
    }

    // ----------------------------------------------------------------------------
    // Persistence
    // ----------------------------------------------------------------------------

    fn load_cache(&mut self) {
        if let Some(bytes) = self.storage.get(IDENTITY_CACHE) {
            if let Ok(cache) = bincode::deserialize::<IdentityCache>(&bytes) {
                self.identity_cache = cache;
                return;
            }
        }
        self.identity_cache = IdentityCache::new();
    }

    fn mark_cache_dirty(&mut self) {
        self.cache_dirty = true;
    }

    fn save_cache_if_needed(&mut self) -> Result<()> {
        if !self.cache_dirty {
            return Ok(());
        }
        let now = Timestamp::now();
        if now.as_millis().saturating_sub(self.last_cache_save.as_millis()) < CACHE_SAVE_INTERVAL_MS {
            return Ok(());
        }
        self.save_cache_now()
    }

    fn save_cache_now(&mut self) -> Result<()> {
        let serialized =
            bincode::serialize(&self.identity_cache).map_err(|_| BitchatError::configuration("failed to serialize identity cache"))?;
        if !self.storage.put(IDENTITY_CACHE, serialized) {
            return Err(BitchatError::storage("identity cache write rejected"));
        }
        self.cache_dirty = false;
        self.last_cache_save = Timestamp::now();
        Ok(())
    }
}

impl Drop for SecureIdentityStateManager {
    fn drop(&mut self) {
        let _ = self.save_cache_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_state_manager() {
        let mut manager = SecureIdentityStateManager::new_for_testing();

        let peer_id = PeerId::new([1, 2, 3, 4, 5, 6, 7, 8]);
        let ephemeral = manager.register_ephemeral_identity(peer_id);
        assert_eq!(ephemeral.peer_id, peer_id);

        let noise_key = [1u8; 32];
        let signing_key = Some([2u8; 32]);
        let fingerprint = manager.create_cryptographic_identity(noise_key, signing_key).unwrap();

        let crypto = manager.get_cryptographic_identity(&fingerprint).unwrap();
        assert_eq!(crypto.public_key, noise_key);
        assert_eq!(crypto.signing_public_key, signing_key);

        manager.set_petname(&fingerprint, Some("Alice".to_string())).unwrap();
        manager.set_trust_level(&fingerprint, TrustLevel::Trusted).unwrap();

        let social = manager.get_social_identity(&fingerprint).unwrap();
        assert_eq!(social.local_petname, Some("Alice".to_string()));
        assert_eq!(social.trust_level, TrustLevel::Trusted);

        manager.set_verified(&fingerprint, true).unwrap();
        assert!(manager.is_verified(&fingerprint));

        let verified = manager.get_verified_fingerprints();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0], fingerprint);
    }

    #[test]
    fn test_handshake_integration() {
        let mut manager = SecureIdentityStateManager::new_for_testing();

        let peer_id = PeerId::new([1, 2, 3, 4, 5, 6, 7, 8]);
        manager.register_ephemeral_identity(peer_id);

        let fingerprint = Fingerprint::new([3u8; 32]);
        let handshake_state = HandshakeState::Completed { fingerprint: fingerprint.clone() };

        manager.update_handshake_state(&peer_id, handshake_state).unwrap();

        let ephemeral = manager.get_ephemeral_identity(&peer_id).unwrap();
        assert!(ephemeral.is_handshake_complete());
        assert_eq!(ephemeral.get_fingerprint(), Some(&fingerprint));
    }

    #[test]
    fn test_cleanup() {
        let mut manager = SecureIdentityStateManager::new_for_testing();

        manager.create_cryptographic_identity([1u8; 32], None).unwrap();
        manager.cleanup_old_identities(0).unwrap();

        let stats = manager.get_cache_stats();
        assert!(stats.total_cryptographic_identities <= 1);
    }

    #[test]
    fn panic_clear_wipes_persisted_cache() {
        let mut manager = SecureIdentityStateManager::new_for_testing();
        manager.create_cryptographic_identity([9u8; 32], None).unwrap();
        manager.save_cache_now().unwrap();
        manager.panic_clear_all_data();
        assert_eq!(manager.get_cache_stats().total_cryptographic_identities, 0);
    }
}
