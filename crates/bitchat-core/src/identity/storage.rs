//! `SecretStore`: the opaque byte-blob store the core consumes (§6)
//!
//! Names used by the rest of the crate: `"noiseStaticKey"`, `"signingKey"`,
//! `"messageRetentionKey"`, `"identityCache.v2"`, and
//! `"channelPassword:<channel>"`. The core never interprets these names —
//! they're just keys into whatever keychain/keystore the binding provides.

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    vec::Vec,
};

/// Secret names the core itself reads or writes.
pub const NOISE_STATIC_KEY: &str = "noiseStaticKey";
pub const SIGNING_KEY: &str = "signingKey";
pub const MESSAGE_RETENTION_KEY: &str = "messageRetentionKey";
pub const IDENTITY_CACHE: &str = "identityCache.v2";

pub fn channel_password_key(channel: &str) -> String {
    alloc::format!("channelPassword:{channel}")
}

/// Opaque byte-blob secret storage, consumed by the core but implemented
/// by the binding (OS keychain, browser storage, or an in-memory mock).
pub trait SecretStore: Send + Sync {
    fn get(&self, name: &str) -> Option<Vec<u8>>;
    fn put(&mut self, name: &str, data: Vec<u8>) -> bool;
    fn delete(&mut self, name: &str) -> bool;
    /// Remove every secret this application owns; used by panic-wipe.
    fn delete_all_owned(&mut self) -> usize;
}

/// In-memory `SecretStore`, the reference implementation for tests and the
/// CLI binding.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    data: BTreeMap<String, Vec<u8>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.data.get(name).cloned()
    }

    fn put(&mut self, name: &str, data: Vec<u8>) -> bool {
        self.data.insert(name.to_string(), data);
        true
    }

    fn delete(&mut self, name: &str) -> bool {
        self.data.remove(name).is_some()
    }

    fn delete_all_owned(&mut self) -> usize {
        let count = self.data.len();
        self.data.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_roundtrip() {
        let mut store = MemorySecretStore::new();
        assert!(store.get(NOISE_STATIC_KEY).is_none());
        assert!(store.put(NOISE_STATIC_KEY, alloc::vec![1, 2, 3]));
        assert_eq!(store.get(NOISE_STATIC_KEY), Some(alloc::vec![1, 2, 3]));
        assert!(store.delete(NOISE_STATIC_KEY));
        assert!(store.get(NOISE_STATIC_KEY).is_none());
    }

    #[test]
    fn panic_wipe_clears_everything() {
        let mut store = MemorySecretStore::new();
        store.put(NOISE_STATIC_KEY, alloc::vec![1]);
        store.put(SIGNING_KEY, alloc::vec![2]);
        store.put(&channel_password_key("#general"), alloc::vec![3]);
        assert_eq!(store.delete_all_owned(), 3);
        assert!(store.get(SIGNING_KEY).is_none());
    }
}
