//! Flood relay: loop suppression and store-and-forward (C6)
//!
//! Every inbound packet passes through [`RelayDedupSet`] before the
//! dispatcher acts on it a second time, and every outbound private packet
//! that can't be delivered immediately lands in [`StoreAndForwardCache`]
//! until the recipient comes back up.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};
use sha2::{Digest, Sha256};

use crate::config::RelayConfig;
use crate::packet::MessageType;
use crate::types::{Fingerprint, PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Dedup
// ----------------------------------------------------------------------------

pub type DedupKey = (MessageType, PeerId, [u8; 16]);

pub fn dedup_key(msg_type: MessageType, sender_id: PeerId, payload: &[u8]) -> DedupKey {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    let digest: [u8; 32] = hasher.finalize().into();
    let mut prefix = [0u8; 16];
    prefix.copy_from_slice(&digest[..16]);
    (msg_type, sender_id, prefix)
}

/// Bounded LRU of recently seen dedup keys, each carrying an insertion
/// timestamp so stale entries honor the relay dedup TTL even if capacity
/// hasn't been reached yet.
pub struct RelayDedupSet {
    capacity: usize,
    ttl: core::time::Duration,
    order: VecDeque<DedupKey>,
    seen: HashMap<DedupKey, Timestamp>,
}

impl RelayDedupSet {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            capacity: config.dedup_capacity,
            ttl: config.dedup_ttl,
            order: VecDeque::new(),
            seen: HashMap::new(),
        }
    }

    /// Returns `true` if this key was already seen within the TTL (the
    /// packet should be dropped); otherwise records it and returns `false`.
    pub fn check_and_insert(&mut self, key: DedupKey, now: Timestamp) -> bool {
        if let Some(&seen_at) = self.seen.get(&key) {
            if now.duration_since(seen_at) < self.ttl {
                return true;
            }
        }

        self.seen.insert(key, now);
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Store-and-forward
// ----------------------------------------------------------------------------

struct PendingFrame {
    frame: Vec<u8>,
    queued_at: Timestamp,
}

/// Pending private frames for peers that are currently unreachable,
/// bounded by count and total bytes with LRU eviction, flushed in
/// original timestamp order on peer-up.
pub struct StoreAndForwardCache {
    config: RelayConfig,
    queues: HashMap<Fingerprint, VecDeque<PendingFrame>>,
    order: VecDeque<Fingerprint>,
    total_bytes: usize,
    favorites: HashSet<Fingerprint>,
}

impl StoreAndForwardCache {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            queues: HashMap::new(),
            order: VecDeque::new(),
            total_bytes: 0,
            favorites: HashSet::new(),
        }
    }

    pub fn set_favorite(&mut self, fingerprint: Fingerprint, is_favorite: bool) {
        if is_favorite {
            self.favorites.insert(fingerprint);
        } else {
            self.favorites.remove(&fingerprint);
        }
    }

    pub fn enqueue(&mut self, recipient: Fingerprint, frame: Vec<u8>, now: Timestamp) {
        self.total_bytes += frame.len();
        self.queues.entry(recipient.clone()).or_default().push_back(PendingFrame { frame, queued_at: now });
        self.order.push_back(recipient);
        self.evict_over_capacity();
    }

    /// Pop every frame queued for `recipient`, oldest first.
    pub fn flush(&mut self, recipient: &Fingerprint) -> Vec<Vec<u8>> {
        match self.queues.remove(recipient) {
            Some(queue) => {
                self.total_bytes -= queue.iter().map(|p| p.frame.len()).sum::<usize>();
                queue.into_iter().map(|p| p.frame).collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop entries older than the retention window, except for favorites
    /// (unlimited retention).
    pub fn evict_expired(&mut self, now: Timestamp) {
        let retention = self.config.store_forward_retention;
        let favorites = &self.favorites;
        self.queues.retain(|fingerprint, queue| {
            if favorites.contains(fingerprint) {
                return true;
            }
            queue.retain(|p| now.duration_since(p.queued_at) < retention);
            !queue.is_empty()
        });
        self.recompute_bytes();
    }

    fn evict_over_capacity(&mut self) {
        while self.total_entries() > self.config.store_forward_max_entries
            || self.total_bytes > self.config.store_forward_max_bytes
        {
            let Some(oldest) = self.order.pop_front() else { break };
            if let Some(queue) = self.queues.get_mut(&oldest) {
                if self.favorites.contains(&oldest) {
                    continue;
                }
                if let Some(frame) = queue.pop_front() {
                    self.total_bytes -= frame.frame.len();
                }
                if queue.is_empty() {
                    self.queues.remove(&oldest);
                }
            }
        }
    }

    fn recompute_bytes(&mut self) {
        self.total_bytes = self.queues.values().flat_map(|q| q.iter()).map(|p| p.frame.len()).sum();
    }

    pub fn total_entries(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

// ----------------------------------------------------------------------------
// TTL relay decision
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDecision {
    /// Deliver to the local application.
    DeliverLocal,
    /// Forward on every live link except the one it arrived on.
    Forward(crate::types::Ttl),
    /// Drop: already seen, or TTL exhausted and not addressed to us.
    Drop,
}

/// Decide what to do with an inbound packet after dedup has passed.
pub fn relay_decision(recipient: Option<PeerId>, local_peer_id: PeerId, ttl: crate::types::Ttl) -> RelayDecision {
    let addressed_to_us = matches!(recipient, Some(id) if id == local_peer_id || id.is_broadcast());
    let broadcast_or_remote = recipient.is_none() || matches!(recipient, Some(id) if id.is_broadcast() || id != local_peer_id);

    match (addressed_to_us, broadcast_or_remote, ttl.decrement()) {
        (true, true, Some(next)) => RelayDecision::Forward(next),
        (true, _, _) => RelayDecision::DeliverLocal,
        (false, true, Some(next)) => RelayDecision::Forward(next),
        _ => RelayDecision::Drop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RelayConfig {
        RelayConfig {
            default_ttl: 7,
            dedup_capacity: 4,
            dedup_ttl: core::time::Duration::from_secs(600),
            store_forward_max_entries: 4,
            store_forward_max_bytes: 64,
            store_forward_retention: core::time::Duration::from_secs(12 * 3600),
        }
    }

    #[test]
    fn duplicate_packet_is_suppressed() {
        let mut set = RelayDedupSet::new(&config());
        let key = dedup_key(MessageType::Message, PeerId::new([1; 8]), b"hello");
        assert!(!set.check_and_insert(key, Timestamp::new(0)));
        assert!(set.check_and_insert(key, Timestamp::new(1)));
    }

    #[test]
    fn dedup_set_is_bounded() {
        let mut set = RelayDedupSet::new(&config());
        for i in 0..10u8 {
            let key = dedup_key(MessageType::Message, PeerId::new([i; 8]), &[i]);
            set.check_and_insert(key, Timestamp::new(i as u64));
        }
        assert!(set.len() <= 4);
    }

    #[test]
    fn zero_ttl_delivers_locally_but_does_not_forward() {
        let local = PeerId::new([1; 8]);
        let decision = relay_decision(Some(local), local, crate::types::Ttl::new(0));
        assert_eq!(decision, RelayDecision::DeliverLocal);
    }

    #[test]
    fn broadcast_forwards_with_decremented_ttl() {
        let local = PeerId::new([1; 8]);
        let decision = relay_decision(Some(PeerId::BROADCAST), local, crate::types::Ttl::new(3));
        assert_eq!(decision, RelayDecision::Forward(crate::types::Ttl::new(2)));
    }

    #[test]
    fn store_and_forward_flushes_in_order() {
        let mut cache = StoreAndForwardCache::new(config());
        let fp = Fingerprint::new([1; 32]);
        cache.enqueue(fp.clone(), alloc::vec![1], Timestamp::new(0));
        cache.enqueue(fp.clone(), alloc::vec![2], Timestamp::new(1));
        let flushed = cache.flush(&fp);
        assert_eq!(flushed, alloc::vec![alloc::vec![1], alloc::vec![2]]);
    }

    #[test]
    fn favorites_are_not_evicted_by_retention() {
        let mut cache = StoreAndForwardCache::new(config());
        let fp = Fingerprint::new([2; 32]);
        cache.set_favorite(fp.clone(), true);
        cache.enqueue(fp.clone(), alloc::vec![9], Timestamp::new(0));
        cache.evict_expired(Timestamp::new(100 * 3600 * 1000));
        assert_eq!(cache.total_entries(), 1);
    }
}
