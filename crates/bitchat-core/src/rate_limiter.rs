//! Per-peer and global rate limiting for handshakes and messages (C5)
//!
//! Two independent windows: one bounding `noiseHandshakeInit` attempts
//! (per-peer and global), one bounding plaintext/private message volume
//! per peer. Both share the sliding window from [`RateLimitConfig`].

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::config::RateLimitConfig;
use crate::errors::{BitchatError, IdentityError};
use crate::types::{PeerId, TimeSource, Timestamp};

#[derive(Debug, Clone, Default)]
struct PeerActivity {
    handshake_times: Vec<Timestamp>,
    message_times: Vec<Timestamp>,
}

impl PeerActivity {
    fn cleanup(&mut self, cutoff: u64) {
        self.handshake_times.retain(|ts| ts.as_millis() >= cutoff);
        self.message_times.retain(|ts| ts.as_millis() >= cutoff);
    }
}

/// Rate limiter for Noise handshake initiations and message volume.
pub struct RateLimiter<T: TimeSource> {
    config: RateLimitConfig,
    peer_activity: BTreeMap<PeerId, PeerActivity>,
    time_source: T,
    global_handshakes: Vec<Timestamp>,
}

impl<T: TimeSource> RateLimiter<T> {
    pub fn new(time_source: T) -> Self {
        Self::with_config(RateLimitConfig::default(), time_source)
    }

    pub fn with_config(config: RateLimitConfig, time_source: T) -> Self {
        Self { config, peer_activity: BTreeMap::new(), time_source, global_handshakes: Vec::new() }
    }

    fn cutoff(&self) -> u64 {
        self.time_source.now().as_millis().saturating_sub(self.config.window.as_millis() as u64)
    }

    pub fn check_handshake_allowed(&mut self, peer_id: &PeerId) -> Result<(), BitchatError> {
        self.cleanup_expired();

        if self.global_handshakes.len() as u32 >= self.config.global_handshakes_per_window {
            return Err(IdentityError::RateLimited.into());
        }

        let activity = self.peer_activity.entry(*peer_id).or_default();
        if activity.handshake_times.len() as u32 >= self.config.handshakes_per_peer_per_window {
            return Err(IdentityError::RateLimited.into());
        }

        Ok(())
    }

    pub fn record_handshake(&mut self, peer_id: &PeerId) {
        let now = self.time_source.now();
        self.global_handshakes.push(now);
        self.peer_activity.entry(*peer_id).or_default().handshake_times.push(now);
    }

    pub fn check_message_allowed(&mut self, peer_id: &PeerId) -> Result<(), BitchatError> {
        self.cleanup_expired();

        let activity = self.peer_activity.entry(*peer_id).or_default();
        if activity.message_times.len() as u32 >= self.config.messages_per_peer_per_window {
            return Err(IdentityError::RateLimited.into());
        }

        Ok(())
    }

    pub fn record_message(&mut self, peer_id: &PeerId) {
        let now = self.time_source.now();
        self.peer_activity.entry(*peer_id).or_default().message_times.push(now);
    }

    fn cleanup_expired(&mut self) {
        let cutoff = self.cutoff();
        self.global_handshakes.retain(|ts| ts.as_millis() >= cutoff);
        for activity in self.peer_activity.values_mut() {
            activity.cleanup(cutoff);
        }
        self.peer_activity.retain(|_, activity| !activity.handshake_times.is_empty() || !activity.message_times.is_empty());
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RateLimitConfig) {
        self.config = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SystemTimeSource;

    #[test]
    fn per_peer_message_limit_enforced() {
        let mut limiter = RateLimiter::with_config(RateLimitConfig { messages_per_peer_per_window: 2, ..RateLimitConfig::default() }, SystemTimeSource);
        let peer = PeerId::new([1; 8]);

        assert!(limiter.check_message_allowed(&peer).is_ok());
        limiter.record_message(&peer);
        assert!(limiter.check_message_allowed(&peer).is_ok());
        limiter.record_message(&peer);
        assert!(limiter.check_message_allowed(&peer).is_err());
    }

    #[test]
    fn per_peer_handshake_limit_enforced() {
        let mut limiter = RateLimiter::with_config(RateLimitConfig { handshakes_per_peer_per_window: 1, ..RateLimitConfig::default() }, SystemTimeSource);
        let peer = PeerId::new([2; 8]);

        assert!(limiter.check_handshake_allowed(&peer).is_ok());
        limiter.record_handshake(&peer);
        assert!(limiter.check_handshake_allowed(&peer).is_err());
    }

    #[test]
    fn global_handshake_limit_enforced_across_peers() {
        let mut limiter = RateLimiter::with_config(RateLimitConfig { global_handshakes_per_window: 1, ..RateLimitConfig::default() }, SystemTimeSource);
        let a = PeerId::new([1; 8]);
        let b = PeerId::new([2; 8]);

        assert!(limiter.check_handshake_allowed(&a).is_ok());
        limiter.record_handshake(&a);
        assert!(limiter.check_handshake_allowed(&b).is_err());
    }
}
