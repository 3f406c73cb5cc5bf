//! Centralized configuration for the BitChat protocol core
//!
//! Every numeric default here is the value the protocol's component design
//! section specifies. `BitchatConfig::permissive()` relaxes the limits that
//! would otherwise make deterministic unit tests slow (handshake/message
//! rate limits, session rekey thresholds) and must never be used outside
//! `#[cfg(test)]`.

use core::time::Duration;

// ----------------------------------------------------------------------------
// Rate limiting (C5)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RateLimitConfig {
    /// Handshake initiations allowed per peer per window
    pub handshakes_per_peer_per_window: u32,
    /// Handshake initiations allowed globally per window
    pub global_handshakes_per_window: u32,
    /// Messages allowed per peer per window
    pub messages_per_peer_per_window: u32,
    /// Window duration, shared by the handshake and message limits
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            handshakes_per_peer_per_window: 3,
            global_handshakes_per_window: 30,
            messages_per_peer_per_window: 100,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn permissive() -> Self {
        Self {
            handshakes_per_peer_per_window: 10_000,
            global_handshakes_per_window: 10_000,
            messages_per_peer_per_window: 10_000,
            window: Duration::from_secs(60),
        }
    }
}

// ----------------------------------------------------------------------------
// Noise session lifecycle (C3)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionConfig {
    /// Start a rekey once `send_counter` reaches this value
    pub rekey_threshold: u64,
    /// Hard cap; sessions at or above this are unconditionally stale
    pub rekey_hard_limit: u64,
    /// Mark a session stale after this much time without activity
    pub inactivity_timeout: Duration,
    /// Abandon an in-progress handshake after this long
    pub handshake_timeout: Duration,
    /// Grace period an old peer-id is kept resolvable after identity rotation
    pub rotation_grace_period: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rekey_threshold: 900_000,
            rekey_hard_limit: 1_000_000,
            inactivity_timeout: Duration::from_secs(30 * 60),
            handshake_timeout: Duration::from_secs(10),
            rotation_grace_period: Duration::from_secs(60),
        }
    }
}

// ----------------------------------------------------------------------------
// Channel (group) keys (C4)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChannelConfig {
    /// PBKDF2-HMAC-SHA256 iteration count for the base channel key
    pub pbkdf2_iterations: u32,
    /// Epochs retained for grace-period decryption (including current)
    pub max_epochs: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: 210_000,
            max_epochs: 7,
        }
    }
}

// ----------------------------------------------------------------------------
// Relay (C6)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RelayConfig {
    /// Initial TTL stamped on locally originated packets
    pub default_ttl: u8,
    /// Bounded LRU capacity for the dedup set
    pub dedup_capacity: usize,
    /// How long a dedup entry is honored even if not evicted by capacity
    pub dedup_ttl: Duration,
    /// Store-and-forward cache: max entries
    pub store_forward_max_entries: usize,
    /// Store-and-forward cache: max total bytes
    pub store_forward_max_bytes: usize,
    /// Retention for a non-favorite recipient's pending frames
    pub store_forward_retention: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_ttl: 7,
            dedup_capacity: 2048,
            dedup_ttl: Duration::from_secs(10 * 60),
            store_forward_max_entries: 500,
            store_forward_max_bytes: 4 * 1024 * 1024,
            store_forward_retention: Duration::from_secs(12 * 60 * 60),
        }
    }
}

// ----------------------------------------------------------------------------
// Fragmentation (C7)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FragmentConfig {
    /// Link MTU; payloads larger than this are split
    pub mtu: usize,
    /// Maximum concurrent reassembly contexts
    pub max_concurrent_reassemblies: usize,
    /// Discard a reassembly context after this long without a new piece
    pub reassembly_timeout: Duration,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            mtu: 500,
            max_concurrent_reassemblies: 64,
            reassembly_timeout: Duration::from_secs(30),
        }
    }
}

// ----------------------------------------------------------------------------
// Identity rotation (C5)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IdentityConfig {
    /// Minimum interval between ephemeral peer-id rotations
    pub rotation_interval_min: Duration,
    /// Maximum interval between ephemeral peer-id rotations
    pub rotation_interval_max: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            rotation_interval_min: Duration::from_secs(5 * 60),
            rotation_interval_max: Duration::from_secs(15 * 60),
        }
    }
}

// ----------------------------------------------------------------------------
// Control plane
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ControlPlaneConfig {
    /// Time allowed for version negotiation before the peer is dropped
    pub negotiation_timeout: Duration,
    /// Protocol versions this build advertises and accepts
    pub supported_versions: alloc::vec::Vec<u8>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(5),
            supported_versions: alloc::vec![1],
        }
    }
}

// ----------------------------------------------------------------------------
// Aggregate
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct BitchatConfig {
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub channel: ChannelConfig,
    pub relay: RelayConfig,
    pub fragment: FragmentConfig,
    pub identity: IdentityConfig,
    pub control_plane: ControlPlaneConfig,
}

impl BitchatConfig {
    /// A config with relaxed rate limits, for deterministic unit tests only
    pub fn permissive() -> Self {
        Self {
            rate_limit: RateLimitConfig::permissive(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = BitchatConfig::default();
        assert_eq!(config.channel.pbkdf2_iterations, 210_000);
        assert_eq!(config.channel.max_epochs, 7);
        assert_eq!(config.session.rekey_threshold, 900_000);
        assert_eq!(config.session.rekey_hard_limit, 1_000_000);
        assert_eq!(config.relay.dedup_capacity, 2048);
        assert_eq!(config.relay.default_ttl, 7);
        assert_eq!(config.fragment.max_concurrent_reassemblies, 64);
        assert_eq!(config.fragment.mtu, 500);
    }
}
