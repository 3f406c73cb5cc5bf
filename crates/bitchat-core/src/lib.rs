//! BitChat protocol core: framing, Noise sessions, channel keys, relay and
//! fragmentation logic shared by every transport binding.
//!
//! This crate is `no_std` + `alloc` by default so it can run on constrained
//! transport bindings (BLE firmware, WASM); enable the `std` feature for
//! OS-clock timestamps and zlib payload compression.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod channel_keys;
pub mod codec;
pub mod compress;
pub mod config;
pub mod control;
pub mod delivery;
pub mod errors;
pub mod fragmentation;
pub mod identity;
pub mod link;
pub mod noise;
pub mod packet;
pub mod rate_limiter;
pub mod relay;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use codec::{Cursor, Padding, Writer};
pub use config::BitchatConfig;
pub use errors::{BitchatError, Result};
pub use link::{Link, LinkEvent};
pub use noise::{IdentityKeyPair, NoiseKeyPair, NoiseSession, SessionRole, SessionTable};
pub use packet::{MessageType, Packet, PacketFlags};
pub use types::{Fingerprint, PeerId, TimeSource, Timestamp, Ttl};
