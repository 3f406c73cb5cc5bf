//! Error taxonomy for the BitChat protocol core
//!
//! Every error kind named in the protocol's error handling design maps to a
//! concrete variant here. No panics: decode and crypto failures surface as
//! `Result::Err` so the dispatcher can apply its drop/retry policy.

cfg_if::cfg_if! {
    if #[cfg(not(feature = "std"))] {
        use alloc::string::String;
    }
}

use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Component Error Kinds
// ----------------------------------------------------------------------------

/// Codec/packet framing failures (C1/C2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// `version` field not in the supported set
    UnsupportedVersion(u8),
    /// Frame too short, length mismatch, or malformed field
    MalformedFrame,
    /// `flags.hasRecipient`/`hasSignature` set but the field is absent
    MissingField(&'static str),
    /// DEFLATE payload failed to decompress
    DecompressionFailed,
}

/// Noise session failures (C3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No established session for this peer
    NotFound(PeerId),
    /// Remote static/ephemeral key failed validation (all-zero, all-`0xFF`, or zero DH result)
    InvalidPublicKey,
    /// `HandshakeState`/`TransportState` rejected a message
    HandshakeFailed,
    /// AEAD open failed on a transport message
    DecryptionFailed,
    /// Session exceeded its rekey threshold or inactivity window
    Expired,
    /// Handshake did not complete within the timeout
    Timeout,
}

/// Channel (group) key failures (C4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No usable key for this channel/epoch window
    KeyMissing,
    /// Every epoch key in the decryption window failed to authenticate
    DecryptionFailed,
    /// Channel name violates the naming rules in the channel keys component
    InvalidName,
}

/// Identity and rate-limiting failures (C5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Ed25519 signature over the identity binding failed to verify
    InvalidSignature,
    /// Per-peer or global handshake/message rate exceeded
    RateLimited,
}

/// Fragment reassembly failures (C7)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentationError {
    /// `index >= total`, or `total` disagrees with an earlier fragment
    InvalidHeader,
    /// A fragment with this `(fragment_id, index)` was already seen
    DuplicateFragment,
    /// Reassembly did not complete within the timeout
    Timeout,
    /// `MAX_CONCURRENT_REASSEMBLIES` already in flight
    TableFull,
}

// ----------------------------------------------------------------------------
// Aggregate Error
// ----------------------------------------------------------------------------

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        /// Top-level error type for the BitChat protocol core
        #[derive(Debug, thiserror::Error)]
        pub enum BitchatError {
            #[error("packet error: {0:?}")]
            Packet(PacketError),

            #[error("session error: {0:?}")]
            Session(SessionError),

            #[error("channel error: {0:?}")]
            Channel(ChannelError),

            #[error("identity error: {0:?}")]
            Identity(IdentityError),

            #[error("fragmentation error: {0:?}")]
            Fragmentation(FragmentationError),

            #[error("noise protocol error: {0}")]
            Noise(#[from] snow::Error),

            #[error("storage error: {0}")]
            Storage(String),

            #[error("configuration error: {0}")]
            Configuration(String),

            #[error("operation not implemented: {0}")]
            Unimplemented(&'static str),
        }
    } else {
        /// Top-level error type for the BitChat protocol core (no_std)
        #[derive(Debug)]
        pub enum BitchatError {
            Packet(PacketError),
            Session(SessionError),
            Channel(ChannelError),
            Identity(IdentityError),
            Fragmentation(FragmentationError),
            Noise(snow::Error),
            Storage(String),
            Configuration(String),
            Unimplemented(&'static str),
        }

        impl From<snow::Error> for BitchatError {
            fn from(err: snow::Error) -> Self {
                BitchatError::Noise(err)
            }
        }
    }
}

impl From<PacketError> for BitchatError {
    fn from(err: PacketError) -> Self {
        BitchatError::Packet(err)
    }
}

impl From<SessionError> for BitchatError {
    fn from(err: SessionError) -> Self {
        BitchatError::Session(err)
    }
}

impl From<ChannelError> for BitchatError {
    fn from(err: ChannelError) -> Self {
        BitchatError::Channel(err)
    }
}

impl From<IdentityError> for BitchatError {
    fn from(err: IdentityError) -> Self {
        BitchatError::Identity(err)
    }
}

impl From<FragmentationError> for BitchatError {
    fn from(err: FragmentationError) -> Self {
        BitchatError::Fragmentation(err)
    }
}

impl BitchatError {
    pub fn storage<T: Into<String>>(message: T) -> Self {
        BitchatError::Storage(message.into())
    }

    pub fn configuration<T: Into<String>>(message: T) -> Self {
        BitchatError::Configuration(message.into())
    }
}

pub type Result<T> = core::result::Result<T, BitchatError>;
