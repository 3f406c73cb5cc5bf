//! Outer packet framing (C2)
//!
//! `Packet` is the frame that crosses a [`crate::link::Link`]: a fixed
//! header, sender/recipient, an optionally compressed payload, and an
//! optional detached signature. Encoding runs compression, serialization,
//! then padding in that order; decoding reverses it.

use alloc::vec::Vec;
use rand_core::{CryptoRng, RngCore};

use crate::codec::{Cursor, Padding, Writer};
use crate::errors::{BitchatError, PacketError};
use crate::types::{PeerId, Timestamp, Ttl};

/// Wire version this build emits and accepts
pub const VERSION: u8 = 0x01;

/// Versions this build will decode
pub const SUPPORTED_VERSIONS: &[u8] = &[VERSION];

/// Minimum payload length eligible for compression
const COMPRESSION_MIN_LEN: usize = 100;

/// Required size reduction for compression to be applied
const COMPRESSION_MIN_RATIO: f32 = 0.10;

pub const SIGNATURE_SIZE: usize = 64;
pub const PEER_ID_SIZE: usize = 8;

// ----------------------------------------------------------------------------
// MessageType
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Announce = 0x01,
    Leave = 0x03,
    Message = 0x04,
    FragmentStart = 0x05,
    FragmentContinue = 0x06,
    FragmentEnd = 0x07,
    ChannelAnnounce = 0x08,
    ChannelRetention = 0x09,
    DeliveryAck = 0x0A,
    DeliveryStatusRequest = 0x0B,
    ReadReceipt = 0x0C,
    NoiseHandshakeInit = 0x10,
    NoiseHandshakeResp = 0x11,
    NoiseEncrypted = 0x12,
    NoiseIdentityAnnounce = 0x13,
    ChannelKeyVerifyRequest = 0x14,
    ChannelKeyVerifyResponse = 0x15,
    ChannelPasswordUpdate = 0x16,
    ChannelMetadata = 0x17,
    VersionHello = 0x20,
    VersionAck = 0x21,
}

impl MessageType {
    pub fn is_fragment(&self) -> bool {
        matches!(self, Self::FragmentStart | Self::FragmentContinue | Self::FragmentEnd)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = BitchatError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x01 => Self::Announce,
            0x03 => Self::Leave,
            0x04 => Self::Message,
            0x05 => Self::FragmentStart,
            0x06 => Self::FragmentContinue,
            0x07 => Self::FragmentEnd,
            0x08 => Self::ChannelAnnounce,
            0x09 => Self::ChannelRetention,
            0x0A => Self::DeliveryAck,
            0x0B => Self::DeliveryStatusRequest,
            0x0C => Self::ReadReceipt,
            0x10 => Self::NoiseHandshakeInit,
            0x11 => Self::NoiseHandshakeResp,
            0x12 => Self::NoiseEncrypted,
            0x13 => Self::NoiseIdentityAnnounce,
            0x14 => Self::ChannelKeyVerifyRequest,
            0x15 => Self::ChannelKeyVerifyResponse,
            0x16 => Self::ChannelPasswordUpdate,
            0x17 => Self::ChannelMetadata,
            0x20 => Self::VersionHello,
            0x21 => Self::VersionAck,
            _ => return Err(PacketError::MalformedFrame.into()),
        })
    }
}

// ----------------------------------------------------------------------------
// Flags
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const HAS_RECIPIENT: u8 = 0x01;
    pub const HAS_SIGNATURE: u8 = 0x02;
    pub const COMPRESSED: u8 = 0x04;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn has_recipient(&self) -> bool {
        self.0 & Self::HAS_RECIPIENT != 0
    }

    pub fn has_signature(&self) -> bool {
        self.0 & Self::HAS_SIGNATURE != 0
    }

    pub fn compressed(&self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    fn set(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

// ----------------------------------------------------------------------------
// Packet
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Packet {
    pub msg_type: MessageType,
    pub ttl: Ttl,
    pub timestamp: Timestamp,
    pub sender_id: PeerId,
    pub recipient_id: Option<PeerId>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl Packet {
    pub fn new(msg_type: MessageType, sender_id: PeerId, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            ttl: Ttl::DEFAULT,
            timestamp: Timestamp::now(),
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    pub fn with_recipient(mut self, recipient_id: PeerId) -> Self {
        self.recipient_id = Some(recipient_id);
        self
    }

    fn flags(&self) -> PacketFlags {
        let mut flags = PacketFlags::default();
        flags.set(PacketFlags::HAS_RECIPIENT, self.recipient_id.is_some());
        flags.set(PacketFlags::HAS_SIGNATURE, self.signature.is_some());
        flags
    }

    /// Canonical bytes a signature is computed over: every field except
    /// the signature itself, post-compression.
    fn signing_bytes(&self, compressed_payload: &[u8], flags: PacketFlags) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u8(VERSION);
        w.write_u8(self.msg_type as u8);
        w.write_u8(self.ttl.value());
        w.write_u64(self.timestamp.as_millis());
        w.write_u8(flags.bits());
        w.write_u16(compressed_payload.len() as u16);
        w.write_bytes(self.sender_id.as_bytes());
        if let Some(recipient) = &self.recipient_id {
            w.write_bytes(recipient.as_bytes());
        }
        w.write_bytes(compressed_payload);
        w.into_bytes()
    }

    /// Sign this packet in place using the given Ed25519 signer.
    pub fn sign<F>(&mut self, signer: F)
    where
        F: FnOnce(&[u8]) -> [u8; SIGNATURE_SIZE],
    {
        let (payload, flags) = self.prepare_payload();
        let bytes = self.signing_bytes(&payload, flags);
        self.signature = Some(signer(&bytes));
    }

    /// Verify a packet's signature against the given Ed25519 verifier.
    pub fn verify_signature<F>(&self, verifier: F) -> bool
    where
        F: FnOnce(&[u8], &[u8; SIGNATURE_SIZE]) -> bool,
    {
        match &self.signature {
            None => false,
            Some(sig) => {
                let (payload, flags) = self.prepare_payload();
                let bytes = self.signing_bytes(&payload, flags);
                verifier(&bytes, sig)
            }
        }
    }

    /// Applies the compression rule from the packet component design:
    /// payload compressed only if it's over the minimum length and DEFLATE
    /// buys at least a 10% reduction.
    fn prepare_payload(&self) -> (Vec<u8>, PacketFlags) {
        let mut flags = self.flags();
        if self.payload.len() > COMPRESSION_MIN_LEN {
            if let Some(compressed) = crate::compress::deflate(&self.payload) {
                let reduction = 1.0 - (compressed.len() as f32 / self.payload.len() as f32);
                if reduction >= COMPRESSION_MIN_RATIO {
                    flags.set(PacketFlags::COMPRESSED, true);
                    let mut framed = Writer::new();
                    framed.write_u32(self.payload.len() as u32);
                    framed.write_bytes(&compressed);
                    return (framed.into_bytes(), flags);
                }
            }
        }
        (self.payload.clone(), flags)
    }

    /// Encode this packet to its wire form, applying compression then
    /// random block padding.
    pub fn encode<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Vec<u8> {
        let (payload, flags) = self.prepare_payload();
        let mut w = Writer::new();
        w.write_u8(VERSION);
        w.write_u8(self.msg_type as u8);
        w.write_u8(self.ttl.value());
        w.write_u64(self.timestamp.as_millis());
        w.write_u8(flags.bits());
        w.write_u16(payload.len() as u16);
        w.write_bytes(self.sender_id.as_bytes());
        if let Some(recipient) = &self.recipient_id {
            w.write_bytes(recipient.as_bytes());
        }
        w.write_bytes(&payload);
        if let Some(sig) = &self.signature {
            w.write_bytes(sig);
        }
        Padding::pad(w.into_bytes(), rng)
    }

    /// Decode a wire frame. Trailing padding bytes beyond `payload_len`
    /// and the optional signature are ignored rather than stripped via
    /// `Padding::unpad`, since every field length is explicit here.
    pub fn decode(frame: &[u8]) -> Result<Self, BitchatError> {
        let mut cur = Cursor::new(frame);
        let version = cur.read_u8()?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(PacketError::UnsupportedVersion(version).into());
        }
        let msg_type = MessageType::try_from(cur.read_u8()?)?;
        let ttl = Ttl::new(cur.read_u8()?);
        let timestamp = Timestamp::new(cur.read_u64()?);
        let flags = PacketFlags::from_bits(cur.read_u8()?);
        let payload_len = cur.read_u16()? as usize;
        let sender_id = PeerId::new(cur.read_array::<PEER_ID_SIZE>()?);

        let recipient_id = if flags.has_recipient() {
            Some(PeerId::new(cur.read_array::<PEER_ID_SIZE>()?))
        } else {
            None
        };

        let raw_payload = cur.read_bytes(payload_len)?;
        let payload = if flags.compressed() {
            let mut pcur = Cursor::new(raw_payload);
            let original_len = pcur.read_u32()? as usize;
            let deflated = pcur.read_bytes(pcur.remaining())?;
            crate::compress::inflate(deflated, original_len)
                .ok_or(PacketError::DecompressionFailed)?
        } else {
            raw_payload.to_vec()
        };

        let signature = if flags.has_signature() {
            Some(cur.read_array::<SIGNATURE_SIZE>()?)
        } else {
            None
        };

        Ok(Self {
            msg_type,
            ttl,
            timestamp,
            sender_id,
            recipient_id,
            payload,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn test_packet(payload: Vec<u8>) -> Packet {
        Packet::new(MessageType::Message, PeerId::new([1; 8]), payload)
    }

    #[test]
    fn roundtrip_minimal() {
        let packet = test_packet(alloc::vec![1, 2, 3]);
        let encoded = packet.encode(&mut OsRng);
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.payload, packet.payload);
        assert_eq!(decoded.msg_type, packet.msg_type);
        assert_eq!(decoded.sender_id, packet.sender_id);
    }

    #[test]
    fn roundtrip_with_recipient() {
        let packet = test_packet(alloc::vec![9; 40]).with_recipient(PeerId::BROADCAST);
        let encoded = packet.encode(&mut OsRng);
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.recipient_id, Some(PeerId::BROADCAST));
    }

    #[test]
    fn unsupported_version_rejected() {
        let mut packet = test_packet(alloc::vec![1]).encode(&mut OsRng);
        packet[0] = 0x09;
        assert!(matches!(
            Packet::decode(&packet),
            Err(BitchatError::Packet(PacketError::UnsupportedVersion(0x09)))
        ));
    }

    #[test]
    fn large_payload_round_trips_compressed() {
        let payload: Vec<u8> = alloc::vec![b'a'; 2000];
        let packet = test_packet(payload.clone());
        let encoded = packet.encode(&mut OsRng);
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn signature_roundtrip() {
        let mut packet = test_packet(alloc::vec![1, 2, 3]);
        packet.sign(|_bytes| [7u8; SIGNATURE_SIZE]);
        assert!(packet.verify_signature(|_bytes, sig| *sig == [7u8; SIGNATURE_SIZE]));
        let encoded = packet.encode(&mut OsRng);
        let decoded = Packet::decode(&encoded).unwrap();
        assert_eq!(decoded.signature, Some([7u8; SIGNATURE_SIZE]));
    }
}
