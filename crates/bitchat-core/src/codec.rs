//! Primitive field codec (C1)
//!
//! Big-endian integer read/write, length-prefixed strings and byte blobs,
//! and the block-padding scheme used to resist traffic analysis. All of
//! this is pure and allocation-light so it can be fuzzed and proptested in
//! isolation from the packet framing in [`crate::packet`].

use alloc::{string::String, vec::Vec};
use rand_core::{CryptoRng, RngCore};

use crate::errors::{BitchatError, PacketError};

/// Standard padding block sizes for traffic-analysis resistance
pub const PADDING_BLOCK_SIZES: &[usize] = &[256, 512, 1024, 2048];

/// Bytes reserved for framing overhead when choosing a padding block
const PADDING_RESERVE: usize = 16;

// ----------------------------------------------------------------------------
// Cursor-based reader
// ----------------------------------------------------------------------------

/// Explicit read cursor over a byte slice, replacing the source's mutable
/// `inout` offset parameter idiom.
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BitchatError> {
        if self.remaining() < n {
            return Err(PacketError::MalformedFrame.into());
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, BitchatError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, BitchatError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, BitchatError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, BitchatError> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], BitchatError> {
        let bytes = self.take(N)?;
        Ok(bytes.try_into().unwrap())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], BitchatError> {
        self.take(n)
    }

    /// Length-prefixed UTF-8 string (u8 length if `max <= 255`, else u16).
    pub fn read_string(&mut self, max: usize) -> Result<String, BitchatError> {
        let len = if max <= 255 {
            self.read_u8()? as usize
        } else {
            self.read_u16()? as usize
        };
        let bytes = self.read_bytes(len)?;
        core::str::from_utf8(bytes)
            .map(String::from)
            .map_err(|_| PacketError::MalformedFrame.into())
    }

    pub fn read_uuid(&mut self) -> Result<uuid::Uuid, BitchatError> {
        let bytes: [u8; 16] = self.read_array()?;
        Ok(uuid::Uuid::from_bytes(bytes))
    }
}

// ----------------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------------

/// Append-only big-endian byte writer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Length-prefixed UTF-8 string (u8 length if `max <= 255`, else u16).
    pub fn write_string(&mut self, s: &str, max: usize) -> Result<&mut Self, BitchatError> {
        let bytes = s.as_bytes();
        if bytes.len() > max {
            return Err(PacketError::MalformedFrame.into());
        }
        if max <= 255 {
            self.write_u8(bytes.len() as u8);
        } else {
            self.write_u16(bytes.len() as u16);
        }
        self.write_bytes(bytes);
        Ok(self)
    }

    pub fn write_uuid(&mut self, id: &uuid::Uuid) -> &mut Self {
        self.write_bytes(id.as_bytes());
        self
    }
}

// ----------------------------------------------------------------------------
// Padding
// ----------------------------------------------------------------------------

/// PKCS#7-style padding with a cryptographically random prefix, used to
/// round encoded frames up to one of [`PADDING_BLOCK_SIZES`] so frame length
/// alone does not leak payload size.
pub struct Padding;

impl Padding {
    /// Smallest block such that `data_len + PADDING_RESERVE <= block`, or
    /// the next 2048-byte boundary above that for oversized frames.
    pub fn target_block_size(data_len: usize) -> usize {
        for &block in PADDING_BLOCK_SIZES {
            if data_len + PADDING_RESERVE <= block {
                return block;
            }
        }
        data_len.div_ceil(2048) * 2048
    }

    /// Pad `data` to its target block size. If the padding needed exceeds
    /// 255 bytes the data is returned unpadded (applies only to frames
    /// already larger than `2048 - PADDING_RESERVE`).
    pub fn pad<R: RngCore + CryptoRng>(mut data: Vec<u8>, rng: &mut R) -> Vec<u8> {
        let target = Self::target_block_size(data.len());
        let needed = target.saturating_sub(data.len());
        if needed == 0 || needed > 255 {
            return data;
        }
        let mut filler = alloc::vec![0u8; needed - 1];
        rng.fill_bytes(&mut filler);
        data.extend_from_slice(&filler);
        data.push(needed as u8);
        data
    }

    /// Strip padding added by [`Self::pad`]. Treats the input as unpadded
    /// (returns it unchanged) if the trailing length byte is zero, exceeds
    /// the input length, or the bytes it claims as padding don't look like
    /// this scheme's filler (length check only — filler bytes are random
    /// and not otherwise verifiable).
    pub fn unpad(data: &[u8]) -> &[u8] {
        match data.last() {
            Some(&p) if p != 0 && (p as usize) < data.len() => &data[..data.len() - p as usize],
            _ => data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn integer_roundtrip() {
        let mut w = Writer::new();
        w.write_u8(0xAB).write_u16(0x1234).write_u32(0xDEADBEEF).write_u64(0x1122334455667788);
        let bytes = w.into_bytes();
        let mut r = Cursor::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.read_u64().unwrap(), 0x1122334455667788);
    }

    #[test]
    fn string_roundtrip() {
        let mut w = Writer::new();
        w.write_string("hello bitchat", 255).unwrap();
        let bytes = w.into_bytes();
        let mut r = Cursor::new(&bytes);
        assert_eq!(r.read_string(255).unwrap(), "hello bitchat");
    }

    #[test]
    fn pad_reaches_block_boundary_and_unpads() {
        let mut rng = OsRng;
        let data = alloc::vec![0x42u8; 5];
        let padded = Padding::pad(data.clone(), &mut rng);
        assert_eq!(padded.len(), 256);
        assert_eq!(*padded.last().unwrap(), (256 - 5) as u8);
        assert_eq!(Padding::unpad(&padded), data.as_slice());
    }

    #[test]
    fn pad_output_differs_between_calls() {
        let mut rng = OsRng;
        let a = Padding::pad(alloc::vec![1u8; 10], &mut rng);
        let b = Padding::pad(alloc::vec![1u8; 10], &mut rng);
        assert_ne!(a, b);
    }

    #[test]
    fn optimal_block_size_boundaries() {
        assert_eq!(Padding::target_block_size(100), 256);
        assert_eq!(Padding::target_block_size(240), 256);
        assert_eq!(Padding::target_block_size(241), 512);
        assert_eq!(Padding::target_block_size(2033), 2048);
        assert_eq!(Padding::target_block_size(2049), 4096);
    }
}
