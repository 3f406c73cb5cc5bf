//! DEFLATE helpers backing the packet component's compression rule
//!
//! Only available with `std`; in a `no_std` build payloads are always
//! sent uncompressed (`deflate` always returns `None`).

use alloc::vec::Vec;

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        use flate2::read::ZlibDecoder;
        use flate2::write::ZlibEncoder;
        use flate2::Compression as Level;
        use std::io::{Read, Write};

        /// DEFLATE-compress `data`, or `None` if compression failed.
        pub fn deflate(data: &[u8]) -> Option<Vec<u8>> {
            let mut encoder = ZlibEncoder::new(Vec::new(), Level::default());
            encoder.write_all(data).ok()?;
            encoder.finish().ok()
        }

        /// Inflate `data`, verifying the result matches `expected_len`.
        pub fn inflate(data: &[u8], expected_len: usize) -> Option<Vec<u8>> {
            let mut decoder = ZlibDecoder::new(data);
            let mut out = Vec::with_capacity(expected_len);
            decoder.read_to_end(&mut out).ok()?;
            if out.len() != expected_len {
                return None;
            }
            Some(out)
        }
    } else {
        pub fn deflate(_data: &[u8]) -> Option<Vec<u8>> {
            None
        }

        pub fn inflate(_data: &[u8], _expected_len: usize) -> Option<Vec<u8>> {
            None
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let data = alloc::vec![b'x'; 4096];
        let compressed = deflate(&data).unwrap();
        assert!(compressed.len() < data.len());
        let restored = inflate(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn length_mismatch_rejected() {
        let data = alloc::vec![b'x'; 4096];
        let compressed = deflate(&data).unwrap();
        assert!(inflate(&compressed, data.len() - 1).is_none());
    }
}
