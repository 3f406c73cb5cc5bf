//! Message fragmentation and reassembly (C7)
//!
//! Splits an already-encoded payload larger than the link MTU into pieces
//! tagged `fragmentStart`/`fragmentContinue`/`fragmentEnd`, and reassembles
//! them on the receiving end with bounded, time-limited state.

use alloc::vec::Vec;
use hashbrown::HashMap;
use rand_core::{CryptoRng, RngCore};

use crate::config::FragmentConfig;
use crate::errors::{BitchatError, FragmentationError};
use crate::packet::MessageType;
use crate::types::Timestamp;

pub const FRAGMENT_ID_SIZE: usize = 8;

// ----------------------------------------------------------------------------
// Fragment
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    pub fragment_id: [u8; FRAGMENT_ID_SIZE],
    pub index: u16,
    pub total: u16,
    pub original_type: u8,
}

#[derive(Debug, Clone)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub data: Vec<u8>,
}

impl Fragment {
    /// The `MessageType` this fragment should be wrapped in: `fragmentStart`
    /// for index 0, `fragmentEnd` for the last index, else `fragmentContinue`.
    pub fn wire_type(&self) -> MessageType {
        if self.header.index == 0 {
            MessageType::FragmentStart
        } else if self.header.index + 1 == self.header.total {
            MessageType::FragmentEnd
        } else {
            MessageType::FragmentContinue
        }
    }
}

// ----------------------------------------------------------------------------
// Splitting
// ----------------------------------------------------------------------------

pub struct MessageFragmenter;

impl MessageFragmenter {
    /// Split `payload` into MTU-sized fragments carrying `original_type`.
    /// Returns an empty vector (the caller should send unfragmented) if
    /// `payload` already fits within `mtu`.
    pub fn fragment(
        payload: &[u8],
        original_type: u8,
        config: &FragmentConfig,
        rng: &mut (impl RngCore + CryptoRng),
    ) -> Vec<Fragment> {
        if payload.len() <= config.mtu {
            return Vec::new();
        }

        let mut fragment_id = [0u8; FRAGMENT_ID_SIZE];
        rng.fill_bytes(&mut fragment_id);

        let chunks: Vec<&[u8]> = payload.chunks(config.mtu).collect();
        let total = chunks.len() as u16;

        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| Fragment {
                header: FragmentHeader {
                    fragment_id,
                    index: index as u16,
                    total,
                    original_type,
                },
                data: chunk.to_vec(),
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Reassembly
// ----------------------------------------------------------------------------

struct ReassemblyState {
    total: u16,
    original_type: u8,
    pieces: HashMap<u16, Vec<u8>>,
    first_seen: Timestamp,
}

impl ReassemblyState {
    fn is_complete(&self) -> bool {
        self.pieces.len() == self.total as usize
    }

    fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for index in 0..self.total {
            if let Some(piece) = self.pieces.get(&index) {
                out.extend_from_slice(piece);
            }
        }
        out
    }
}

/// Bounded table of in-flight reassemblies, keyed by `fragment_id`.
pub struct MessageReassembler {
    contexts: HashMap<[u8; FRAGMENT_ID_SIZE], ReassemblyState>,
    config: FragmentConfig,
}

impl MessageReassembler {
    pub fn new(config: FragmentConfig) -> Self {
        Self { contexts: HashMap::new(), config }
    }

    /// Feed one fragment in. Returns the reassembled payload and its
    /// original message type once every piece has arrived.
    pub fn process(&mut self, fragment: Fragment, now: Timestamp) -> Result<Option<(u8, Vec<u8>)>, BitchatError> {
        let id = fragment.header.fragment_id;

        if fragment.header.index >= fragment.header.total {
            return Err(FragmentationError::InvalidHeader.into());
        }

        if let Some(existing) = self.contexts.get(&id) {
            if existing.total != fragment.header.total || existing.original_type != fragment.header.original_type {
                return Err(FragmentationError::InvalidHeader.into());
            }
            if existing.pieces.contains_key(&fragment.header.index) {
                return Err(FragmentationError::DuplicateFragment.into());
            }
        } else {
            if self.contexts.len() >= self.config.max_concurrent_reassemblies {
                return Err(FragmentationError::TableFull.into());
            }
            self.contexts.insert(
                id,
                ReassemblyState {
                    total: fragment.header.total,
                    original_type: fragment.header.original_type,
                    pieces: HashMap::new(),
                    first_seen: now,
                },
            );
        }

        let state = self.contexts.get_mut(&id).expect("inserted above");
        state.pieces.insert(fragment.header.index, fragment.data);

        if state.is_complete() {
            let state = self.contexts.remove(&id).expect("looked up above");
            return Ok(Some((state.original_type, state.assemble())));
        }

        Ok(None)
    }

    /// Drop contexts that haven't seen a new piece within the reassembly timeout.
    pub fn evict_expired(&mut self, now: Timestamp) {
        let timeout = self.config.reassembly_timeout;
        self.contexts.retain(|_, state| now.duration_since(state.first_seen) < timeout);
    }

    pub fn active_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn cancel(&mut self, fragment_id: &[u8; FRAGMENT_ID_SIZE]) -> bool {
        self.contexts.remove(fragment_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn config() -> FragmentConfig {
        FragmentConfig { mtu: 500, max_concurrent_reassemblies: 64, reassembly_timeout: core::time::Duration::from_secs(30) }
    }

    #[test]
    fn small_payload_is_not_fragmented() {
        let fragments = MessageFragmenter::fragment(&[1, 2, 3], 0x04, &config(), &mut OsRng);
        assert!(fragments.is_empty());
    }

    #[test]
    fn fragment_and_reassemble_roundtrip() {
        let payload: Vec<u8> = (0u32..1500).map(|n| n as u8).collect();
        let fragments = MessageFragmenter::fragment(&payload, 0x04, &config(), &mut OsRng);
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].wire_type(), MessageType::FragmentStart);
        assert_eq!(fragments[1].wire_type(), MessageType::FragmentContinue);
        assert_eq!(fragments[2].wire_type(), MessageType::FragmentEnd);

        let mut reassembler = MessageReassembler::new(config());
        let mut result = None;
        for fragment in fragments {
            result = reassembler.process(fragment, Timestamp::new(0)).unwrap();
        }
        let (original_type, data) = result.unwrap();
        assert_eq!(original_type, 0x04);
        assert_eq!(data, payload);
    }

    #[test]
    fn duplicate_fragment_rejected() {
        let payload = alloc::vec![0u8; 1200];
        let fragments = MessageFragmenter::fragment(&payload, 0x04, &config(), &mut OsRng);
        let mut reassembler = MessageReassembler::new(config());
        reassembler.process(fragments[0].clone(), Timestamp::new(0)).unwrap();
        assert!(reassembler.process(fragments[0].clone(), Timestamp::new(0)).is_err());
    }

    #[test]
    fn expired_context_is_evicted() {
        let payload = alloc::vec![0u8; 1200];
        let fragments = MessageFragmenter::fragment(&payload, 0x04, &config(), &mut OsRng);
        let mut reassembler = MessageReassembler::new(config());
        reassembler.process(fragments[0].clone(), Timestamp::new(0)).unwrap();
        assert_eq!(reassembler.active_count(), 1);
        reassembler.evict_expired(Timestamp::new(31_000));
        assert_eq!(reassembler.active_count(), 0);
    }

    #[test]
    fn table_full_rejects_new_contexts() {
        let mut small_config = config();
        small_config.max_concurrent_reassemblies = 1;
        let mut reassembler = MessageReassembler::new(small_config);
        let payload = alloc::vec![0u8; 1200];

        let first = MessageFragmenter::fragment(&payload, 0x04, &config(), &mut OsRng);
        reassembler.process(first[0].clone(), Timestamp::new(0)).unwrap();

        let second = MessageFragmenter::fragment(&payload, 0x04, &config(), &mut OsRng);
        assert!(reassembler.process(second[0].clone(), Timestamp::new(0)).is_err());
    }
}
