//! Control plane: version negotiation and channel metadata (§4.8)

use alloc::string::String;
use alloc::vec::Vec;

use crate::types::{Fingerprint, PeerId, Timestamp};

#[derive(Debug, Clone)]
pub struct VersionHello {
    pub supported_versions: Vec<u8>,
    pub preferred_version: u8,
    pub client_version: String,
    pub platform: String,
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct VersionAck {
    pub agreed_version: Option<u8>,
    pub server_version: String,
    pub platform: String,
    pub capabilities: Option<Vec<String>>,
    pub rejected: bool,
    pub reason: Option<String>,
}

/// `negotiate = max(client_set ∩ server_set)`; empty intersection rejects.
pub fn negotiate(client: &[u8], server: &[u8]) -> Option<u8> {
    client.iter().filter(|v| server.contains(v)).max().copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    None,
    HelloSent,
    AckReceived(u8),
    Failed,
}

/// One per peer: drives version negotiation before the Noise handshake starts.
pub struct NegotiationSession {
    state: NegotiationState,
    started_at: Option<Timestamp>,
}

impl NegotiationSession {
    pub fn new() -> Self {
        Self { state: NegotiationState::None, started_at: None }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn send_hello(&mut self, now: Timestamp) {
        self.state = NegotiationState::HelloSent;
        self.started_at = Some(now);
    }

    pub fn receive_ack(&mut self, ack: &VersionAck) {
        self.state = if ack.rejected {
            NegotiationState::Failed
        } else {
            match ack.agreed_version {
                Some(v) => NegotiationState::AckReceived(v),
                None => NegotiationState::Failed,
            }
        };
    }

    /// Whether the negotiation attempt has exceeded `timeout` without an ack.
    pub fn timed_out(&self, now: Timestamp, timeout: core::time::Duration) -> bool {
        matches!(self.state, NegotiationState::HelloSent)
            && self.started_at.is_some_and(|start| now.duration_since(start) >= timeout)
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, NegotiationState::AckReceived(_))
    }
}

impl Default for NegotiationSession {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ChannelMetadata {
    pub channel: String,
    pub creator_id: PeerId,
    pub creator_fingerprint: Fingerprint,
    pub created_at: Timestamp,
    pub is_password_protected: bool,
    pub key_commitment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_picks_highest_shared_version() {
        assert_eq!(negotiate(&[1, 2, 3], &[2, 3, 4]), Some(3));
        assert_eq!(negotiate(&[1], &[2]), None);
    }

    #[test]
    fn session_transitions_through_states() {
        let mut session = NegotiationSession::new();
        assert_eq!(session.state(), NegotiationState::None);
        session.send_hello(Timestamp::new(0));
        assert_eq!(session.state(), NegotiationState::HelloSent);
        session.receive_ack(&VersionAck {
            agreed_version: Some(1),
            server_version: "1.0".into(),
            platform: "test".into(),
            capabilities: None,
            rejected: false,
            reason: None,
        });
        assert!(session.is_established());
    }

    #[test]
    fn rejected_ack_fails_negotiation() {
        let mut session = NegotiationSession::new();
        session.send_hello(Timestamp::new(0));
        session.receive_ack(&VersionAck {
            agreed_version: None,
            server_version: "1.0".into(),
            platform: "test".into(),
            capabilities: None,
            rejected: true,
            reason: Some("no overlap".into()),
        });
        assert_eq!(session.state(), NegotiationState::Failed);
    }

    #[test]
    fn negotiation_times_out() {
        let mut session = NegotiationSession::new();
        session.send_hello(Timestamp::new(0));
        assert!(session.timed_out(Timestamp::new(6000), core::time::Duration::from_secs(5)));
    }
}
