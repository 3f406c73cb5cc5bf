//! Cross-module integration tests: a full handshake, an encrypted exchange,
//! relay dedup, and delivery tracking wired together the way a real
//! dispatcher would drive them.

use bitchat_core::channel_keys::{self, ChannelEpoch};
use bitchat_core::config::{ChannelConfig, RelayConfig};
use bitchat_core::delivery::DeliveryTracker;
use bitchat_core::fragmentation::{MessageFragmenter, MessageReassembler};
use bitchat_core::noise::{IdentityKeyPair, NoiseKeyPair, SessionTable};
use bitchat_core::packet::{MessageType, Packet};
use bitchat_core::relay::{dedup_key, relay_decision, RelayDecision, RelayDedupSet};
use bitchat_core::types::{Fingerprint, PeerId, SystemTimeSource, Ttl};
use rand_core::OsRng;
use uuid::Uuid;

fn relay_config() -> RelayConfig {
    RelayConfig {
        default_ttl: 7,
        dedup_capacity: 128,
        dedup_ttl: std::time::Duration::from_secs(600),
        store_forward_max_entries: 32,
        store_forward_max_bytes: 1 << 16,
        store_forward_retention: std::time::Duration::from_secs(12 * 3600),
    }
}

#[test]
fn noise_handshake_then_encrypted_message_round_trips() {
    let time_source = SystemTimeSource;
    let alice_id = PeerId::new([1; 8]);
    let bob_id = PeerId::new([2; 8]);

    let mut alice_sessions = SessionTable::new(NoiseKeyPair::generate(&mut OsRng), time_source);
    let mut bob_sessions = SessionTable::new(NoiseKeyPair::generate(&mut OsRng), time_source);

    let alice_session = alice_sessions.start_outbound(bob_id).unwrap();
    let msg1 = alice_session.create_handshake_message(&[], &time_source).unwrap();

    let bob_session = bob_sessions.start_inbound(alice_id).unwrap();
    bob_session.process_handshake_message(&msg1, &time_source).unwrap();
    let msg2 = bob_session.create_handshake_message(&[], &time_source).unwrap();

    let alice_session = alice_sessions.get_mut(&bob_id).unwrap();
    alice_session.process_handshake_message(&msg2, &time_source).unwrap();
    let msg3 = alice_session.create_handshake_message(&[], &time_source).unwrap();
    assert!(alice_session.is_established());

    let bob_session = bob_sessions.get_mut(&alice_id).unwrap();
    bob_session.process_handshake_message(&msg3, &time_source).unwrap();
    assert!(bob_session.is_established());

    let alice_session = alice_sessions.get_mut(&bob_id).unwrap();
    let ciphertext = alice_session.encrypt(b"hello bob", &time_source).unwrap();

    let bob_session = bob_sessions.get_mut(&alice_id).unwrap();
    let plaintext = bob_session.decrypt(&ciphertext, &time_source).unwrap();
    assert_eq!(plaintext, b"hello bob");
}

#[test]
fn signed_packet_fragments_and_reassembles_across_mtu() {
    let signing_key = IdentityKeyPair::generate(&mut OsRng);
    let sender = PeerId::new([3; 8]);

    let payload = vec![0xABu8; 2000];
    let mut packet = Packet::new(MessageType::Message, sender, payload.clone());
    packet.ttl = Ttl::new(7);
    packet.sign(|bytes| signing_key.sign(bytes));

    let frame = packet.encode(&mut OsRng);
    let config = bitchat_core::config::FragmentConfig { mtu: 400, max_concurrent_reassemblies: 8, reassembly_timeout: std::time::Duration::from_secs(30) };
    let fragments = MessageFragmenter::fragment(&frame, 0, &config, &mut OsRng);
    assert!(fragments.len() > 1);

    let mut reassembler = MessageReassembler::new(config);
    let mut result = None;
    for fragment in fragments {
        result = reassembler.process(fragment, bitchat_core::types::Timestamp::new(0)).unwrap();
    }
    let (_, reassembled) = result.unwrap();
    let decoded = Packet::decode(&reassembled).unwrap();
    assert_eq!(decoded.payload, payload);
    assert!(decoded.verify_signature(|bytes, sig| IdentityKeyPair::verify(&signing_key.public_key_bytes(), bytes, sig)));
}

#[test]
fn duplicate_relayed_packet_is_suppressed_but_original_is_forwarded() {
    let mut dedup = RelayDedupSet::new(&relay_config());
    let local = PeerId::new([4; 8]);
    let sender = PeerId::new([5; 8]);
    let now = bitchat_core::types::Timestamp::new(0);

    let key = dedup_key(MessageType::Message, sender, b"payload");
    assert!(!dedup.check_and_insert(key, now));
    assert!(dedup.check_and_insert(key, now));

    let decision = relay_decision(Some(PeerId::BROADCAST), local, Ttl::new(5));
    assert_eq!(decision, RelayDecision::Forward(Ttl::new(4)));
}

#[test]
fn channel_message_only_decrypts_for_current_epoch_holder() {
    let config = ChannelConfig { pbkdf2_iterations: 1000, max_epochs: 3 };
    let creator = Fingerprint::new([9u8; 32]);
    let epoch = ChannelEpoch::derive("#general", "correct horse", &creator, 0, None, &config, bitchat_core::types::Timestamp::new(0));

    let ciphertext = channel_keys::encrypt(&epoch, b"welcome", &mut OsRng).unwrap();
    let plaintext = channel_keys::decrypt(std::iter::once(&epoch), &ciphertext).unwrap();
    assert_eq!(plaintext, b"welcome");

    let wrong_epoch = ChannelEpoch::derive("#general", "wrong password", &creator, 0, None, &config, bitchat_core::types::Timestamp::new(0));
    assert!(channel_keys::decrypt(std::iter::once(&wrong_epoch), &ciphertext).is_err());
}

#[test]
fn delivery_tracker_transitions_from_sent_to_delivered_to_read() {
    let tracker_time = SystemTimeSource;
    let mut tracker = DeliveryTracker::new(tracker_time);
    let recipient = PeerId::new([6; 8]);
    let message_id = Uuid::new_v4();

    tracker.track_message(message_id, recipient, b"hi".to_vec());
    assert!(tracker.mark_sent(&message_id));
    assert!(tracker.confirm_delivery(&message_id, recipient));
    assert!(tracker.confirm_read(&message_id, recipient));

    let tracked = tracker.get_tracked(&message_id).unwrap();
    assert!(tracked.status.is_terminal());
}
