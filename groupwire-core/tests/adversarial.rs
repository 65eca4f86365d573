//! Garbage, forged and replayed input must never change group state

mod common;

use common::{device, next_event, Network};
use groupwire_core::core_mls::traits::{SnapshotKey, StateSnapshotStore};
use groupwire_core::core_relay::{MessageId, OutboundEvent, Topic};
use groupwire_core::core_session::{CommitOutcome, GroupEnvelope, SessionError, SessionEvent};
use groupwire_core::Identity;

#[tokio::test]
async fn test_garbage_commit_leaves_state_and_snapshot_untouched() {
    let network = Network::new(&["wss://a.test"]).await;
    let alice = device(&network).await;
    let group_id = alice.session.create_group("Test").await.unwrap();

    let state_before = alice.session.group_state(&group_id).await.unwrap();
    let key = SnapshotKey::Group(group_id.clone());
    let snapshot_before = alice.store.load(&key).await.unwrap();

    let garbage = [0xffu8; 48];
    let err = alice
        .session
        .process_incoming_commit(&group_id, &garbage, &MessageId::new("garbage-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::CryptoRejected(_)));

    assert_eq!(alice.session.group_state(&group_id).await.unwrap(), state_before);
    assert_eq!(alice.store.load(&key).await.unwrap(), snapshot_before);

    // The rejected id is remembered
    let outcome = alice
        .session
        .process_incoming_commit(&group_id, &garbage, &MessageId::new("garbage-1"))
        .await
        .unwrap();
    assert_eq!(outcome, CommitOutcome::Duplicate);
}

#[tokio::test]
async fn test_garbage_welcome_creates_nothing() {
    let network = Network::new(&["wss://a.test"]).await;
    let bob = device(&network).await;

    let err = bob
        .session
        .process_incoming_welcome(b"definitely not a welcome", &MessageId::new("w-1"))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::CryptoRejected(_)));
    assert!(bob.session.pending_invites().await.is_empty());
    assert!(bob.session.list_groups().await.is_empty());
    assert!(bob.store.list_groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_forged_commit_from_relay_is_reported() {
    let network = Network::new(&["wss://a.test"]).await;
    let alice = device(&network).await;
    let group_id = alice.session.create_group("Test").await.unwrap();
    let state_before = alice.session.group_state(&group_id).await.unwrap();
    let mut events = alice.session.subscribe_events();

    // Well-formed envelope at the current epoch, payload from a non-member
    let mallory = Identity::generate();
    let envelope = GroupEnvelope::Commit {
        epoch: 0,
        payload: vec![0x01; 96],
    };
    let forged = OutboundEvent::new(
        Topic::Group {
            group_id: group_id.clone(),
        },
        mallory.public_key(),
        envelope.encode().unwrap(),
    );
    network.relays.inject(&network.urls[0], &forged).await;

    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Error { .. })).await;
    assert_eq!(event.group_id(), Some(&group_id));
    assert_eq!(alice.session.group_state(&group_id).await.unwrap(), state_before);
}

#[tokio::test]
async fn test_malformed_envelope_is_reported() {
    let network = Network::new(&["wss://a.test"]).await;
    let alice = device(&network).await;
    let group_id = alice.session.create_group("Test").await.unwrap();
    let mut events = alice.session.subscribe_events();

    let junk = OutboundEvent::new(
        Topic::Group {
            group_id: group_id.clone(),
        },
        Identity::generate().public_key(),
        vec![0xde, 0xad],
    );
    network.relays.inject(&network.urls[0], &junk).await;

    match next_event(&mut events, |e| matches!(e, SessionEvent::Error { .. })).await {
        SessionEvent::Error { message, .. } => assert!(message.contains("envelope")),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(alice.session.group_info(&group_id).await.unwrap().epoch, 0);
}

#[tokio::test]
async fn test_commit_seen_on_two_relays_is_applied_once() {
    let network = Network::new(&["wss://a.test", "wss://b.test"]).await;
    let alice = device(&network).await;
    let bob = device(&network).await;
    let mut bob_events = bob.session.subscribe_events();

    let group_id = alice.session.create_group("Test").await.unwrap();
    alice
        .session
        .invite_member(&group_id, &bob.public_key().to_hex())
        .await
        .unwrap();
    let invite = match next_event(&mut bob_events, |e| matches!(e, SessionEvent::InviteReceived(_))).await {
        SessionEvent::InviteReceived(invite) => invite,
        other => panic!("unexpected event {:?}", other),
    };
    bob.session.accept_invite(&invite.id).await.unwrap();

    alice.session.update_keys(&group_id).await.unwrap();
    let event = next_event(&mut bob_events, |e| matches!(e, SessionEvent::EpochAdvanced { .. })).await;
    assert_eq!(event, SessionEvent::EpochAdvanced { group_id: group_id.clone(), epoch: 2 });

    // Both relays delivered the commit; the copy must not advance anything
    alice.session.send_message(&group_id, b"marker").await.unwrap();
    next_event(&mut bob_events, |e| matches!(e, SessionEvent::MessageReceived { .. })).await;
    assert_eq!(bob.session.group_info(&group_id).await.unwrap().epoch, 2);
}
