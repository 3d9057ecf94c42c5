//! End-to-end engine scenarios over the deterministic test ciphersuite
//! and the mock network: group creation, member addition with welcome
//! delivery, concurrent-commit tiebreaks, out-of-order commits, admin
//! gating, and the publish-then-acknowledge contract.

mod helpers;

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use helpers::{
    founded_group, group_relay, group_relay_events, inbox_events, inbox_relay, participant,
    published_key_package, Participant,
};
use marmot_core::codec::MlsMessage;
use marmot_core::event::{derive_conversation_key, parse_key_package_event};
use marmot_core::mls::provider::Ciphersuite;
use marmot_core::mls::{ClientState, GroupId};
use marmot_core::test_util::{MockNetwork, TestCiphersuite};
use marmot_core::{CommitOptions, Error, IngestOptions, ProcessResult, ProposalInput};
use nostr::nips::nip44::v2::{self, ConversationKey};
use nostr::{Event, EventBuilder, Keys, Kind, Tag, TagKind, Timestamp, UnsignedEvent};

/// Builds an encrypted kind-445 event with a controlled timestamp,
/// mirroring the production envelope byte-for-byte.
fn crafted_group_event(
    keys: &Keys,
    nostr_group_id: &[u8; 32],
    exporter_secret: &[u8; 32],
    message: &MlsMessage,
    created_at: u64,
) -> Event {
    let plaintext = message.encode().expect("message encodes");
    let key = derive_conversation_key(exporter_secret);
    let ciphertext =
        v2::encrypt_to_bytes(&ConversationKey::new(*key), &plaintext).expect("nip44 encrypts");

    EventBuilder::new(Kind::MlsGroupMessage, BASE64.encode(ciphertext))
        .tags([Tag::custom(TagKind::h(), [hex::encode(nostr_group_id)])])
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(keys)
        .expect("event signs")
}

fn exporter_for(state: &ClientState, epoch: u64) -> [u8; 32] {
    *TestCiphersuite
        .exporter_secret(state, epoch)
        .expect("exporter derives")
        .expect("exporter available")
}

async fn alice_with_group(network: &Arc<MockNetwork>) -> (Participant, GroupId) {
    let alice = participant(network).await;
    let group_id = founded_group(&alice, "test").await;
    (alice, group_id)
}

/// S1: founder adds a member; epoch advances, the commit lands on the
/// group relay, the welcome lands gift-wrapped on the member's inbox
/// relay, and the member joins at the same epoch.
#[tokio::test]
async fn two_member_group_happy_path() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;
    let bob = participant(&network).await;

    let bob_kp_event = published_key_package(&bob).await;
    network.set_inbox_relays(bob.keys.public_key(), vec![inbox_relay()]);
    network.clear();

    let group = alice.client.get_group(&group_id).await.unwrap();
    let mut group = group.lock().await;
    assert_eq!(group.epoch(), 0);

    let bob_kp = parse_key_package_event(&bob_kp_event).unwrap();
    let response = group
        .commit(CommitOptions {
            extra_proposals: vec![ProposalInput::add_member(bob_kp)],
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(group.epoch(), 1);
    assert!(response.commit.is_success());
    assert_eq!(response.welcomes.len(), 1);
    assert_eq!(response.welcomes[0].recipient, bob.keys.public_key());
    assert!(response.welcomes[0].result.is_ok());

    let commits = group_relay_events(&network);
    assert_eq!(commits.len(), 1, "exactly one group event on the relay");
    assert_eq!(commits[0].kind, Kind::MlsGroupMessage);

    let wraps = inbox_events(&network);
    assert_eq!(wraps.len(), 1, "exactly one gift wrap on the inbox relay");
    assert_eq!(wraps[0].kind, Kind::GiftWrap);

    // Bob unwraps the welcome and joins.
    let (inviter, rumor) = bob
        .client
        .unwrap_welcome(&bob.keys, &wraps[0])
        .await
        .unwrap();
    assert_eq!(inviter, alice.keys.public_key());

    let joined_id = bob.client.join_group_from_welcome(&rumor).await.unwrap();
    assert_eq!(joined_id, group_id);

    let bob_group = bob.client.get_group(&joined_id).await.unwrap();
    let mut bob_group = bob_group.lock().await;
    assert_eq!(bob_group.epoch(), 1);
    assert_eq!(bob_group.members().len(), 2);
    assert!(bob_group.members().contains(&alice.keys.public_key()));
    assert!(bob_group.members().contains(&bob.keys.public_key()));

    // The commit event is stale from Bob's perspective; ingest drops it
    // without losing the epoch.
    let results = bob_group
        .ingest(commits, IngestOptions::default())
        .collect()
        .await
        .unwrap();
    assert!(results.is_empty());
    assert_eq!(bob_group.epoch(), 1);
}

/// The proposal path: propose publishes without touching local state,
/// the proposal returns through ingest into the pending set, and a
/// commit by ref applies it.
#[tokio::test]
async fn propose_ingest_commit_by_ref() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;
    let bob = participant(&network).await;

    let bob_kp_event = published_key_package(&bob).await;
    network.set_inbox_relays(bob.keys.public_key(), vec![inbox_relay()]);
    network.clear();

    let group = alice.client.get_group(&group_id).await.unwrap();
    let mut group = group.lock().await;

    let bob_kp = parse_key_package_event(&bob_kp_event).unwrap();
    let responses = group
        .propose(ProposalInput::add_member(bob_kp))
        .await
        .unwrap();
    assert_eq!(responses.len(), 1);

    // No local mutation: the proposal is not pending until it returns
    // through ingest.
    assert_eq!(group.epoch(), 0);
    assert!(group.state().unapplied_proposals.is_empty());
    assert!(!group.is_dirty());

    let events = group_relay_events(&network);
    assert_eq!(events.len(), 1);
    let results = group
        .ingest(events, IngestOptions::default())
        .collect()
        .await
        .unwrap();

    let proposal_ref = match &results[..] {
        [ProcessResult::Proposal {
            proposal_ref: Some(r),
            ..
        }] => r.clone(),
        other => panic!("expected one staged proposal, got {other:?}"),
    };
    assert_eq!(group.state().unapplied_proposals.len(), 1);
    assert_eq!(group.epoch(), 0);

    network.clear();
    let response = group
        .commit(CommitOptions {
            proposal_refs: vec![proposal_ref],
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(group.epoch(), 1);
    assert_eq!(group.members().len(), 2);
    assert_eq!(response.welcomes.len(), 1);
    assert!(group.state().unapplied_proposals.is_empty());
}

#[tokio::test]
async fn commit_with_unknown_ref_fails() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;

    let group = alice.client.get_group(&group_id).await.unwrap();
    let mut group = group.lock().await;

    let err = group
        .commit(CommitOptions {
            proposal_refs: vec!["00ff".to_string()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProposalRefNotFound(r) if r == "00ff"));
    assert_eq!(group.epoch(), 0);
}

/// S2: two admins commit at the same epoch with the same timestamp;
/// every member advances through the lexicographically smaller event id
/// and discards the other.
#[tokio::test]
async fn concurrent_commits_tiebreak_deterministically() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;
    let bob = participant(&network).await;
    let carol = participant(&network).await;

    let bob_kp = parse_key_package_event(&published_key_package(&bob).await).unwrap();
    let carol_kp = parse_key_package_event(&published_key_package(&carol).await).unwrap();

    let group = alice.client.get_group(&group_id).await.unwrap();
    let mut group = group.lock().await;
    let state = group.state().clone();
    let nostr_group_id = *group.nostr_group_id();

    // Two divergent commits built on the same epoch-0 state.
    let commit_add_bob = TestCiphersuite
        .create_commit(&state, &[marmot_core::codec::Proposal::Add { key_package: bob_kp }])
        .unwrap();
    let commit_add_carol = TestCiphersuite
        .create_commit(
            &state,
            &[marmot_core::codec::Proposal::Add { key_package: carol_kp }],
        )
        .unwrap();

    let exporter = exporter_for(&state, 1);
    let created_at = 1_000_000;
    let event_bob = crafted_group_event(
        &alice.keys,
        &nostr_group_id,
        &exporter,
        &commit_add_bob.commit,
        created_at,
    );
    let event_carol = crafted_group_event(
        &alice.keys,
        &nostr_group_id,
        &exporter,
        &commit_add_carol.commit,
        created_at,
    );

    let winner_adds_bob = event_bob.id.to_hex() < event_carol.id.to_hex();

    // Deliver in "wrong" order on purpose; the sort must not care.
    let results = group
        .ingest(
            vec![event_carol.clone(), event_bob.clone()],
            IngestOptions::default(),
        )
        .collect()
        .await
        .unwrap();

    assert_eq!(group.epoch(), 1, "exactly one commit advanced the epoch");
    let applied: Vec<_> = results
        .iter()
        .filter(|r| matches!(r, ProcessResult::Commit { .. }))
        .collect();
    assert_eq!(applied.len(), 1);

    let members = group.members();
    assert_eq!(members.len(), 2);
    if winner_adds_bob {
        assert!(members.contains(&bob.keys.public_key()));
        assert!(!members.contains(&carol.keys.public_key()));
    } else {
        assert!(members.contains(&carol.keys.public_key()));
        assert!(!members.contains(&bob.keys.public_key()));
    }
}

/// S3: a batch carrying commits for two future epochs in reverse order
/// still lands on the furthest epoch, applying the earlier commit first.
#[tokio::test]
async fn out_of_order_commits_converge() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;
    let bob = participant(&network).await;
    let carol = participant(&network).await;

    let bob_kp = parse_key_package_event(&published_key_package(&bob).await).unwrap();
    let carol_kp = parse_key_package_event(&published_key_package(&carol).await).unwrap();

    let group = alice.client.get_group(&group_id).await.unwrap();
    let mut group = group.lock().await;
    let state0 = group.state().clone();
    let nostr_group_id = *group.nostr_group_id();

    let commit1 = TestCiphersuite
        .create_commit(&state0, &[marmot_core::codec::Proposal::Add { key_package: bob_kp }])
        .unwrap();
    let commit2 = TestCiphersuite
        .create_commit(
            &commit1.new_state,
            &[marmot_core::codec::Proposal::Add { key_package: carol_kp }],
        )
        .unwrap();

    let event1 = crafted_group_event(
        &alice.keys,
        &nostr_group_id,
        &exporter_for(&commit1.new_state, 1),
        &commit1.commit,
        1_000_100,
    );
    let event2 = crafted_group_event(
        &alice.keys,
        &nostr_group_id,
        &exporter_for(&commit2.new_state, 2),
        &commit2.commit,
        1_000_200,
    );

    // Later commit delivered first.
    let results = group
        .ingest(vec![event2, event1], IngestOptions::default())
        .collect()
        .await
        .unwrap();

    assert_eq!(group.epoch(), 2);
    let applied_epochs: Vec<u64> = results
        .iter()
        .filter_map(|r| match r {
            ProcessResult::Commit { epoch, .. } => Some(*epoch),
            _ => None,
        })
        .collect();
    assert_eq!(applied_epochs, vec![1, 2], "earlier commit applied first");
    assert_eq!(group.members().len(), 3);
}

/// S4: a member outside the admin set cannot commit; nothing reaches
/// the network and state is untouched.
#[tokio::test]
async fn non_admin_commit_is_rejected() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;
    let bob = participant(&network).await;

    let bob_kp_event = published_key_package(&bob).await;
    network.set_inbox_relays(bob.keys.public_key(), vec![inbox_relay()]);

    {
        let group = alice.client.get_group(&group_id).await.unwrap();
        let mut group = group.lock().await;
        let bob_kp = parse_key_package_event(&bob_kp_event).unwrap();
        group
            .commit(CommitOptions {
                extra_proposals: vec![ProposalInput::add_member(bob_kp)],
                ..Default::default()
            })
            .await
            .unwrap();
    }

    // Bob joins, then tries to remove Alice without admin rights.
    let wraps = inbox_events(&network);
    let (_, rumor) = bob
        .client
        .unwrap_welcome(&bob.keys, &wraps[0])
        .await
        .unwrap();
    bob.client.join_group_from_welcome(&rumor).await.unwrap();

    let bob_group = bob.client.get_group(&group_id).await.unwrap();
    let mut bob_group = bob_group.lock().await;
    let epoch_before = bob_group.epoch();
    network.clear();

    let err = bob_group
        .commit(CommitOptions {
            extra_proposals: vec![ProposalInput::remove_member(alice.keys.public_key())],
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotAdmin));
    assert_eq!(bob_group.epoch(), epoch_before);
    assert!(network.published().is_empty(), "no network publish");
}

/// S5: when zero relays acknowledge, the commit fails and local state
/// does not advance.
#[tokio::test]
async fn commit_without_acks_leaves_state_unchanged() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;
    let bob = participant(&network).await;
    let bob_kp = parse_key_package_event(&published_key_package(&bob).await).unwrap();

    let group = alice.client.get_group(&group_id).await.unwrap();
    let mut group = group.lock().await;

    network.set_ack(false);
    let err = group
        .commit(CommitOptions {
            extra_proposals: vec![ProposalInput::add_member(bob_kp)],
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoRelayReceivedEvent(_)));
    assert_eq!(group.epoch(), 0);
    assert!(!group.is_dirty());
    assert_eq!(group.members().len(), 1);
}

/// Welcome delivery failure is reported but never rolls back the epoch.
#[tokio::test]
async fn welcome_failure_does_not_roll_back_commit() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;
    let bob = participant(&network).await;
    let bob_kp = parse_key_package_event(&published_key_package(&bob).await).unwrap();

    // No inbox relays registered for Bob: welcome delivery must fail.
    let group = alice.client.get_group(&group_id).await.unwrap();
    let mut group = group.lock().await;

    let response = group
        .commit(CommitOptions {
            extra_proposals: vec![ProposalInput::add_member(bob_kp)],
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(group.epoch(), 1, "commit is authoritative locally");
    assert_eq!(response.welcomes.len(), 1);
    assert!(response.welcomes[0].result.is_err());
}

/// Application messages round-trip between members.
#[tokio::test]
async fn application_rumor_roundtrip() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;
    let bob = participant(&network).await;

    let bob_kp_event = published_key_package(&bob).await;
    network.set_inbox_relays(bob.keys.public_key(), vec![inbox_relay()]);

    {
        let group = alice.client.get_group(&group_id).await.unwrap();
        let mut group = group.lock().await;
        let bob_kp = parse_key_package_event(&bob_kp_event).unwrap();
        group
            .commit(CommitOptions {
                extra_proposals: vec![ProposalInput::add_member(bob_kp)],
                ..Default::default()
            })
            .await
            .unwrap();
    }
    let wraps = inbox_events(&network);
    let (_, rumor) = bob
        .client
        .unwrap_welcome(&bob.keys, &wraps[0])
        .await
        .unwrap();
    bob.client.join_group_from_welcome(&rumor).await.unwrap();

    network.clear();

    let chat = UnsignedEvent::new(
        alice.keys.public_key(),
        Timestamp::now(),
        Kind::Custom(9),
        Vec::new(),
        "hello bob",
    );
    {
        let group = alice.client.get_group(&group_id).await.unwrap();
        let mut group = group.lock().await;
        let result = group.send_application_rumor(chat).await.unwrap();
        assert!(result.is_success());
    }

    let events = group_relay_events(&network);
    assert_eq!(events.len(), 1);

    let bob_group = bob.client.get_group(&group_id).await.unwrap();
    let mut bob_group = bob_group.lock().await;
    let results = bob_group
        .ingest(events, IngestOptions::default())
        .collect()
        .await
        .unwrap();

    match &results[..] {
        [ProcessResult::ApplicationMessage { rumor, .. }] => {
            assert_eq!(rumor.content, "hello bob");
            assert_eq!(rumor.pubkey, alice.keys.public_key());
        }
        other => panic!("expected one application message, got {other:?}"),
    }
    assert_eq!(bob_group.epoch(), 1, "application traffic keeps the epoch");
}

/// Ingest is a lazy sequence: the first application message is
/// observable before the rest of the batch is processed, and dropping
/// the run at a yield boundary cancels the remainder.
#[tokio::test]
async fn ingest_yields_lazily_and_supports_early_stop() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;
    let bob = participant(&network).await;

    let bob_kp_event = published_key_package(&bob).await;
    network.set_inbox_relays(bob.keys.public_key(), vec![inbox_relay()]);

    {
        let group = alice.client.get_group(&group_id).await.unwrap();
        let mut group = group.lock().await;
        let bob_kp = parse_key_package_event(&bob_kp_event).unwrap();
        group
            .commit(CommitOptions {
                extra_proposals: vec![ProposalInput::add_member(bob_kp)],
                ..Default::default()
            })
            .await
            .unwrap();
    }
    let wraps = inbox_events(&network);
    let (_, rumor) = bob
        .client
        .unwrap_welcome(&bob.keys, &wraps[0])
        .await
        .unwrap();
    bob.client.join_group_from_welcome(&rumor).await.unwrap();

    network.clear();

    {
        let group = alice.client.get_group(&group_id).await.unwrap();
        let mut group = group.lock().await;
        for text in ["first", "second"] {
            let chat = UnsignedEvent::new(
                alice.keys.public_key(),
                Timestamp::now(),
                Kind::Custom(9),
                Vec::new(),
                text,
            );
            group.send_application_rumor(chat).await.unwrap();
        }
    }

    let events = group_relay_events(&network);
    assert_eq!(events.len(), 2);

    let bob_group = bob.client.get_group(&group_id).await.unwrap();
    let mut bob_group = bob_group.lock().await;

    // Pull exactly one result, then stop at the yield boundary.
    let mut run = bob_group.ingest(events.clone(), IngestOptions::default());
    let first = run.next().await.unwrap().expect("a first result");
    match first {
        ProcessResult::ApplicationMessage { rumor, .. } => {
            assert_eq!(rumor.content, "first");
        }
        other => panic!("expected an application message, got {other:?}"),
    }
    drop(run);

    // The abandoned remainder is still ingestible afterwards.
    let rest = bob_group
        .ingest(events, IngestOptions::default())
        .collect()
        .await
        .unwrap();
    assert_eq!(rest.len(), 2);
    assert_eq!(bob_group.epoch(), 1);
}

/// Property 8: re-ingesting an already-applied batch changes nothing.
#[tokio::test]
async fn ingest_is_idempotent() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;
    let bob = participant(&network).await;
    let bob_kp = parse_key_package_event(&published_key_package(&bob).await).unwrap();
    network.set_inbox_relays(bob.keys.public_key(), vec![inbox_relay()]);
    network.clear();

    let group = alice.client.get_group(&group_id).await.unwrap();
    let mut group = group.lock().await;
    group
        .commit(CommitOptions {
            extra_proposals: vec![ProposalInput::add_member(bob_kp)],
            ..Default::default()
        })
        .await
        .unwrap();

    let batch = group_relay_events(&network);
    let first = group
        .ingest(batch.clone(), IngestOptions::default())
        .collect()
        .await
        .unwrap();
    let epoch_after_first = group.epoch();
    let members_after_first = group.members();

    let second = group
        .ingest(batch, IngestOptions::default())
        .collect()
        .await
        .unwrap();

    // The own commit is stale in both passes; neither run may move state.
    assert!(first
        .iter()
        .all(|r| !matches!(r, ProcessResult::Commit { .. })));
    assert!(second
        .iter()
        .all(|r| !matches!(r, ProcessResult::Commit { .. })));
    assert_eq!(group.epoch(), epoch_after_first);
    assert_eq!(group.members(), members_after_first);
}

/// Undecryptable traffic exhausts the retry budget instead of looping.
#[tokio::test]
async fn garbage_exhausts_retry_budget() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;

    let group = alice.client.get_group(&group_id).await.unwrap();
    let mut group = group.lock().await;
    let nostr_group_id = *group.nostr_group_id();

    let garbage = EventBuilder::new(Kind::MlsGroupMessage, BASE64.encode([0u8; 64]))
        .tags([Tag::custom(TagKind::h(), [hex::encode(nostr_group_id)])])
        .sign_with_keys(&alice.keys)
        .unwrap();

    let err = group
        .ingest(vec![garbage], IngestOptions { max_retries: 3 })
        .collect()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MaxRetriesExceeded(3)));
    assert_eq!(group.epoch(), 0);
}

/// Traffic tagged for another group is ignored, not retried.
#[tokio::test]
async fn foreign_group_events_are_skipped() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;

    let group = alice.client.get_group(&group_id).await.unwrap();
    let mut group = group.lock().await;

    let foreign = EventBuilder::new(Kind::MlsGroupMessage, BASE64.encode([0u8; 64]))
        .tags([Tag::custom(TagKind::h(), [hex::encode([0x99u8; 32])])])
        .sign_with_keys(&alice.keys)
        .unwrap();

    let results = group
        .ingest(vec![foreign], IngestOptions::default())
        .collect()
        .await
        .unwrap();
    assert!(results.is_empty());
    assert_eq!(group.epoch(), 0);
}

/// The facade hands out one engine instance per group id.
#[tokio::test]
async fn facade_caches_single_engine_per_group() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;

    let a = alice.client.get_group(&group_id).await.unwrap();
    let b = alice.client.get_group(&group_id).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    alice.client.remove_group(&group_id).await.unwrap();
    assert!(matches!(
        alice.client.get_group(&group_id).await.unwrap_err(),
        Error::GroupNotFound
    ));
}

/// Group state survives a reload through the store between operations.
#[tokio::test]
async fn state_persists_across_reload() {
    let network = Arc::new(MockNetwork::new());
    let (alice, group_id) = alice_with_group(&network).await;
    let bob = participant(&network).await;
    let bob_kp = parse_key_package_event(&published_key_package(&bob).await).unwrap();
    network.set_inbox_relays(bob.keys.public_key(), vec![inbox_relay()]);

    {
        let group = alice.client.get_group(&group_id).await.unwrap();
        let mut group = group.lock().await;
        group
            .commit(CommitOptions {
                extra_proposals: vec![ProposalInput::add_member(bob_kp)],
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let stored = alice
        .client
        .group_store()
        .get(&group_id.to_hex())
        .await
        .unwrap()
        .expect("state persisted");
    assert_eq!(stored.epoch, 1);
    assert_eq!(stored.member_count(), 2);

    let relays = stored.group_data().unwrap().relays;
    assert_eq!(relays, vec![group_relay()]);
}
