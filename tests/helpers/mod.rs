//! Reusable helpers for the engine integration tests.
//!
//! These helpers run the full engine against the deterministic test
//! ciphersuite and the in-memory mock network. Each participant gets its
//! own client, stores, and keys; the mock network is shared so one
//! party's published events can be fed into another party's ingest.

#![allow(dead_code)] // Not every integration test uses every helper.

use std::sync::Arc;

use marmot_core::mls::provider::CiphersuiteRegistry;
use marmot_core::mls::GroupId;
use marmot_core::store::MemoryBackend;
use marmot_core::test_util::{MockNetwork, TestCiphersuite};
use marmot_core::{CreateGroupOptions, MarmotClient, PublishKeyPackageOptions};
use nostr::signer::NostrSigner;
use nostr::{Event, Keys, RelayUrl};

/// The relay every test group publishes on.
pub const GROUP_RELAY: &str = "wss://r1.test";

/// The relay welcomes are delivered to.
pub const INBOX_RELAY: &str = "wss://inbox.test";

/// One test participant: identity keys plus a full client.
pub struct Participant {
    pub keys: Keys,
    pub client: MarmotClient,
}

/// Registry holding only the deterministic test suite.
pub fn test_registry() -> CiphersuiteRegistry {
    CiphersuiteRegistry::with_suites(vec![Arc::new(TestCiphersuite)])
}

/// Parses the shared group relay URL.
pub fn group_relay() -> RelayUrl {
    RelayUrl::parse(GROUP_RELAY).expect("valid test relay url")
}

/// Parses the shared inbox relay URL.
pub fn inbox_relay() -> RelayUrl {
    RelayUrl::parse(INBOX_RELAY).expect("valid test relay url")
}

/// Builds a participant wired to the shared mock network.
pub async fn participant(network: &Arc<MockNetwork>) -> Participant {
    let keys = Keys::generate();
    let signer: Arc<dyn NostrSigner> = Arc::new(keys.clone());
    let client = MarmotClient::new(
        signer,
        Arc::clone(network) as Arc<dyn marmot_core::network::NetworkInterface>,
        Arc::new(MemoryBackend::new()),
        test_registry(),
    )
    .await
    .expect("client builds");
    Participant { keys, client }
}

/// Publishes a key package for `who` and returns the kind-443 event.
pub async fn published_key_package(who: &Participant) -> Event {
    who.client
        .publish_key_package(PublishKeyPackageOptions {
            relays: vec![group_relay()],
            client: Some("marmot-core-tests".to_string()),
            ..Default::default()
        })
        .await
        .expect("key package publishes")
}

/// Creates a group founded (and administered) by `founder`.
pub async fn founded_group(founder: &Participant, name: &str) -> GroupId {
    founder
        .client
        .create_group(
            name,
            CreateGroupOptions {
                description: "integration test group".to_string(),
                relays: vec![group_relay()],
                ..Default::default()
            },
        )
        .await
        .expect("group creates")
}

/// Events the mock network saw on the group relay since the last clear,
/// oldest first.
pub fn group_relay_events(network: &MockNetwork) -> Vec<Event> {
    network.events_on(&group_relay())
}

/// Events delivered to the inbox relay (gift-wrapped welcomes).
pub fn inbox_events(network: &MockNetwork) -> Vec<Event> {
    network.events_on(&inbox_relay())
}
