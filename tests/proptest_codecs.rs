//! Property-based tests for the wire codecs.
//!
//! These verify the invariants any valid input must satisfy: group data
//! and client state survive a round trip unchanged, decode of an encoded
//! value re-encodes to the identical bytes, and truncation never panics.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use marmot_core::codec::{
    decode_client_state, encode_client_state, Commit, ContentBody, FramedContent, MlsMessage,
    NostrGroupData, Proposal,
};
use marmot_core::credential::Credential;
use marmot_core::mls::{ClientState, ExporterSecret, GroupId, RatchetNode};
use nostr::{Keys, PublicKey, RelayUrl};
use proptest::prelude::*;

/// Pool of valid pubkeys; generating curve points inside proptest
/// strategies is wasteful, so strategies index into this pool.
fn pubkey_pool() -> &'static Vec<PublicKey> {
    static POOL: OnceLock<Vec<PublicKey>> = OnceLock::new();
    POOL.get_or_init(|| (0..8).map(|_| Keys::generate().public_key()).collect())
}

fn text_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 🐹äöü]{0,64}"
}

fn admins_strategy() -> impl Strategy<Value = Vec<PublicKey>> {
    prop::collection::vec(0usize..8, 1..4)
        .prop_map(|idx| idx.into_iter().map(|i| pubkey_pool()[i]).collect())
}

fn relays_strategy() -> impl Strategy<Value = Vec<RelayUrl>> {
    prop::collection::vec("[a-z]{1,12}", 0..4).prop_map(|hosts| {
        hosts
            .into_iter()
            .map(|h| RelayUrl::parse(&format!("wss://{h}.example.com")).unwrap())
            .collect()
    })
}

fn group_data_strategy() -> impl Strategy<Value = NostrGroupData> {
    (
        text_strategy(),
        text_strategy(),
        admins_strategy(),
        relays_strategy(),
        prop::array::uniform32(any::<u8>()),
        prop::array::uniform32(any::<u8>()),
    )
        .prop_map(|(name, description, admins, relays, image_hash, image_key)| {
            let mut data = NostrGroupData::new(name, description, admins, relays);
            data.image_hash = image_hash;
            data.image_key = image_key;
            data
        })
}

fn state_strategy() -> impl Strategy<Value = ClientState> {
    (
        prop::array::uniform32(any::<u8>()),
        any::<u64>(),
        prop::collection::vec(prop::option::of(prop::array::uniform32(any::<u8>())), 1..6),
        prop::collection::vec((any::<u64>(), prop::array::uniform32(any::<u8>())), 0..4),
        prop::collection::vec(any::<u32>(), 0..3),
        group_data_strategy(),
    )
        .prop_map(
            |(group_id, epoch, leaves, secrets, removals, group_data)| {
                let ratchet_tree = leaves
                    .into_iter()
                    .enumerate()
                    .map(|(i, slot)| {
                        slot.map(|key| RatchetNode {
                            encryption_key: key.to_vec(),
                            signature_key: (i % 2 == 0).then(|| vec![i as u8; 32]),
                            credential: (i % 2 == 0)
                                .then(|| Credential::new(&pubkey_pool()[i % 8])),
                        })
                    })
                    .collect();

                let unapplied_proposals: BTreeMap<String, Proposal> = removals
                    .into_iter()
                    .enumerate()
                    .map(|(i, removed)| (format!("{i:02x}ref"), Proposal::Remove { removed }))
                    .collect();

                let mut state = ClientState {
                    group_id: GroupId::from_slice(&group_id),
                    epoch,
                    ciphersuite: 1,
                    extensions: vec![],
                    ratchet_tree,
                    own_leaf_index: 0,
                    init_secret: vec![3; 32],
                    exporter_secrets: secrets
                        .into_iter()
                        .map(|(e, s)| (e, ExporterSecret(s)))
                        .collect(),
                    unapplied_proposals,
                };
                state.set_group_data(&group_data).unwrap();
                state
            },
        )
}

proptest! {
    /// decode(encode(d)) == d for every valid group data value.
    #[test]
    fn group_data_roundtrip(data in group_data_strategy()) {
        let bytes = data.encode().unwrap();
        let decoded = NostrGroupData::decode(&bytes).unwrap();
        prop_assert_eq!(data, decoded);
    }

    /// encode(decode(bytes)) == bytes for every well-formed encoding.
    #[test]
    fn group_data_reencode_is_identity(data in group_data_strategy()) {
        let bytes = data.encode().unwrap();
        let reencoded = NostrGroupData::decode(&bytes).unwrap().encode().unwrap();
        prop_assert_eq!(bytes, reencoded);
    }

    /// Admin entries decode as a set regardless of wire order: a peer
    /// serializing its admins in insertion order must interoperate.
    #[test]
    fn group_data_admins_decode_in_any_order(data in group_data_strategy()) {
        let mut bytes = data.encode().unwrap();

        let admins_at = 2 + 32 + 2 + data.name.len() + 2 + data.description.len();
        let len = u16::from_be_bytes([bytes[admins_at], bytes[admins_at + 1]]) as usize;
        let region = &mut bytes[admins_at + 2..admins_at + 2 + len];

        let mut entries: Vec<[u8; 32]> = region
            .chunks_exact(32)
            .map(|c| c.try_into().unwrap())
            .collect();
        entries.reverse();
        for (chunk, entry) in region.chunks_exact_mut(32).zip(&entries) {
            chunk.copy_from_slice(entry);
        }

        let decoded = NostrGroupData::decode(&bytes).unwrap();
        prop_assert_eq!(decoded.admins, data.admins);
    }

    /// Truncation is always an error, never a panic or a partial value.
    #[test]
    fn group_data_truncation_is_rejected(data in group_data_strategy(), cut in 0usize..256) {
        let bytes = data.encode().unwrap();
        if cut < bytes.len() {
            prop_assert!(NostrGroupData::decode(&bytes[..cut]).is_err());
        }
    }

    /// Client state round-trips through its JSON form for every field,
    /// including epochs beyond the 53-bit safe-integer range.
    #[test]
    fn client_state_roundtrip(state in state_strategy()) {
        let encoded = encode_client_state(&state).unwrap();
        let decoded = decode_client_state(&encoded).unwrap();
        prop_assert_eq!(state, decoded);
    }

    /// Byte fields in the state JSON always use the hex prefix form.
    #[test]
    fn client_state_bytes_are_hex_tagged(state in state_strategy()) {
        let encoded = encode_client_state(&state).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        let group_id = doc["groupId"].as_str().unwrap();
        prop_assert!(group_id.starts_with("hex:"));
        let restored = hex::decode(group_id.trim_start_matches("hex:")).unwrap();
        prop_assert_eq!(restored.as_slice(), state.group_id.as_slice());
    }

    /// Credential pubkey extraction inverts creation, and the legacy
    /// utf8-hex identity resolves to the same pubkey.
    #[test]
    fn credential_pubkey_roundtrip(idx in 0usize..8) {
        let pubkey = pubkey_pool()[idx];
        let hex_pk = pubkey.to_hex();

        let cred = Credential::from_hex(&hex_pk).unwrap();
        prop_assert_eq!(cred.pubkey_hex().unwrap(), hex_pk.clone());

        let legacy = Credential {
            credential_type: cred.credential_type,
            identity: hex_pk.clone().into_bytes(),
        };
        prop_assert_eq!(legacy.pubkey_hex().unwrap(), hex_pk);
    }

    /// Framed MLS content of every shape survives the wire.
    #[test]
    fn framed_content_roundtrip(
        sender in any::<u32>(),
        payload in prop::collection::vec(any::<u8>(), 0..512),
        removed in any::<u32>(),
    ) {
        for body in [
            ContentBody::Application(payload.clone()),
            ContentBody::Proposal(Proposal::Remove { removed }),
            ContentBody::Commit(Commit {
                proposals: vec![Proposal::Remove { removed }],
            }),
        ] {
            let framed = FramedContent { sender_leaf: sender, body };
            let decoded = FramedContent::decode(&framed.encode().unwrap()).unwrap();
            prop_assert_eq!(framed, decoded);
        }
    }

    /// Arbitrary bytes never panic the MLS message decoder.
    #[test]
    fn mls_message_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = MlsMessage::decode(&bytes);
    }
}
