//! Deterministic test doubles for the provider and network seams.
//!
//! [`TestCiphersuite`] implements the full provider contract with
//! hash-derived secrets and no real MLS cryptography: exporter secrets
//! are functions of `(group id, epoch)`, framed content is sealed by the
//! NIP-44 envelope alone, and welcomes carry the serialized joiner
//! state. That makes every engine code path executable and repeatable in
//! tests. [`MockNetwork`] records published events and acknowledges (or
//! refuses) on command.
//!
//! Never ship this module: the test suite provides no confidentiality.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use nostr::{Event, Filter, PublicKey, RelayUrl};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::codec::{
    decode_client_state, encode_client_state, Commit, ContentBody, ContentType, FramedContent,
    MlsMessage, MlsMessageBody, PrivateMessage, Proposal, PublicMessage, MLS_PROTOCOL_VERSION,
};
use crate::credential::Credential;
use crate::mls::key_package::{default_capabilities, default_lifetime};
use crate::mls::provider::{
    Ciphersuite, CommitOutput, CryptoError, CryptoResult, ProcessedMessage,
};
use crate::mls::{
    ClientState, CompleteKeyPackage, ExporterSecret, GroupId, KeyPackage, KeyPackageRef, LeafNode,
    PrivateKeyPackage, ProposalRef, RatchetNode,
};
use crate::network::{NetworkError, NetworkInterface, NetworkResult, PublishResult};

/// Ciphersuite id the test suite registers under.
pub const TEST_CIPHERSUITE_ID: u16 = 1;

/// Registry name of the test suite.
pub const TEST_CIPHERSUITE_NAME: &str = "test-deterministic";

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn random_bytes(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

/// Deterministic, non-cryptographic ciphersuite provider.
#[derive(Debug, Default)]
pub struct TestCiphersuite;

impl TestCiphersuite {
    fn leaf_from_key_package(kp: &KeyPackage) -> RatchetNode {
        RatchetNode {
            encryption_key: kp.leaf_node.hpke_public_key.clone(),
            signature_key: Some(kp.leaf_node.signature_public_key.clone()),
            credential: Some(kp.leaf_node.credential.clone()),
        }
    }

    fn derive_exporter(group_id: &GroupId, epoch: u64) -> [u8; 32] {
        sha256(&[b"marmot-test-exporter", group_id.as_slice(), &epoch.to_be_bytes()])
    }

    fn frame(
        state: &ClientState,
        content_type: ContentType,
        body_bytes: Vec<u8>,
    ) -> MlsMessage {
        MlsMessage::private(PrivateMessage {
            group_id: state.group_id.as_slice().to_vec(),
            epoch: state.epoch,
            content_type,
            ciphertext: body_bytes,
        })
    }

    /// Applies a committed proposal list to produce the next epoch.
    fn apply_commit(state: &ClientState, proposals: &[Proposal]) -> CryptoResult<ClientState> {
        let mut next = state.clone();
        for proposal in proposals {
            match proposal {
                Proposal::Add { key_package } => {
                    let leaf = Some(Self::leaf_from_key_package(key_package));
                    if let Some(slot) = next.ratchet_tree.iter_mut().find(|s| s.is_none()) {
                        *slot = leaf;
                    } else {
                        next.ratchet_tree.push(leaf);
                    }
                }
                Proposal::Remove { removed } => {
                    let slot = next
                        .ratchet_tree
                        .get_mut(*removed as usize)
                        .ok_or_else(|| {
                            CryptoError(format!("remove out of range: leaf {removed}"))
                        })?;
                    *slot = None;
                }
                Proposal::Update { leaf_node } => {
                    let replacement = RatchetNode {
                        encryption_key: leaf_node.hpke_public_key.clone(),
                        signature_key: Some(leaf_node.signature_public_key.clone()),
                        credential: Some(leaf_node.credential.clone()),
                    };
                    let slot = next.ratchet_tree.iter_mut().find(|s| {
                        s.as_ref()
                            .and_then(|n| n.credential.as_ref())
                            .is_some_and(|c| *c == leaf_node.credential)
                    });
                    if let Some(slot) = slot {
                        *slot = Some(replacement);
                    }
                }
                Proposal::GroupContextExtensions { extensions } => {
                    next.extensions = extensions.clone();
                }
            }
        }

        next.epoch = state.epoch + 1;
        next.init_secret =
            sha256(&[b"marmot-test-init", &next.init_secret, &next.epoch.to_be_bytes()]).to_vec();
        next.exporter_secrets.insert(
            next.epoch,
            ExporterSecret(Self::derive_exporter(&next.group_id, next.epoch)),
        );
        // Pending proposals are consumed or dropped at the epoch change.
        next.unapplied_proposals.clear();
        Ok(next)
    }
}

impl Ciphersuite for TestCiphersuite {
    fn id(&self) -> u16 {
        TEST_CIPHERSUITE_ID
    }

    fn name(&self) -> &str {
        TEST_CIPHERSUITE_NAME
    }

    fn key_package_ref(&self, key_package: &KeyPackage) -> CryptoResult<KeyPackageRef> {
        let bytes = key_package
            .encode()
            .map_err(|e| CryptoError(e.to_string()))?;
        Ok(KeyPackageRef::from_slice(&sha256(&[b"marmot-test-kpref", &bytes])))
    }

    fn proposal_ref(&self, proposal: &Proposal) -> CryptoResult<ProposalRef> {
        let bytes = proposal.encode().map_err(|e| CryptoError(e.to_string()))?;
        Ok(ProposalRef::from_slice(&sha256(&[b"marmot-test-propref", &bytes])))
    }

    fn generate_key_package(&self, credential: Credential) -> CryptoResult<CompleteKeyPackage> {
        let public_package = KeyPackage {
            version: MLS_PROTOCOL_VERSION,
            ciphersuite: TEST_CIPHERSUITE_ID,
            init_key: random_bytes(32),
            leaf_node: LeafNode {
                hpke_public_key: random_bytes(32),
                signature_public_key: random_bytes(32),
                credential,
                capabilities: default_capabilities(TEST_CIPHERSUITE_ID),
                lifetime: default_lifetime(),
                extensions: vec![],
            },
            extensions: vec![],
            signature: random_bytes(64),
        };
        let private_package = PrivateKeyPackage {
            init_private_key: random_bytes(32),
            hpke_private_key: random_bytes(32),
            signature_private_key: random_bytes(32),
        };
        Ok(CompleteKeyPackage {
            public_package,
            private_package,
        })
    }

    fn exporter_secret(
        &self,
        state: &ClientState,
        epoch: u64,
    ) -> CryptoResult<Option<Zeroizing<[u8; 32]>>> {
        if let Some(secret) = state.exporter_secret_at(epoch) {
            return Ok(Some(Zeroizing::new(*secret.as_bytes())));
        }
        // Deterministic schedule: any epoch is derivable from the group
        // id, which is exactly what trial decryption needs in tests.
        Ok(Some(Zeroizing::new(Self::derive_exporter(
            &state.group_id,
            epoch,
        ))))
    }

    fn create_group(
        &self,
        group_id: GroupId,
        founder: &CompleteKeyPackage,
        group_data: &crate::codec::NostrGroupData,
    ) -> CryptoResult<ClientState> {
        let mut state = ClientState {
            group_id: group_id.clone(),
            epoch: 0,
            ciphersuite: TEST_CIPHERSUITE_ID,
            extensions: vec![],
            ratchet_tree: vec![Some(Self::leaf_from_key_package(&founder.public_package))],
            own_leaf_index: 0,
            init_secret: sha256(&[b"marmot-test-init", group_id.as_slice()]).to_vec(),
            exporter_secrets: std::collections::BTreeMap::from([(
                0,
                ExporterSecret(Self::derive_exporter(&group_id, 0)),
            )]),
            unapplied_proposals: std::collections::BTreeMap::new(),
        };
        state
            .set_group_data(group_data)
            .map_err(|e| CryptoError(e.to_string()))?;
        Ok(state)
    }

    fn create_proposal_message(
        &self,
        state: &ClientState,
        proposal: &Proposal,
    ) -> CryptoResult<MlsMessage> {
        let framed = FramedContent {
            sender_leaf: state.own_leaf_index,
            body: ContentBody::Proposal(proposal.clone()),
        };
        let bytes = framed.encode().map_err(|e| CryptoError(e.to_string()))?;
        Ok(Self::frame(state, ContentType::Proposal, bytes))
    }

    fn create_commit(
        &self,
        state: &ClientState,
        proposals: &[Proposal],
    ) -> CryptoResult<CommitOutput> {
        let committed: Vec<Proposal> = if proposals.is_empty() {
            state.unapplied_proposals.values().cloned().collect()
        } else {
            proposals.to_vec()
        };

        let new_state = Self::apply_commit(state, &committed)?;

        let framed = FramedContent {
            sender_leaf: state.own_leaf_index,
            body: ContentBody::Commit(Commit {
                proposals: committed.clone(),
            }),
        };
        let bytes = framed.encode().map_err(|e| CryptoError(e.to_string()))?;
        let commit = Self::frame(state, ContentType::Commit, bytes);

        let welcome = if committed
            .iter()
            .any(|p| matches!(p, Proposal::Add { .. }))
        {
            let json =
                encode_client_state(&new_state).map_err(|e| CryptoError(e.to_string()))?;
            Some(json.into_bytes())
        } else {
            None
        };

        Ok(CommitOutput {
            commit,
            new_state,
            welcome,
        })
    }

    fn create_application_message(
        &self,
        state: &ClientState,
        payload: &[u8],
    ) -> CryptoResult<(ClientState, MlsMessage)> {
        let framed = FramedContent {
            sender_leaf: state.own_leaf_index,
            body: ContentBody::Application(payload.to_vec()),
        };
        let bytes = framed.encode().map_err(|e| CryptoError(e.to_string()))?;
        // The sender ratchet advance is a no-op in the test schedule.
        Ok((state.clone(), Self::frame(state, ContentType::Application, bytes)))
    }

    fn process_message(
        &self,
        state: &ClientState,
        message: &MlsMessage,
    ) -> CryptoResult<ProcessedMessage> {
        let (group_id, epoch, framed_bytes) = match &message.body {
            MlsMessageBody::Private(PrivateMessage {
                group_id,
                epoch,
                ciphertext,
                ..
            }) => (group_id, *epoch, ciphertext),
            MlsMessageBody::Public(PublicMessage {
                group_id,
                epoch,
                content,
                ..
            }) => (group_id, *epoch, content),
            _ => return Err(CryptoError("not an in-band group message".to_string())),
        };

        if group_id != state.group_id.as_slice() {
            return Err(CryptoError("message is for another group".to_string()));
        }

        let framed =
            FramedContent::decode(framed_bytes).map_err(|e| CryptoError(e.to_string()))?;

        match framed.body {
            ContentBody::Application(data) => Ok(ProcessedMessage::Application {
                new_state: state.clone(),
                data,
            }),
            ContentBody::Proposal(proposal) => {
                if epoch != state.epoch {
                    // Proposals from other epochs are dropped silently;
                    // they died with their epoch.
                    return Ok(ProcessedMessage::StateUpdated(state.clone()));
                }
                let proposal_ref = self.proposal_ref(&proposal)?;
                let mut next = state.clone();
                next.unapplied_proposals
                    .insert(proposal_ref.to_hex(), proposal);
                Ok(ProcessedMessage::StateUpdated(next))
            }
            ContentBody::Commit(commit) => {
                if epoch != state.epoch {
                    return Err(CryptoError(format!(
                        "commit built on epoch {epoch}, state is at {}",
                        state.epoch
                    )));
                }
                let next = Self::apply_commit(state, &commit.proposals)?;
                Ok(ProcessedMessage::StateUpdated(next))
            }
        }
    }

    fn join_from_welcome(
        &self,
        welcome: &[u8],
        key_package: &CompleteKeyPackage,
    ) -> CryptoResult<ClientState> {
        let json = std::str::from_utf8(welcome)
            .map_err(|e| CryptoError(format!("welcome payload: {e}")))?;
        let mut state = decode_client_state(json).map_err(|e| CryptoError(e.to_string()))?;

        let own_credential = &key_package.public_package.leaf_node.credential;
        let own_leaf = state
            .ratchet_tree
            .iter()
            .position(|slot| {
                slot.as_ref()
                    .and_then(|n| n.credential.as_ref())
                    .is_some_and(|c| c == own_credential)
            })
            .ok_or_else(|| CryptoError("welcome does not admit this key package".to_string()))?;

        state.own_leaf_index =
            u32::try_from(own_leaf).map_err(|_| CryptoError("leaf index overflow".to_string()))?;
        Ok(state)
    }
}

/// In-memory network double: records publishes, acknowledges on command.
#[derive(Debug, Default)]
pub struct MockNetwork {
    published: Mutex<Vec<(Vec<RelayUrl>, Event)>>,
    ack: AtomicBool,
    inbox: Mutex<HashMap<PublicKey, Vec<RelayUrl>>>,
}

impl MockNetwork {
    /// Creates a network that acknowledges every publish.
    #[must_use]
    pub fn new() -> Self {
        let network = Self::default();
        network.ack.store(true, Ordering::SeqCst);
        network
    }

    /// Makes every relay acknowledge (`true`) or refuse (`false`).
    pub fn set_ack(&self, ack: bool) {
        self.ack.store(ack, Ordering::SeqCst);
    }

    /// Registers the inbox relays reported for `pubkey`.
    pub fn set_inbox_relays(&self, pubkey: PublicKey, relays: Vec<RelayUrl>) {
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.insert(pubkey, relays);
        }
    }

    /// Everything published so far, with target relays.
    #[must_use]
    pub fn published(&self) -> Vec<(Vec<RelayUrl>, Event)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Events published to a specific relay.
    #[must_use]
    pub fn events_on(&self, relay: &RelayUrl) -> Vec<Event> {
        self.published()
            .into_iter()
            .filter(|(relays, _)| relays.contains(relay))
            .map(|(_, event)| event)
            .collect()
    }

    /// Drops the publish log.
    pub fn clear(&self) {
        if let Ok(mut published) = self.published.lock() {
            published.clear();
        }
    }
}

#[async_trait]
impl NetworkInterface for MockNetwork {
    async fn request(&self, _relays: &[RelayUrl], _filter: Filter) -> NetworkResult<Vec<Event>> {
        Ok(Vec::new())
    }

    async fn subscribe(
        &self,
        _relays: &[RelayUrl],
        _filter: Filter,
    ) -> NetworkResult<mpsc::Receiver<Event>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn publish(&self, relays: &[RelayUrl], event: &Event) -> NetworkResult<PublishResult> {
        if let Ok(mut published) = self.published.lock() {
            published.push((relays.to_vec(), event.clone()));
        }
        if self.ack.load(Ordering::SeqCst) {
            Ok(PublishResult {
                event_id: event.id,
                accepted_by: relays.to_vec(),
                rejected_by: vec![],
            })
        } else {
            Ok(PublishResult {
                event_id: event.id,
                accepted_by: vec![],
                rejected_by: relays
                    .iter()
                    .map(|r| (r.clone(), "mock: refused".to_string()))
                    .collect(),
            })
        }
    }

    async fn inbox_relays(&self, pubkey: &PublicKey) -> NetworkResult<Vec<RelayUrl>> {
        self.inbox
            .lock()
            .ok()
            .and_then(|inbox| inbox.get(pubkey).cloned())
            .filter(|relays| !relays.is_empty())
            .ok_or(NetworkError::NoInboxRelays(*pubkey))
    }
}
