//! The ciphersuite provider seam.
//!
//! All MLS cryptography (HPKE, AEAD, signatures, KDFs, ratchet tree math,
//! the key schedule) lives behind [`Ciphersuite`]. The engine hands a
//! provider the current [`ClientState`] and gets back new states and
//! framed messages; it never touches key schedule internals itself.
//! Providers must be re-entrant: one instance is shared by every group
//! running the suite.

use std::sync::Arc;

use thiserror::Error;
use zeroize::Zeroizing;

use super::{ClientState, CompleteKeyPackage, GroupId, KeyPackage, KeyPackageRef, ProposalRef};
use crate::codec::{MlsMessage, NostrGroupData, Proposal};
use crate::credential::Credential;

/// Opaque wrapper for ciphersuite provider failures.
#[derive(Error, Debug)]
#[error("crypto provider: {0}")]
pub struct CryptoError(pub String);

/// Result type for provider operations.
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// Output of [`Ciphersuite::create_commit`].
#[derive(Debug, Clone)]
pub struct CommitOutput {
    /// The commit, framed as a private message under the new epoch.
    pub commit: MlsMessage,
    /// State after the commit applies; one epoch ahead of the input.
    pub new_state: ClientState,
    /// Serialized welcome payload when the commit added members.
    pub welcome: Option<Vec<u8>>,
}

/// Output of [`Ciphersuite::process_message`].
#[derive(Debug, Clone)]
pub enum ProcessedMessage {
    /// A proposal or commit was absorbed into the state.
    StateUpdated(ClientState),
    /// An application message was decrypted.
    Application {
        /// State after processing (ratchet advance where applicable).
        new_state: ClientState,
        /// The decrypted application payload.
        data: Vec<u8>,
    },
}

impl ProcessedMessage {
    /// The state carried by either variant.
    #[must_use]
    pub const fn state(&self) -> &ClientState {
        match self {
            Self::StateUpdated(state) | Self::Application { new_state: state, .. } => state,
        }
    }
}

/// A ciphersuite implementation: crypto primitives plus the MLS group
/// operations the engine delegates. Incoming messages are accepted under
/// an accept-all authentication policy; membership rules are enforced by
/// the engine at commit time.
pub trait Ciphersuite: Send + Sync {
    /// Numeric ciphersuite id (appears in key-package events).
    fn id(&self) -> u16;

    /// Registry name of the suite.
    fn name(&self) -> &str;

    /// KDF over the serialized public package; the store key.
    fn key_package_ref(&self, key_package: &KeyPackage) -> CryptoResult<KeyPackageRef>;

    /// KDF over a serialized proposal; keys `unapplied_proposals`.
    fn proposal_ref(&self, proposal: &Proposal) -> CryptoResult<ProposalRef>;

    /// Generates a fresh key package pair for `credential` with the
    /// Marmot default capabilities and lifetime.
    fn generate_key_package(&self, credential: Credential) -> CryptoResult<CompleteKeyPackage>;

    /// The exporter secret for `epoch`, when this state can produce it.
    /// Epochs in the recorded history are always available; providers may
    /// additionally derive the immediately following epoch.
    fn exporter_secret(
        &self,
        state: &ClientState,
        epoch: u64,
    ) -> CryptoResult<Option<Zeroizing<[u8; 32]>>>;

    /// Builds the founder's epoch-0 state for a new group.
    fn create_group(
        &self,
        group_id: GroupId,
        founder: &CompleteKeyPackage,
        group_data: &NostrGroupData,
    ) -> CryptoResult<ClientState>;

    /// Frames one proposal as a private message under the current epoch.
    /// Does not mutate state: the proposal enters `unapplied_proposals`
    /// only when it comes back through ingest.
    fn create_proposal_message(
        &self,
        state: &ClientState,
        proposal: &Proposal,
    ) -> CryptoResult<MlsMessage>;

    /// Builds a commit over `proposals`; when `proposals` is empty the
    /// whole pending `unapplied_proposals` set is drained implicitly.
    /// The engine wraps the returned commit in an envelope keyed by the
    /// **new** state's exporter secret, so peers open it under the
    /// post-commit epoch.
    fn create_commit(&self, state: &ClientState, proposals: &[Proposal])
        -> CryptoResult<CommitOutput>;

    /// Seals application bytes as a private message; the returned state
    /// carries the sender ratchet advance (forward secrecy).
    fn create_application_message(
        &self,
        state: &ClientState,
        payload: &[u8],
    ) -> CryptoResult<(ClientState, MlsMessage)>;

    /// Processes one framed message against the state.
    fn process_message(
        &self,
        state: &ClientState,
        message: &MlsMessage,
    ) -> CryptoResult<ProcessedMessage>;

    /// Builds a joiner's state from a welcome payload and the consumed
    /// key package.
    fn join_from_welcome(
        &self,
        welcome: &[u8],
        key_package: &CompleteKeyPackage,
    ) -> CryptoResult<ClientState>;
}

/// Registry resolving ciphersuite implementations by name or id.
#[derive(Default, Clone)]
pub struct CiphersuiteRegistry {
    suites: Vec<Arc<dyn Ciphersuite>>,
}

impl CiphersuiteRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the given suites; the first is the
    /// default for new groups.
    #[must_use]
    pub fn with_suites(suites: Vec<Arc<dyn Ciphersuite>>) -> Self {
        Self { suites }
    }

    /// Registers a suite.
    pub fn register(&mut self, suite: Arc<dyn Ciphersuite>) {
        self.suites.push(suite);
    }

    /// Resolves a suite by registry name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Ciphersuite>> {
        self.suites.iter().find(|s| s.name() == name).cloned()
    }

    /// Resolves a suite by numeric id.
    #[must_use]
    pub fn by_id(&self, id: u16) -> Option<Arc<dyn Ciphersuite>> {
        self.suites.iter().find(|s| s.id() == id).cloned()
    }

    /// The default suite for newly created groups.
    #[must_use]
    pub fn default_suite(&self) -> Option<Arc<dyn Ciphersuite>> {
        self.suites.first().cloned()
    }
}

impl std::fmt::Debug for CiphersuiteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.suites.iter().map(|s| s.name()).collect();
        f.debug_struct("CiphersuiteRegistry")
            .field("suites", &names)
            .finish()
    }
}
