//! Core MLS-facing data model.
//!
//! These types represent the authoritative local group state and the key
//! material the engine manages. All cryptographic math over them lives
//! behind the [`provider::Ciphersuite`] seam; this module only owns the
//! data and its invariants.

pub mod key_package;
pub mod provider;

use std::collections::BTreeMap;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::codec::{NostrGroupData, Proposal};
use crate::codec::group_data::GROUP_DATA_EXTENSION_TYPE;
use crate::credential::Credential;
use crate::error::{Error, Result};

/// Private MLS group identifier. Never published to relays; the public
/// handle is the 32-byte `nostr_group_id` inside [`NostrGroupData`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(Vec<u8>);

impl GroupId {
    /// Wraps raw group id bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Parses a lowercase hex group id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GroupNotFound`] for non-hex input, since callers
    /// pass ids they expect to resolve against the store.
    pub fn from_hex(s: &str) -> Result<Self> {
        hex::decode(s).map(Self).map_err(|_| Error::GroupNotFound)
    }

    /// The raw id bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex form, the GroupStore key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// Opaque key-package reference: the ciphersuite KDF over the serialized
/// public package. Hex form keys the KeyPackageStore.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPackageRef(Vec<u8>);

impl KeyPackageRef {
    /// Wraps raw reference bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// The raw reference bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// Opaque proposal reference keying `unapplied_proposals`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProposalRef(Vec<u8>);

impl ProposalRef {
    /// Wraps raw reference bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Parses a hex proposal reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProposalRefNotFound`] for non-hex input.
    pub fn from_hex(s: &str) -> Result<Self> {
        hex::decode(s)
            .map(Self)
            .map_err(|_| Error::ProposalRefNotFound(s.to_string()))
    }

    /// The raw reference bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// A single MLS extension entry: type id plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionEntry {
    /// Extension type id.
    pub extension_type: u16,
    /// Extension payload bytes.
    pub data: Vec<u8>,
}

/// Capabilities advertised by a leaf node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Supported protocol versions.
    pub versions: Vec<u16>,
    /// Supported ciphersuites.
    pub ciphersuites: Vec<u16>,
    /// Supported extension types.
    pub extensions: Vec<u16>,
    /// Supported proposal types.
    pub proposals: Vec<u16>,
    /// Supported credential types.
    pub credentials: Vec<u16>,
}

/// Validity window of a key package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    /// Unix seconds before which the package is invalid.
    pub not_before: u64,
    /// Unix seconds after which the package is invalid.
    pub not_after: u64,
}

/// A leaf node: the public material describing one group member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode {
    /// HPKE public key for path encryption.
    pub hpke_public_key: Vec<u8>,
    /// Signature public key authenticating the member.
    pub signature_public_key: Vec<u8>,
    /// The member's credential.
    pub credential: Credential,
    /// Advertised capabilities.
    pub capabilities: Capabilities,
    /// Validity window.
    pub lifetime: Lifetime,
    /// Leaf extensions.
    pub extensions: Vec<ExtensionEntry>,
}

/// Public half of an MLS key package, the "calling card" another party
/// needs to add this identity to a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPackage {
    /// MLS protocol version.
    pub version: u16,
    /// Ciphersuite id.
    pub ciphersuite: u16,
    /// HPKE init public key.
    pub init_key: Vec<u8>,
    /// The leaf node to splice into the ratchet tree.
    pub leaf_node: LeafNode,
    /// Key-package extensions.
    pub extensions: Vec<ExtensionEntry>,
    /// Signature over the package.
    pub signature: Vec<u8>,
}

impl KeyPackage {
    /// The Nostr public key bound to this package's credential.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCredential`] when the credential identity
    /// is malformed.
    pub fn pubkey(&self) -> Result<nostr::PublicKey> {
        self.leaf_node.credential.pubkey()
    }
}

/// Secret half of a key package. Never leaves the local machine.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKeyPackage {
    /// HPKE init private key.
    pub init_private_key: Vec<u8>,
    /// HPKE private key for the leaf.
    pub hpke_private_key: Vec<u8>,
    /// Signature private key.
    pub signature_private_key: Vec<u8>,
}

impl std::fmt::Debug for PrivateKeyPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyPackage").finish_non_exhaustive()
    }
}

/// A public/private key-package pair owned by its creator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteKeyPackage {
    /// The publishable half.
    pub public_package: KeyPackage,
    /// The local secret half.
    pub private_package: PrivateKeyPackage,
}

/// One slot of the ratchet tree. Leaves carry credentials; blank slots
/// (removed members) are `None` in the tree vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetNode {
    /// HPKE public key of the node.
    pub encryption_key: Vec<u8>,
    /// Signature key, present on leaf nodes.
    pub signature_key: Option<Vec<u8>>,
    /// Member credential, present on leaf nodes.
    pub credential: Option<Credential>,
}

/// An epoch exporter secret. Keys the NIP-44 envelope around group
/// messages; rotated on every commit.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ExporterSecret(pub [u8; 32]);

impl ExporterSecret {
    /// The secret bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ExporterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExporterSecret(..)")
    }
}

/// Authoritative MLS client state for one group.
///
/// Owned by exactly one [`crate::group::MarmotGroup`] while loaded; the
/// serialized form lives in the GroupStore. The ciphersuite provider
/// handle is environmental and never part of this struct; the engine
/// re-binds it when loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientState {
    /// Private MLS group id.
    pub group_id: GroupId,
    /// Current epoch; monotonically non-decreasing.
    pub epoch: u64,
    /// Ciphersuite id the group runs on.
    pub ciphersuite: u16,
    /// Group context extensions, including the Marmot group data.
    pub extensions: Vec<ExtensionEntry>,
    /// Ratchet tree; blank slots are `None`.
    pub ratchet_tree: Vec<Option<RatchetNode>>,
    /// Own position in the tree.
    pub own_leaf_index: u32,
    /// Init secret chaining the key schedule across epochs.
    pub init_secret: Vec<u8>,
    /// Exporter secret history, one entry per known epoch.
    pub exporter_secrets: BTreeMap<u64, ExporterSecret>,
    /// Proposals received but not yet committed, keyed by hex ref.
    pub unapplied_proposals: BTreeMap<String, Proposal>,
}

impl ClientState {
    /// Hex form of the MLS group id, the GroupStore key.
    #[must_use]
    pub fn group_id_hex(&self) -> String {
        self.group_id.to_hex()
    }

    /// Decodes the Marmot group data extension from the group context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GroupDataNotFound`] when the extension is absent,
    /// or a codec error when it is present but malformed.
    pub fn group_data(&self) -> Result<NostrGroupData> {
        let ext = self
            .extensions
            .iter()
            .find(|e| e.extension_type == GROUP_DATA_EXTENSION_TYPE)
            .ok_or(Error::GroupDataNotFound)?;
        Ok(NostrGroupData::decode(&ext.data)?)
    }

    /// Replaces the Marmot group data extension in place.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the data fails to encode.
    pub fn set_group_data(&mut self, data: &NostrGroupData) -> Result<()> {
        let encoded = data.encode()?;
        if let Some(ext) = self
            .extensions
            .iter_mut()
            .find(|e| e.extension_type == GROUP_DATA_EXTENSION_TYPE)
        {
            ext.data = encoded;
        } else {
            self.extensions.push(ExtensionEntry {
                extension_type: GROUP_DATA_EXTENSION_TYPE,
                data: encoded,
            });
        }
        Ok(())
    }

    /// Number of occupied leaves (current members).
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.ratchet_tree.iter().flatten().count()
    }

    /// Public keys of all current members, in leaf order.
    #[must_use]
    pub fn members(&self) -> Vec<nostr::PublicKey> {
        self.ratchet_tree
            .iter()
            .flatten()
            .filter_map(|node| node.credential.as_ref())
            .filter_map(|cred| cred.pubkey().ok())
            .collect()
    }

    /// Finds the leaf index holding `pubkey`, if any.
    #[must_use]
    pub fn leaf_index_of(&self, pubkey: &nostr::PublicKey) -> Option<u32> {
        self.ratchet_tree.iter().enumerate().find_map(|(i, slot)| {
            let cred = slot.as_ref()?.credential.as_ref()?;
            if cred.pubkey().ok()? == *pubkey {
                u32::try_from(i).ok()
            } else {
                None
            }
        })
    }

    /// The exporter secret recorded for `epoch`, if known.
    #[must_use]
    pub fn exporter_secret_at(&self, epoch: u64) -> Option<&ExporterSecret> {
        self.exporter_secrets.get(&epoch)
    }
}
