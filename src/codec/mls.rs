//! Wire framing for MLS messages, proposals, commits, and key packages.
//!
//! The clear header of a framed message (group id, epoch, content type)
//! is visible to the engine so it can order commits and partition batches
//! without asking the provider to decrypt anything. Everything inside a
//! private message's ciphertext is opaque here.

use super::{CodecError, Result, WireReader, WireWriter};
use crate::credential::Credential;
use crate::mls::{
    Capabilities, CompleteKeyPackage, ExtensionEntry, KeyPackage, LeafNode, Lifetime,
    PrivateKeyPackage,
};

/// MLS 1.0 protocol version discriminant.
pub const MLS_PROTOCOL_VERSION: u16 = 1;

/// Outer wire format of an MLS message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Signed, unencrypted group message. Accepted on ingest, never produced.
    PublicMessage,
    /// Encrypted group message; all in-band Marmot traffic uses this.
    PrivateMessage,
    /// Welcome for newly added members.
    Welcome,
    /// Standalone group info.
    GroupInfo,
    /// Standalone key package.
    KeyPackage,
}

impl WireFormat {
    const fn discriminant(self) -> u16 {
        match self {
            Self::PublicMessage => 1,
            Self::PrivateMessage => 2,
            Self::Welcome => 3,
            Self::GroupInfo => 4,
            Self::KeyPackage => 5,
        }
    }

    fn from_discriminant(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Self::PublicMessage),
            2 => Ok(Self::PrivateMessage),
            3 => Ok(Self::Welcome),
            4 => Ok(Self::GroupInfo),
            5 => Ok(Self::KeyPackage),
            other => Err(CodecError::UnknownDiscriminant {
                field: "wire_format",
                value: u64::from(other),
            }),
        }
    }
}

/// Content carried by a framed (public or private) message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Application data (a serialized Nostr rumor).
    Application,
    /// A single MLS proposal.
    Proposal,
    /// A commit applying pending proposals.
    Commit,
}

impl ContentType {
    const fn discriminant(self) -> u8 {
        match self {
            Self::Application => 1,
            Self::Proposal => 2,
            Self::Commit => 3,
        }
    }

    fn from_discriminant(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Application),
            2 => Ok(Self::Proposal),
            3 => Ok(Self::Commit),
            other => Err(CodecError::UnknownDiscriminant {
                field: "content_type",
                value: u64::from(other),
            }),
        }
    }
}

/// An MLS change request, pending until a commit applies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    /// Add the member described by a key package.
    Add {
        /// The joining member's public key package.
        key_package: KeyPackage,
    },
    /// Refresh the sender's own leaf.
    Update {
        /// The replacement leaf node.
        leaf_node: LeafNode,
    },
    /// Remove the member at a leaf index.
    Remove {
        /// Leaf index of the member to remove.
        removed: u32,
    },
    /// Replace the group context extensions.
    GroupContextExtensions {
        /// The full replacement extension list.
        extensions: Vec<ExtensionEntry>,
    },
}

impl Proposal {
    /// Encodes to wire bytes.
    ///
    /// # Errors
    ///
    /// Fails when a nested field exceeds its length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new();
        self.encode_into(&mut w)?;
        Ok(w.into_bytes())
    }

    fn encode_into(&self, w: &mut WireWriter) -> Result<()> {
        match self {
            Self::Add { key_package } => {
                w.put_u16(1);
                key_package.encode_into(w)?;
            }
            Self::Update { leaf_node } => {
                w.put_u16(2);
                leaf_node.encode_into(w)?;
            }
            Self::Remove { removed } => {
                w.put_u16(3);
                w.put_u32(*removed);
            }
            Self::GroupContextExtensions { extensions } => {
                w.put_u16(7);
                encode_extensions(extensions, w)?;
            }
        }
        Ok(())
    }

    /// Decodes wire bytes, rejecting trailing input.
    ///
    /// # Errors
    ///
    /// Fails on truncation, unknown proposal types, or trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let out = Self::decode_from(&mut r)?;
        r.expect_end("Proposal")?;
        Ok(out)
    }

    fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        match r.get_u16()? {
            1 => Ok(Self::Add {
                key_package: KeyPackage::decode_from(r)?,
            }),
            2 => Ok(Self::Update {
                leaf_node: LeafNode::decode_from(r)?,
            }),
            3 => Ok(Self::Remove {
                removed: r.get_u32()?,
            }),
            7 => Ok(Self::GroupContextExtensions {
                extensions: decode_extensions(r)?,
            }),
            other => Err(CodecError::UnknownDiscriminant {
                field: "proposal_type",
                value: u64::from(other),
            }),
        }
    }
}

/// A commit: the ordered set of proposals it applies.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Commit {
    /// Proposals applied by this commit, in application order.
    pub proposals: Vec<Proposal>,
}

impl Commit {
    /// Encodes to wire bytes.
    ///
    /// # Errors
    ///
    /// Fails when the proposal list exceeds its length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut inner = WireWriter::new();
        for proposal in &self.proposals {
            proposal.encode_into(&mut inner)?;
        }
        let mut w = WireWriter::new();
        w.put_vec32(&inner.into_bytes())?;
        Ok(w.into_bytes())
    }

    /// Decodes wire bytes.
    ///
    /// # Errors
    ///
    /// Fails on truncation or malformed nested proposals.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let out = Self::decode_from(&mut r)?;
        r.expect_end("Commit")?;
        Ok(out)
    }

    fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        let inner = r.get_vec32()?;
        let mut rr = WireReader::new(inner);
        let mut proposals = Vec::new();
        while !rr.is_empty() {
            proposals.push(Proposal::decode_from(&mut rr)?);
        }
        Ok(Self { proposals })
    }
}

/// Body of a framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBody {
    /// Application bytes (a canonical rumor encoding).
    Application(Vec<u8>),
    /// A proposal.
    Proposal(Proposal),
    /// A commit.
    Commit(Commit),
}

impl ContentBody {
    /// The content type this body frames as.
    #[must_use]
    pub const fn content_type(&self) -> ContentType {
        match self {
            Self::Application(_) => ContentType::Application,
            Self::Proposal(_) => ContentType::Proposal,
            Self::Commit(_) => ContentType::Commit,
        }
    }
}

/// The authenticated content a provider seals inside a private message:
/// sender leaf plus body. The clear header lives on the message framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedContent {
    /// Leaf index of the sender.
    pub sender_leaf: u32,
    /// The content itself.
    pub body: ContentBody,
}

impl FramedContent {
    /// Encodes to wire bytes.
    ///
    /// # Errors
    ///
    /// Fails when the body exceeds its length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new();
        w.put_u32(self.sender_leaf);
        w.put_u8(self.body.content_type().discriminant());
        let body = match &self.body {
            ContentBody::Application(bytes) => bytes.clone(),
            ContentBody::Proposal(p) => p.encode()?,
            ContentBody::Commit(c) => c.encode()?,
        };
        w.put_vec32(&body)?;
        Ok(w.into_bytes())
    }

    /// Decodes wire bytes.
    ///
    /// # Errors
    ///
    /// Fails on truncation, unknown content types, or trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let sender_leaf = r.get_u32()?;
        let content_type = ContentType::from_discriminant(r.get_u8()?)?;
        let body_bytes = r.get_vec32()?;
        r.expect_end("FramedContent")?;
        let body = match content_type {
            ContentType::Application => ContentBody::Application(body_bytes.to_vec()),
            ContentType::Proposal => ContentBody::Proposal(Proposal::decode(body_bytes)?),
            ContentType::Commit => ContentBody::Commit(Commit::decode(body_bytes)?),
        };
        Ok(Self { sender_leaf, body })
    }
}

/// An encrypted framed message. Group id, epoch, and content type are
/// clear; the framed content is sealed by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessage {
    /// MLS group id (clear header).
    pub group_id: Vec<u8>,
    /// Epoch the message was sealed under.
    pub epoch: u64,
    /// Content type (clear header).
    pub content_type: ContentType,
    /// Provider-sealed framed content.
    pub ciphertext: Vec<u8>,
}

/// A signed, unencrypted framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicMessage {
    /// MLS group id.
    pub group_id: Vec<u8>,
    /// Epoch the message was authenticated under.
    pub epoch: u64,
    /// Content type.
    pub content_type: ContentType,
    /// Framed content, in the clear.
    pub content: Vec<u8>,
}

/// Body of an [`MlsMessage`], by wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MlsMessageBody {
    /// `mls_public_message`
    Public(PublicMessage),
    /// `mls_private_message`
    Private(PrivateMessage),
    /// `welcome`: opaque provider-defined payload.
    Welcome(Vec<u8>),
    /// `group_info`: opaque payload.
    GroupInfo(Vec<u8>),
    /// `key_package`
    KeyPackage(KeyPackage),
}

/// The top-level MLS message envelope carried inside group events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MlsMessage {
    /// Protocol version.
    pub version: u16,
    /// The wire-format-tagged body.
    pub body: MlsMessageBody,
}

impl MlsMessage {
    /// Wraps a private message in the current protocol version.
    #[must_use]
    pub const fn private(message: PrivateMessage) -> Self {
        Self {
            version: MLS_PROTOCOL_VERSION,
            body: MlsMessageBody::Private(message),
        }
    }

    /// Wraps an opaque welcome payload.
    #[must_use]
    pub const fn welcome(payload: Vec<u8>) -> Self {
        Self {
            version: MLS_PROTOCOL_VERSION,
            body: MlsMessageBody::Welcome(payload),
        }
    }

    /// The outer wire format.
    #[must_use]
    pub const fn wire_format(&self) -> WireFormat {
        match &self.body {
            MlsMessageBody::Public(_) => WireFormat::PublicMessage,
            MlsMessageBody::Private(_) => WireFormat::PrivateMessage,
            MlsMessageBody::Welcome(_) => WireFormat::Welcome,
            MlsMessageBody::GroupInfo(_) => WireFormat::GroupInfo,
            MlsMessageBody::KeyPackage(_) => WireFormat::KeyPackage,
        }
    }

    /// The clear-header epoch, for framed messages.
    #[must_use]
    pub const fn epoch(&self) -> Option<u64> {
        match &self.body {
            MlsMessageBody::Public(m) => Some(m.epoch),
            MlsMessageBody::Private(m) => Some(m.epoch),
            _ => None,
        }
    }

    /// The clear-header content type, for framed messages.
    #[must_use]
    pub const fn content_type(&self) -> Option<ContentType> {
        match &self.body {
            MlsMessageBody::Public(m) => Some(m.content_type),
            MlsMessageBody::Private(m) => Some(m.content_type),
            _ => None,
        }
    }

    /// Whether this is a private message carrying a commit, the only
    /// message class that advances the epoch.
    #[must_use]
    pub const fn is_private_commit(&self) -> bool {
        matches!(
            &self.body,
            MlsMessageBody::Private(PrivateMessage {
                content_type: ContentType::Commit,
                ..
            })
        )
    }

    /// Encodes to wire bytes.
    ///
    /// # Errors
    ///
    /// Fails when a field exceeds its length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new();
        w.put_u16(self.version);
        w.put_u16(self.wire_format().discriminant());
        match &self.body {
            MlsMessageBody::Public(m) => {
                w.put_vec16(&m.group_id)?;
                w.put_u64(m.epoch);
                w.put_u8(m.content_type.discriminant());
                w.put_vec32(&m.content)?;
            }
            MlsMessageBody::Private(m) => {
                w.put_vec16(&m.group_id)?;
                w.put_u64(m.epoch);
                w.put_u8(m.content_type.discriminant());
                w.put_vec32(&m.ciphertext)?;
            }
            MlsMessageBody::Welcome(payload) | MlsMessageBody::GroupInfo(payload) => {
                w.put_vec32(payload)?;
            }
            MlsMessageBody::KeyPackage(kp) => {
                kp.encode_into(&mut w)?;
            }
        }
        Ok(w.into_bytes())
    }

    /// Decodes wire bytes, rejecting trailing input.
    ///
    /// # Errors
    ///
    /// Fails on truncation, unknown wire formats or content types, and
    /// trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let version = r.get_u16()?;
        let wire_format = WireFormat::from_discriminant(r.get_u16()?)?;
        let body = match wire_format {
            WireFormat::PublicMessage => {
                let group_id = r.get_vec16()?.to_vec();
                let epoch = r.get_u64()?;
                let content_type = ContentType::from_discriminant(r.get_u8()?)?;
                let content = r.get_vec32()?.to_vec();
                MlsMessageBody::Public(PublicMessage {
                    group_id,
                    epoch,
                    content_type,
                    content,
                })
            }
            WireFormat::PrivateMessage => {
                let group_id = r.get_vec16()?.to_vec();
                let epoch = r.get_u64()?;
                let content_type = ContentType::from_discriminant(r.get_u8()?)?;
                let ciphertext = r.get_vec32()?.to_vec();
                MlsMessageBody::Private(PrivateMessage {
                    group_id,
                    epoch,
                    content_type,
                    ciphertext,
                })
            }
            WireFormat::Welcome => MlsMessageBody::Welcome(r.get_vec32()?.to_vec()),
            WireFormat::GroupInfo => MlsMessageBody::GroupInfo(r.get_vec32()?.to_vec()),
            WireFormat::KeyPackage => MlsMessageBody::KeyPackage(KeyPackage::decode_from(&mut r)?),
        };
        r.expect_end("MlsMessage")?;
        Ok(Self { version, body })
    }
}

fn encode_extensions(extensions: &[ExtensionEntry], w: &mut WireWriter) -> Result<()> {
    let mut inner = WireWriter::new();
    for ext in extensions {
        inner.put_u16(ext.extension_type);
        inner.put_vec16(&ext.data)?;
    }
    w.put_vec32(&inner.into_bytes())
}

fn decode_extensions(r: &mut WireReader<'_>) -> Result<Vec<ExtensionEntry>> {
    let inner = r.get_vec32()?;
    let mut rr = WireReader::new(inner);
    let mut out = Vec::new();
    while !rr.is_empty() {
        out.push(ExtensionEntry {
            extension_type: rr.get_u16()?,
            data: rr.get_vec16()?.to_vec(),
        });
    }
    Ok(out)
}

fn encode_u16_list(values: &[u16], w: &mut WireWriter) -> Result<()> {
    let mut inner = WireWriter::new();
    for v in values {
        inner.put_u16(*v);
    }
    w.put_vec16(&inner.into_bytes())
}

fn decode_u16_list(r: &mut WireReader<'_>) -> Result<Vec<u16>> {
    let inner = r.get_vec16()?;
    if inner.len() % 2 != 0 {
        return Err(CodecError::InvalidLength(format!(
            "u16 list of {} bytes",
            inner.len()
        )));
    }
    Ok(inner
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

impl Credential {
    pub(crate) fn encode_into(&self, w: &mut WireWriter) -> Result<()> {
        w.put_u16(self.credential_type);
        w.put_vec16(&self.identity)
    }

    pub(crate) fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            credential_type: r.get_u16()?,
            identity: r.get_vec16()?.to_vec(),
        })
    }
}

impl Capabilities {
    fn encode_into(&self, w: &mut WireWriter) -> Result<()> {
        encode_u16_list(&self.versions, w)?;
        encode_u16_list(&self.ciphersuites, w)?;
        encode_u16_list(&self.extensions, w)?;
        encode_u16_list(&self.proposals, w)?;
        encode_u16_list(&self.credentials, w)
    }

    fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            versions: decode_u16_list(r)?,
            ciphersuites: decode_u16_list(r)?,
            extensions: decode_u16_list(r)?,
            proposals: decode_u16_list(r)?,
            credentials: decode_u16_list(r)?,
        })
    }
}

impl LeafNode {
    pub(crate) fn encode_into(&self, w: &mut WireWriter) -> Result<()> {
        w.put_vec16(&self.hpke_public_key)?;
        w.put_vec16(&self.signature_public_key)?;
        self.credential.encode_into(w)?;
        self.capabilities.encode_into(w)?;
        w.put_u64(self.lifetime.not_before);
        w.put_u64(self.lifetime.not_after);
        encode_extensions(&self.extensions, w)
    }

    pub(crate) fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            hpke_public_key: r.get_vec16()?.to_vec(),
            signature_public_key: r.get_vec16()?.to_vec(),
            credential: Credential::decode_from(r)?,
            capabilities: Capabilities::decode_from(r)?,
            lifetime: Lifetime {
                not_before: r.get_u64()?,
                not_after: r.get_u64()?,
            },
            extensions: decode_extensions(r)?,
        })
    }
}

impl KeyPackage {
    /// Encodes the public key package; this is the byte string the
    /// key-package reference KDF runs over and the kind-443 content carries.
    ///
    /// # Errors
    ///
    /// Fails when a field exceeds its length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new();
        self.encode_into(&mut w)?;
        Ok(w.into_bytes())
    }

    pub(crate) fn encode_into(&self, w: &mut WireWriter) -> Result<()> {
        w.put_u16(self.version);
        w.put_u16(self.ciphersuite);
        w.put_vec16(&self.init_key)?;
        self.leaf_node.encode_into(w)?;
        encode_extensions(&self.extensions, w)?;
        w.put_vec16(&self.signature)
    }

    /// Decodes a public key package, rejecting trailing input.
    ///
    /// # Errors
    ///
    /// Fails on truncation or trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let out = Self::decode_from(&mut r)?;
        r.expect_end("KeyPackage")?;
        Ok(out)
    }

    pub(crate) fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            version: r.get_u16()?,
            ciphersuite: r.get_u16()?,
            init_key: r.get_vec16()?.to_vec(),
            leaf_node: LeafNode::decode_from(r)?,
            extensions: decode_extensions(r)?,
            signature: r.get_vec16()?.to_vec(),
        })
    }
}

/// Encodes a complete (public + private) key package for local storage.
///
/// # Errors
///
/// Fails when a field exceeds its length prefix.
pub fn encode_complete_key_package(complete: &CompleteKeyPackage) -> Result<Vec<u8>> {
    let mut w = WireWriter::new();
    w.put_vec32(&complete.public_package.encode()?)?;
    w.put_vec16(&complete.private_package.init_private_key)?;
    w.put_vec16(&complete.private_package.hpke_private_key)?;
    w.put_vec16(&complete.private_package.signature_private_key)?;
    Ok(w.into_bytes())
}

/// Decodes a complete key package from local storage bytes.
///
/// # Errors
///
/// Fails on truncation or trailing bytes.
pub fn decode_complete_key_package(bytes: &[u8]) -> Result<CompleteKeyPackage> {
    let mut r = WireReader::new(bytes);
    let public_package = KeyPackage::decode(r.get_vec32()?)?;
    let private_package = PrivateKeyPackage {
        init_private_key: r.get_vec16()?.to_vec(),
        hpke_private_key: r.get_vec16()?.to_vec(),
        signature_private_key: r.get_vec16()?.to_vec(),
    };
    r.expect_end("CompleteKeyPackage")?;
    Ok(CompleteKeyPackage {
        public_package,
        private_package,
    })
}
