//! The Marmot group data extension (MLS group context extension `0xF2EE`).
//!
//! This extension carries the Nostr-facing group metadata inside the MLS
//! group context: the public 32-byte Nostr group id (the value relays see
//! in `h` tags — never the private MLS group id), the human-readable name
//! and description, the admin set, the group relays, and the encrypted
//! group image parameters.
//!
//! The byte layout is fixed: `u16 version`, 32-byte group id, u16-prefixed
//! UTF-8 name and description, a u16-prefixed vector of 32-byte admin
//! pubkeys, a u16-prefixed vector of u16-prefixed relay URLs, then the
//! 32-byte image hash (all zero means no image), 32-byte image key, and
//! 12-byte image nonce.

use std::collections::BTreeSet;

use nostr::{PublicKey, RelayUrl};
use rand::RngCore;

use super::{CodecError, Result, WireReader, WireWriter};

/// Marmot group data extension version produced by this crate.
pub const GROUP_DATA_VERSION: u16 = 1;

/// MLS extension type id of the Marmot group data extension.
pub const GROUP_DATA_EXTENSION_TYPE: u16 = 0xF2EE;

/// Nostr-facing group metadata stored in the MLS group context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NostrGroupData {
    /// Extension version.
    pub version: u16,
    /// Public 32-byte group id used in `h` tags on relays.
    pub nostr_group_id: [u8; 32],
    /// Group name.
    pub name: String,
    /// Group description.
    pub description: String,
    /// Admin pubkeys. Set semantics: duplicates are rejected on decode.
    pub admins: BTreeSet<PublicKey>,
    /// Relays the group publishes its traffic on, in preference order.
    pub relays: Vec<RelayUrl>,
    /// SHA-256 hash of the encrypted group image; all zero when unset.
    pub image_hash: [u8; 32],
    /// ChaCha20-Poly1305 key for the group image.
    pub image_key: [u8; 32],
    /// Nonce for the group image.
    pub image_nonce: [u8; 12],
}

impl NostrGroupData {
    /// Creates group data with a freshly generated random Nostr group id
    /// and no image.
    pub fn new<IA, IR>(
        name: impl Into<String>,
        description: impl Into<String>,
        admins: IA,
        relays: IR,
    ) -> Self
    where
        IA: IntoIterator<Item = PublicKey>,
        IR: IntoIterator<Item = RelayUrl>,
    {
        let mut nostr_group_id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nostr_group_id);

        Self {
            version: GROUP_DATA_VERSION,
            nostr_group_id,
            name: name.into(),
            description: description.into(),
            admins: admins.into_iter().collect(),
            relays: relays.into_iter().collect(),
            image_hash: [0u8; 32],
            image_key: [0u8; 32],
            image_nonce: [0u8; 12],
        }
    }

    /// Returns the Nostr group id as lowercase hex, the `h` tag value.
    #[must_use]
    pub fn nostr_group_id_hex(&self) -> String {
        hex::encode(self.nostr_group_id)
    }

    /// Returns whether `pubkey` holds admin rights in this group.
    #[must_use]
    pub fn is_admin(&self, pubkey: &PublicKey) -> bool {
        self.admins.contains(pubkey)
    }

    /// Returns whether the group carries an encrypted image.
    #[must_use]
    pub fn has_image(&self) -> bool {
        self.image_hash != [0u8; 32]
    }

    /// Encodes to the fixed wire layout.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidLength`] if a variable field exceeds
    /// its u16 length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new();
        w.put_u16(self.version);
        w.put_fixed(&self.nostr_group_id);
        w.put_vec16(self.name.as_bytes())?;
        w.put_vec16(self.description.as_bytes())?;

        // Admins serialize in their BTreeSet (byte-wise) order; the outer
        // prefix counts bytes, entries are fixed 32-byte pubkeys.
        let mut admins = WireWriter::new();
        for pk in &self.admins {
            admins.put_fixed(&pk.to_bytes());
        }
        w.put_vec16(&admins.into_bytes())?;

        let mut relays = WireWriter::new();
        for url in &self.relays {
            relays.put_vec16(url.to_string().as_bytes())?;
        }
        w.put_vec16(&relays.into_bytes())?;

        w.put_fixed(&self.image_hash);
        w.put_fixed(&self.image_key);
        w.put_fixed(&self.image_nonce);
        Ok(w.into_bytes())
    }

    /// Decodes from the fixed wire layout.
    ///
    /// # Errors
    ///
    /// Fails on truncation, trailing bytes, non-UTF-8 strings, admin lists
    /// that are not a multiple of 32 bytes, duplicate admins, and relay
    /// entries that do not parse as relay URLs.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let version = r.get_u16()?;
        let nostr_group_id = r.get_array32()?;
        let name = r.get_string16()?;
        let description = r.get_string16()?;

        let admin_bytes = r.get_vec16()?;
        if admin_bytes.len() % 32 != 0 {
            return Err(CodecError::InvalidLength(format!(
                "admin list of {} bytes is not a multiple of 32",
                admin_bytes.len()
            )));
        }
        let mut admins = BTreeSet::new();
        for chunk in admin_bytes.chunks_exact(32) {
            let pk = PublicKey::from_slice(chunk).map_err(|e| CodecError::InvalidField {
                field: "admin_pubkeys",
                reason: e.to_string(),
            })?;
            // Set semantics: peers may serialize their admin set in any
            // order, but the same key must not appear twice.
            if !admins.insert(pk) {
                return Err(CodecError::InvalidField {
                    field: "admin_pubkeys",
                    reason: "duplicate admin pubkey".to_string(),
                });
            }
        }

        let relay_bytes = r.get_vec16()?;
        let mut relays = Vec::new();
        let mut rr = WireReader::new(relay_bytes);
        while !rr.is_empty() {
            let url = rr.get_string16()?;
            let url = RelayUrl::parse(&url).map_err(|e| CodecError::InvalidField {
                field: "relays",
                reason: e.to_string(),
            })?;
            relays.push(url);
        }

        let image_hash = r.get_array32()?;
        let image_key = r.get_array32()?;
        let mut image_nonce = [0u8; 12];
        image_nonce.copy_from_slice(r.get_fixed(12)?);

        r.expect_end("NostrGroupData")?;

        Ok(Self {
            version,
            nostr_group_id,
            name,
            description,
            admins,
            relays,
            image_hash,
            image_key,
            image_nonce,
        })
    }
}
