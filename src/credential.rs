//! MLS basic credentials bound to Nostr public keys.
//!
//! A Marmot credential is an MLS basic credential whose identity is the
//! member's Nostr public key. Two identity encodings exist in the wild:
//! the canonical form stores the raw 32 key bytes, an older form stores
//! the 64-character hex string as UTF-8. Both are accepted when reading;
//! only the raw form is ever produced.

use nostr::PublicKey;

use crate::error::{Error, Result};

/// MLS credential type discriminant for basic credentials.
pub const CREDENTIAL_TYPE_BASIC: u16 = 1;

/// An MLS basic credential carrying a Nostr identity.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Credential {
    /// Credential type; always basic.
    pub credential_type: u16,
    /// Identity bytes: raw 32-byte pubkey (canonical) or utf8 hex (legacy).
    pub identity: Vec<u8>,
}

impl Credential {
    /// Builds the canonical credential for a Nostr public key.
    #[must_use]
    pub fn new(pubkey: &PublicKey) -> Self {
        Self {
            credential_type: CREDENTIAL_TYPE_BASIC,
            identity: pubkey.to_bytes().to_vec(),
        }
    }

    /// Builds a credential from a 64-character hex pubkey string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPubkey`] unless `pubkey_hex` is exactly 64
    /// hex characters naming a valid public key.
    pub fn from_hex(pubkey_hex: &str) -> Result<Self> {
        if pubkey_hex.len() != 64 || !pubkey_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidPubkey(format!(
                "expected 64 hex characters, got {:?}",
                pubkey_hex
            )));
        }
        let pubkey = PublicKey::from_hex(pubkey_hex)
            .map_err(|e| Error::InvalidPubkey(e.to_string()))?;
        Ok(Self::new(&pubkey))
    }

    /// Extracts the Nostr public key from the identity bytes.
    ///
    /// Accepts both the canonical raw form and the legacy utf8-hex form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCredential`] for any other identity shape.
    pub fn pubkey(&self) -> Result<PublicKey> {
        if self.credential_type != CREDENTIAL_TYPE_BASIC {
            return Err(Error::InvalidCredential(format!(
                "unsupported credential type {}",
                self.credential_type
            )));
        }
        match self.identity.len() {
            32 => PublicKey::from_slice(&self.identity)
                .map_err(|e| Error::InvalidCredential(e.to_string())),
            64 => {
                let hex_str = std::str::from_utf8(&self.identity)
                    .map_err(|e| Error::InvalidCredential(e.to_string()))?;
                PublicKey::from_hex(hex_str).map_err(|e| Error::InvalidCredential(e.to_string()))
            }
            n => Err(Error::InvalidCredential(format!(
                "identity must be 32 raw bytes or 64 hex bytes, got {n}"
            ))),
        }
    }

    /// Extracts the public key as lowercase hex.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Credential::pubkey`].
    pub fn pubkey_hex(&self) -> Result<String> {
        Ok(self.pubkey()?.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBKEY: &str = "884704bd421671e01c13f854d2ce23ce2a5bfe9562f4f297ad2bc921ba30c3a6";

    #[test]
    fn from_hex_produces_raw_identity() {
        let cred = Credential::from_hex(PUBKEY).unwrap();
        assert_eq!(cred.credential_type, CREDENTIAL_TYPE_BASIC);
        assert_eq!(cred.identity.len(), 32);
        assert_eq!(hex::encode(&cred.identity), PUBKEY);
    }

    #[test]
    fn pubkey_roundtrip() {
        let cred = Credential::from_hex(PUBKEY).unwrap();
        assert_eq!(cred.pubkey_hex().unwrap(), PUBKEY);
    }

    #[test]
    fn legacy_utf8_hex_identity_resolves() {
        let cred = Credential {
            credential_type: CREDENTIAL_TYPE_BASIC,
            identity: PUBKEY.as_bytes().to_vec(),
        };
        assert_eq!(cred.identity.len(), 64);
        assert_eq!(cred.pubkey_hex().unwrap(), PUBKEY);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(matches!(
            Credential::from_hex("abcd").unwrap_err(),
            Error::InvalidPubkey(_)
        ));
        let too_long = format!("{PUBKEY}00");
        assert!(Credential::from_hex(&too_long).is_err());
    }

    #[test]
    fn from_hex_rejects_non_hex() {
        let bad = "g".repeat(64);
        assert!(matches!(
            Credential::from_hex(&bad).unwrap_err(),
            Error::InvalidPubkey(_)
        ));
    }

    #[test]
    fn pubkey_rejects_other_identity_lengths() {
        let cred = Credential {
            credential_type: CREDENTIAL_TYPE_BASIC,
            identity: vec![1, 2, 3],
        };
        assert!(matches!(
            cred.pubkey().unwrap_err(),
            Error::InvalidCredential(_)
        ));
    }

    #[test]
    fn pubkey_rejects_non_basic_type() {
        let cred = Credential {
            credential_type: 2,
            identity: vec![0u8; 32],
        };
        assert!(cred.pubkey().is_err());
    }

    #[test]
    fn new_matches_from_hex() {
        let pk = PublicKey::from_hex(PUBKEY).unwrap();
        assert_eq!(Credential::new(&pk), Credential::from_hex(PUBKEY).unwrap());
    }
}
