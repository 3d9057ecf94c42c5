//! The kind-445 group message envelope.
//!
//! Group traffic is encrypted twice: the MLS layer seals the framed
//! content, then the serialized MLS message is NIP-44 v2 encrypted with a
//! key derived from the epoch exporter secret and base64'd into the event
//! content. Relays route on the single `h` tag carrying the public Nostr
//! group id and never see the MLS group id.
//!
//! Exporter secrets rotate on every commit, so keys are never reused
//! across epochs. Decryption is trial-based: the envelope does not reveal
//! its epoch until the NIP-44 layer opens.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use nostr::nips::nip44::v2::{self, ConversationKey};
use nostr::signer::NostrSigner;
use nostr::{Event, EventBuilder, Kind, Tag, TagKind};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::codec::MlsMessage;
use crate::error::{Error, Result};
use crate::mls::provider::CryptoError;

/// HKDF info string binding the conversation key to this protocol.
const EXPORTER_INFO: &[u8] = b"marmot/nostr";

/// Derives the NIP-44 conversation key from an epoch exporter secret.
///
/// HKDF-SHA256 extract-then-expand with the protocol info string; the
/// caller's copy of the key is wiped on drop.
#[must_use]
pub fn derive_conversation_key(exporter_secret: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, exporter_secret);
    let mut okm = Zeroizing::new([0u8; 32]);
    // 32 bytes is always a valid HKDF-SHA256 output length.
    let _ = hk.expand(EXPORTER_INFO, &mut *okm);
    okm
}

/// Encrypts an MLS message into a signed kind-445 event.
///
/// # Errors
///
/// Fails if the message does not encode, NIP-44 rejects the plaintext,
/// or the signer refuses.
pub async fn create_group_event(
    signer: &std::sync::Arc<dyn NostrSigner>,
    nostr_group_id: &[u8; 32],
    exporter_secret: &[u8; 32],
    message: &MlsMessage,
) -> Result<Event> {
    let plaintext = message.encode()?;

    let key = derive_conversation_key(exporter_secret);
    let conversation_key = ConversationKey::new(*key);
    let ciphertext = v2::encrypt_to_bytes(&conversation_key, &plaintext)
        .map_err(|e| Error::Crypto(CryptoError(e.to_string())))?;

    let pubkey = signer.get_public_key().await?;
    let unsigned = EventBuilder::new(Kind::MlsGroupMessage, BASE64.encode(ciphertext))
        .tags([Tag::custom(TagKind::h(), [hex::encode(nostr_group_id)])])
        .build(pubkey);
    Ok(signer.sign_event(unsigned).await?)
}

/// Attempts to open a group event's content under one exporter secret.
///
/// Returns the serialized MLS message on success. A failure only means
/// this candidate epoch did not match; callers trial other epochs and
/// requeue the event when none fit.
///
/// # Errors
///
/// Fails on malformed base64 or a NIP-44 authentication failure.
pub fn decrypt_group_event_content(
    content: &str,
    exporter_secret: &[u8; 32],
) -> Result<Vec<u8>> {
    let ciphertext = BASE64
        .decode(content)
        .map_err(|e| Error::InvalidEvent(format!("group event content is not base64: {e}")))?;

    let key = derive_conversation_key(exporter_secret);
    let conversation_key = ConversationKey::new(*key);
    v2::decrypt_to_bytes(&conversation_key, &ciphertext)
        .map_err(|e| Error::Crypto(CryptoError(e.to_string())))
}

/// Reads the public Nostr group id from a kind-445 event's `h` tag.
///
/// # Errors
///
/// Fails on a wrong kind or a missing/malformed `h` tag.
pub fn group_id_from_event(event: &Event) -> Result<[u8; 32]> {
    if event.kind != Kind::MlsGroupMessage {
        return Err(Error::InvalidEvent(format!(
            "expected kind {}, got {}",
            Kind::MlsGroupMessage.as_u16(),
            event.kind.as_u16()
        )));
    }
    let tag = event
        .tags
        .iter()
        .find(|tag| tag.kind() == TagKind::h())
        .ok_or_else(|| Error::InvalidEvent("missing h tag".to_string()))?;
    let content = tag
        .content()
        .ok_or_else(|| Error::InvalidEvent("empty h tag".to_string()))?;
    let bytes =
        hex::decode(content).map_err(|e| Error::InvalidEvent(format!("h tag is not hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidEvent("h tag is not 32 bytes".to_string()))
}
