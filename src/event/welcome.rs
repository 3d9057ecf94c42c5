//! Kind-444 welcome rumors and their NIP-59 gift wrap.
//!
//! A welcome rumor stays unsigned so it cannot be published bare even if
//! it leaks; it becomes deliverable only inside a kind-1059 gift wrap
//! addressed to the new member. The wrap is built under a fresh ephemeral
//! key with a randomized timestamp, so relays learn nothing but the
//! recipient.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use nostr::nips::nip59::UnwrappedGift;
use nostr::signer::NostrSigner;
use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, RelayUrl, Tag, Timestamp, UnsignedEvent};

use crate::codec::{MlsMessage, MlsMessageBody};
use crate::error::{Error, Result};

/// Builds the unsigned kind-444 rumor carrying a serialized MLS welcome
/// and the group's relays.
///
/// # Errors
///
/// Fails if the welcome message does not encode or is not a welcome.
pub fn create_welcome_rumor(
    author: &PublicKey,
    welcome: &MlsMessage,
    group_relays: &[RelayUrl],
) -> Result<UnsignedEvent> {
    if !matches!(welcome.body, MlsMessageBody::Welcome(_)) {
        return Err(Error::InvalidEvent(
            "welcome rumor payload must be an MLS welcome".to_string(),
        ));
    }
    let content = BASE64.encode(welcome.encode()?);
    let tags = vec![Tag::relays(group_relays.iter().cloned())];
    let mut rumor = UnsignedEvent::new(
        *author,
        Timestamp::now(),
        Kind::MlsWelcome,
        tags,
        content,
    );
    rumor.ensure_id();
    Ok(rumor)
}

/// Parses a kind-444 rumor back into the welcome payload and the group
/// relays it advertises.
///
/// # Errors
///
/// Fails on a wrong kind, malformed base64, or a non-welcome payload.
pub fn parse_welcome_rumor(rumor: &UnsignedEvent) -> Result<(Vec<u8>, Vec<RelayUrl>)> {
    if rumor.kind != Kind::MlsWelcome {
        return Err(Error::InvalidEvent(format!(
            "expected kind {}, got {}",
            Kind::MlsWelcome.as_u16(),
            rumor.kind.as_u16()
        )));
    }
    let bytes = BASE64
        .decode(&rumor.content)
        .map_err(|e| Error::InvalidEvent(format!("welcome content is not base64: {e}")))?;
    let message = MlsMessage::decode(&bytes)?;
    let MlsMessageBody::Welcome(payload) = message.body else {
        return Err(Error::InvalidEvent(
            "welcome rumor does not carry an MLS welcome".to_string(),
        ));
    };

    let relays = rumor
        .tags
        .iter()
        .filter(|tag| tag.kind() == nostr::TagKind::Relays)
        .flat_map(|tag| tag.clone().to_vec().into_iter().skip(1))
        .filter_map(|url| RelayUrl::parse(&url).ok())
        .collect();

    Ok((payload, relays))
}

/// Gift wraps a welcome rumor to `recipient` (NIP-59, kind 1059).
///
/// The outer layer uses a single-use ephemeral key; the seal inside is
/// signed by `signer` so the recipient can authenticate the inviter.
///
/// # Errors
///
/// Fails when the rumor is not kind 444 or wrapping fails.
pub async fn create_gift_wrap(
    signer: &std::sync::Arc<dyn NostrSigner>,
    recipient: &PublicKey,
    rumor: UnsignedEvent,
) -> Result<Event> {
    if rumor.kind != Kind::MlsWelcome {
        return Err(Error::InvalidEvent(format!(
            "gift wrap payload must be kind {}, got {}",
            Kind::MlsWelcome.as_u16(),
            rumor.kind.as_u16()
        )));
    }
    EventBuilder::gift_wrap(signer, recipient, rumor, [])
        .await
        .map_err(|e| Error::Signer(e.to_string()))
}

/// Unwraps a received kind-1059 gift wrap into the inviter's pubkey and
/// the inner welcome rumor.
///
/// # Errors
///
/// Fails when the event is not a gift wrap, is addressed to someone
/// else, or the inner rumor is not kind 444.
pub async fn unwrap_gift_wrap(
    recipient_keys: &Keys,
    gift_wrap: &Event,
) -> Result<(PublicKey, UnsignedEvent)> {
    if gift_wrap.kind != Kind::GiftWrap {
        return Err(Error::InvalidEvent(format!(
            "expected kind {}, got {}",
            Kind::GiftWrap.as_u16(),
            gift_wrap.kind.as_u16()
        )));
    }

    let unwrapped = UnwrappedGift::from_gift_wrap(recipient_keys, gift_wrap)
        .await
        .map_err(|e| Error::InvalidEvent(format!("gift unwrap failed: {e}")))?;

    if unwrapped.rumor.kind != Kind::MlsWelcome {
        return Err(Error::InvalidEvent(format!(
            "gift wrap does not contain a kind {} welcome, got {}",
            Kind::MlsWelcome.as_u16(),
            unwrapped.rumor.kind.as_u16()
        )));
    }

    Ok((unwrapped.sender, unwrapped.rumor))
}
