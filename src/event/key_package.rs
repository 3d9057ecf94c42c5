//! Kind-443 key-package events, their NIP-09 revocation, and the
//! kind-10051 key-package relay list.

use nostr::signer::NostrSigner;
use nostr::{Event, EventBuilder, Kind, RelayUrl, Tag, TagKind};

use crate::error::{Error, Result};
use crate::mls::KeyPackage;

use super::KIND_KEY_PACKAGE_RELAY_LIST;

/// Builds and signs a kind-443 event carrying a public key package.
///
/// The content is the hex-serialized package; tags carry the protocol
/// version, ciphersuite, supported extensions, the relays the package is
/// published on, and optionally the publishing client's name.
///
/// # Errors
///
/// Fails if the package does not encode or the signer refuses.
pub async fn create_key_package_event(
    signer: &std::sync::Arc<dyn NostrSigner>,
    key_package: &KeyPackage,
    relays: &[RelayUrl],
    client_name: Option<&str>,
) -> Result<Event> {
    let content = hex::encode(key_package.encode()?);

    let extensions = key_package
        .leaf_node
        .capabilities
        .extensions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut tags = vec![
        Tag::custom(TagKind::MlsProtocolVersion, ["1.0"]),
        Tag::custom(TagKind::MlsCiphersuite, [key_package.ciphersuite.to_string()]),
        Tag::custom(TagKind::MlsExtensions, [extensions]),
        Tag::relays(relays.iter().cloned()),
    ];
    if let Some(name) = client_name {
        tags.push(Tag::custom(TagKind::custom("client"), [name]));
    }

    let pubkey = signer.get_public_key().await?;
    let unsigned = EventBuilder::new(Kind::MlsKeyPackage, content)
        .tags(tags)
        .build(pubkey);
    Ok(signer.sign_event(unsigned).await?)
}

/// Parses and validates a kind-443 event back into a public key package.
///
/// Tag parsing is first-occurrence-wins; the protocol version tag, when
/// present, must say `1.0`.
///
/// # Errors
///
/// Fails on a wrong kind, a version mismatch, or undecodable content.
pub fn parse_key_package_event(event: &Event) -> Result<KeyPackage> {
    if event.kind != Kind::MlsKeyPackage {
        return Err(Error::InvalidEvent(format!(
            "expected kind {}, got {}",
            Kind::MlsKeyPackage.as_u16(),
            event.kind.as_u16()
        )));
    }

    if let Some(version) = event
        .tags
        .iter()
        .find(|tag| tag.kind() == TagKind::MlsProtocolVersion)
        .and_then(|tag| tag.content())
    {
        if version != "1.0" {
            return Err(Error::InvalidEvent(format!(
                "unsupported mls protocol version {version:?}"
            )));
        }
    }

    let bytes = hex::decode(&event.content)
        .map_err(|e| Error::InvalidEvent(format!("key package content is not hex: {e}")))?;
    Ok(KeyPackage::decode(&bytes)?)
}

/// Builds and signs a NIP-09 deletion event revoking previously
/// published key-package events.
///
/// # Errors
///
/// Fails when `events` is empty, contains a non-key-package event, or
/// the signer refuses.
pub async fn create_delete_key_package_event(
    signer: &std::sync::Arc<dyn NostrSigner>,
    events: &[Event],
) -> Result<Event> {
    if events.is_empty() {
        return Err(Error::InvalidEvent(
            "no key package events to delete".to_string(),
        ));
    }
    for event in events {
        if event.kind != Kind::MlsKeyPackage {
            return Err(Error::InvalidEvent(format!(
                "cannot revoke kind {} as a key package",
                event.kind.as_u16()
            )));
        }
    }

    let mut tags: Vec<Tag> = events.iter().map(|e| Tag::event(e.id)).collect();
    tags.push(Tag::custom(
        TagKind::custom("k"),
        [Kind::MlsKeyPackage.as_u16().to_string()],
    ));

    let pubkey = signer.get_public_key().await?;
    let unsigned = EventBuilder::new(Kind::EventDeletion, "key package deleted")
        .tags(tags)
        .build(pubkey);
    Ok(signer.sign_event(unsigned).await?)
}

/// Builds and signs the replaceable kind-10051 event listing the relays
/// this identity publishes key packages on.
///
/// # Errors
///
/// Fails when `relays` is empty or the signer refuses.
pub async fn create_relay_list_event(
    signer: &std::sync::Arc<dyn NostrSigner>,
    relays: &[RelayUrl],
) -> Result<Event> {
    if relays.is_empty() {
        return Err(Error::NoGroupRelays);
    }
    let tags: Vec<Tag> = relays
        .iter()
        .map(|url| Tag::custom(TagKind::Relay, [url.to_string()]))
        .collect();

    let pubkey = signer.get_public_key().await?;
    let unsigned = EventBuilder::new(Kind::Custom(KIND_KEY_PACKAGE_RELAY_LIST), "")
        .tags(tags)
        .build(pubkey);
    Ok(signer.sign_event(unsigned).await?)
}

/// Extracts the relay URLs from a kind-10051 relay list event.
///
/// # Errors
///
/// Fails on a wrong kind; unparseable relay tags are skipped.
pub fn parse_relay_list_event(event: &Event) -> Result<Vec<RelayUrl>> {
    if event.kind != Kind::Custom(KIND_KEY_PACKAGE_RELAY_LIST) {
        return Err(Error::InvalidEvent(format!(
            "expected kind {KIND_KEY_PACKAGE_RELAY_LIST}, got {}",
            event.kind.as_u16()
        )));
    }
    Ok(event
        .tags
        .iter()
        .filter(|tag| tag.kind() == TagKind::Relay)
        .filter_map(|tag| tag.content().and_then(|c| RelayUrl::parse(c).ok()))
        .collect())
}
