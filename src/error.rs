//! Error types crossing the engine boundary.

use nostr::EventId;
use thiserror::Error;

use crate::codec::CodecError;
use crate::mls::provider::CryptoError;
use crate::network::NetworkError;
use crate::store::StoreError;

/// Errors surfaced by the group engine and the client facade.
#[derive(Error, Debug)]
pub enum Error {
    /// A Nostr public key was not 64 lowercase hex characters.
    #[error("invalid pubkey: {0}")]
    InvalidPubkey(String),

    /// A credential identity was neither raw 32 bytes nor 64-char hex.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// A wire codec rejected its input.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The group state carries no Marmot group data extension.
    #[error("nostr group data extension not found")]
    GroupDataNotFound,

    /// The group data extension lists no relays to publish on.
    #[error("group has no relays")]
    NoGroupRelays,

    /// The signing identity is not in the group's admin set.
    #[error("not an admin of this group")]
    NotAdmin,

    /// A commit referenced a proposal that is not pending.
    #[error("proposal ref not found: {0}")]
    ProposalRefNotFound(String),

    /// A proposal action failed to build its proposals.
    #[error("proposal build failed: {0}")]
    ProposalBuild(String),

    /// No relay acknowledged the published event; local state unchanged.
    #[error("no relay received event {0}")]
    NoRelayReceivedEvent(EventId),

    /// Ingest made no progress within the retry budget.
    #[error("max ingest retries exceeded ({0})")]
    MaxRetriesExceeded(u32),

    /// No group state stored under the requested group id.
    #[error("group not found")]
    GroupNotFound,

    /// No key package stored under the requested reference.
    #[error("key package not found")]
    KeyPackageNotFound,

    /// An event failed structural validation (kind, tags, content).
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Transport failure from the network interface.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Opaque failure from the ciphersuite provider.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Storage backend failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Event signing failed.
    #[error("signer: {0}")]
    Signer(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<nostr::signer::SignerError> for Error {
    fn from(e: nostr::signer::SignerError) -> Self {
        Self::Signer(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_not_admin() {
        assert_eq!(Error::NotAdmin.to_string(), "not an admin of this group");
    }

    #[test]
    fn error_display_no_relay_received_event() {
        let id = EventId::all_zeros();
        let err = Error::NoRelayReceivedEvent(id);
        assert!(err.to_string().contains("no relay received event"));
        assert!(err.to_string().contains(&id.to_hex()));
    }

    #[test]
    fn error_display_max_retries() {
        assert_eq!(
            Error::MaxRetriesExceeded(5).to_string(),
            "max ingest retries exceeded (5)"
        );
    }

    #[test]
    fn codec_error_converts() {
        let err: Error = CodecError::TrailingBytes("test").into();
        assert!(matches!(err, Error::Codec(_)));
    }
}
