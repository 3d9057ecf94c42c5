//! Byte-exact wire codecs for the Marmot protocol.
//!
//! Every format in this module is big-endian, length-prefixed in the TLS
//! presentation style, and must match other Marmot implementations
//! byte-for-byte. Each codec is a pair of `encode`/`decode` functions over
//! plain byte slices; nothing here touches the network or storage.

pub mod group_data;
pub mod mls;
pub mod state;
pub mod wire;

pub use group_data::{NostrGroupData, GROUP_DATA_EXTENSION_TYPE, GROUP_DATA_VERSION};
pub use mls::{
    decode_complete_key_package, encode_complete_key_package, Commit, ContentBody, ContentType,
    FramedContent, MlsMessage, MlsMessageBody, PrivateMessage, Proposal, PublicMessage, WireFormat,
    MLS_PROTOCOL_VERSION,
};
pub use state::{decode_client_state, encode_client_state};
pub use wire::{WireReader, WireWriter};

use thiserror::Error;

/// Errors produced by the wire codecs.
///
/// A codec error is always fatal to the operation that triggered it and
/// never leaves partial state behind.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Input ended before the structure was complete.
    #[error("truncated input: needed {needed} more bytes")]
    Truncated {
        /// How many bytes were missing.
        needed: usize,
    },

    /// A length prefix or fixed-size field had an impossible value.
    #[error("invalid length: {0}")]
    InvalidLength(String),

    /// A string field was not valid UTF-8.
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// An enum discriminant had no defined meaning.
    #[error("unknown discriminant {value} for {field}")]
    UnknownDiscriminant {
        /// The field being decoded.
        field: &'static str,
        /// The value found on the wire.
        value: u64,
    },

    /// Trailing bytes remained after a complete structure was decoded.
    #[error("trailing bytes after {0}")]
    TrailingBytes(&'static str),

    /// A field failed semantic validation (pubkey, relay URL, …).
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        /// The field being decoded.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// JSON state serialization failed.
    #[error("state serialization: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;
