//! Marmot Core Library
//!
//! Client-side engine for Marmot: end-to-end encrypted group messaging
//! that layers MLS group keying on top of the Nostr relay network. A
//! [`MarmotClient`] manages one identity's key packages and groups; each
//! [`group::MarmotGroup`] drives one group's replicated MLS state
//! machine, whose transcript travels as encrypted kind-445 events on the
//! group's relays.
//!
//! The MLS cryptography itself is consumed through the
//! [`mls::provider::Ciphersuite`] seam; relay transport through
//! [`network::NetworkInterface`]; signing through `nostr::NostrSigner`.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

// Prevent accidental release builds with test-utils enabled.
// The test-utils feature enables a ciphersuite with no real cryptography
// which must never be used in production.
#[cfg(all(feature = "test-utils", not(debug_assertions)))]
compile_error!(
    "The 'test-utils' feature enables a non-cryptographic test ciphersuite and must not be \
     used in release builds. Remove the 'test-utils' feature from your Cargo.toml for \
     production builds."
);

pub mod client;
pub mod codec;
pub mod credential;
pub mod error;
pub mod event;
pub mod group;
pub mod mls;
pub mod network;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_util;

pub use client::{CreateGroupOptions, MarmotClient, PublishKeyPackageOptions};
pub use error::{Error, Result};
pub use group::{
    CommitOptions, CommitResponse, IngestOptions, IngestRun, MarmotGroup, ProcessResult,
    ProposalInput, WelcomeOutcome,
};
