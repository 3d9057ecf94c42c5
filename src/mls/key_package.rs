//! Marmot defaults for key-package generation.
//!
//! Providers build key packages with these capabilities and lifetime so
//! every Marmot client advertises support for the group data extension.

use std::time::{SystemTime, UNIX_EPOCH};

use super::{Capabilities, Lifetime};
use crate::codec::group_data::GROUP_DATA_EXTENSION_TYPE;
use crate::codec::MLS_PROTOCOL_VERSION;
use crate::credential::CREDENTIAL_TYPE_BASIC;

/// MLS ratchet tree extension type.
const EXTENSION_RATCHET_TREE: u16 = 0x0002;

/// MLS required capabilities extension type.
const EXTENSION_REQUIRED_CAPABILITIES: u16 = 0x0003;

/// Default key-package validity window: 90 days.
const DEFAULT_LIFETIME_SECS: u64 = 90 * 24 * 60 * 60;

/// The capabilities every Marmot key package advertises: MLS 1.0, the
/// generating ciphersuite, the standard group extensions, and the Marmot
/// group data extension.
#[must_use]
pub fn default_capabilities(ciphersuite: u16) -> Capabilities {
    Capabilities {
        versions: vec![MLS_PROTOCOL_VERSION],
        ciphersuites: vec![ciphersuite],
        extensions: vec![
            EXTENSION_RATCHET_TREE,
            EXTENSION_REQUIRED_CAPABILITIES,
            GROUP_DATA_EXTENSION_TYPE,
        ],
        proposals: vec![],
        credentials: vec![CREDENTIAL_TYPE_BASIC],
    }
}

/// The default lifetime window starting now.
#[must_use]
pub fn default_lifetime() -> Lifetime {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    Lifetime {
        not_before: now,
        not_after: now + DEFAULT_LIFETIME_SECS,
    }
}
