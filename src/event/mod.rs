//! Nostr event construction and parsing for the Marmot protocol.
//!
//! Marmot reserves these kinds:
//!
//! - 443 (`MlsKeyPackage`): publishable MLS key packages
//! - 444 (`MlsWelcome`): unsigned welcome rumors, only ever gift-wrapped
//! - 445 (`MlsGroupMessage`): encrypted in-band group traffic
//! - 1059 (`GiftWrap`): NIP-59 envelope delivering welcomes
//! - 10051: replaceable list of a user's key-package relays
//! - 5: NIP-09 deletion, used to revoke published key packages

mod group_message;
mod key_package;
mod welcome;

pub use group_message::{
    create_group_event, decrypt_group_event_content, derive_conversation_key, group_id_from_event,
};
pub use key_package::{
    create_delete_key_package_event, create_key_package_event, create_relay_list_event,
    parse_key_package_event, parse_relay_list_event,
};
pub use welcome::{create_gift_wrap, create_welcome_rumor, parse_welcome_rumor, unwrap_gift_wrap};

/// Kind of the replaceable key-package relay list event.
pub const KIND_KEY_PACKAGE_RELAY_LIST: u16 = 10_051;
