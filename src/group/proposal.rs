//! Proposal inputs for the group engine.
//!
//! Callers hand the engine either a ready proposal or an action that
//! builds proposals against the state at execution time. The stock
//! builders cover the common membership and metadata operations.

use nostr::PublicKey;

use crate::codec::{NostrGroupData, Proposal};
use crate::error::{Error, Result};
use crate::mls::ClientState;

/// A deferred proposal construction: runs against the current state when
/// the engine executes it.
pub type ProposalAction = Box<dyn Fn(&ClientState) -> Result<Vec<Proposal>> + Send + Sync>;

/// Input accepted by `propose` and `commit`: a ready proposal or an
/// action producing one or more.
pub enum ProposalInput {
    /// A proposal built ahead of time.
    Direct(Proposal),
    /// A context-dependent construction.
    Action(ProposalAction),
}

impl ProposalInput {
    /// Resolves this input against `state`.
    ///
    /// # Errors
    ///
    /// Propagates the action's failure as [`Error::ProposalBuild`].
    pub fn resolve(&self, state: &ClientState) -> Result<Vec<Proposal>> {
        match self {
            Self::Direct(proposal) => Ok(vec![proposal.clone()]),
            Self::Action(action) => action(state),
        }
    }

    /// Proposes adding the member described by `key_package`.
    #[must_use]
    pub fn add_member(key_package: crate::mls::KeyPackage) -> Self {
        Self::Direct(Proposal::Add { key_package })
    }

    /// Proposes removing the member holding `pubkey`.
    ///
    /// Resolution fails when the pubkey is not in the ratchet tree.
    #[must_use]
    pub fn remove_member(pubkey: PublicKey) -> Self {
        Self::Action(Box::new(move |state| {
            let removed = state.leaf_index_of(&pubkey).ok_or_else(|| {
                Error::ProposalBuild(format!("{} is not a group member", pubkey.to_hex()))
            })?;
            Ok(vec![Proposal::Remove { removed }])
        }))
    }

    /// Proposes replacing the group's Nostr metadata (name, description,
    /// admins, relays, image) while keeping every other extension.
    #[must_use]
    pub fn update_group_data(data: NostrGroupData) -> Self {
        Self::Action(Box::new(move |state| {
            let mut staged = state.clone();
            staged
                .set_group_data(&data)
                .map_err(|e| Error::ProposalBuild(e.to_string()))?;
            Ok(vec![Proposal::GroupContextExtensions {
                extensions: staged.extensions,
            }])
        }))
    }
}

impl From<Proposal> for ProposalInput {
    fn from(proposal: Proposal) -> Self {
        Self::Direct(proposal)
    }
}

impl std::fmt::Debug for ProposalInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(proposal) => f.debug_tuple("Direct").field(proposal).finish(),
            Self::Action(_) => f.write_str("Action(..)"),
        }
    }
}
