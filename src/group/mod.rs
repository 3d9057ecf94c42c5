//! The per-group protocol engine.
//!
//! A [`MarmotGroup`] owns one group's [`ClientState`] while loaded and
//! drives every state transition: outgoing proposals, commits with
//! welcome delivery, application messages, and the ingest path that
//! orders incoming traffic. Operations are sequential with respect to
//! the in-memory state; different groups may run in parallel tasks.

mod ingest;
mod proposal;

pub use ingest::{IngestOptions, IngestRun, ProcessResult};
pub use proposal::{ProposalAction, ProposalInput};

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use nostr::signer::NostrSigner;
use nostr::{JsonUtil, PublicKey, RelayUrl, UnsignedEvent};

use crate::codec::{MlsMessage, NostrGroupData, Proposal};
use crate::error::{Error, Result};
use crate::event::{create_gift_wrap, create_group_event, create_welcome_rumor};
use crate::mls::provider::{Ciphersuite, CryptoError};
use crate::mls::{ClientState, GroupId};
use crate::network::{NetworkInterface, PublishResult};
use crate::store::GroupStore;

/// Bound on resolving a welcome recipient's inbox relays.
const INBOX_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for [`MarmotGroup::commit`].
#[derive(Debug, Default)]
pub struct CommitOptions {
    /// Proposals committed inline, ahead of any referenced ones.
    pub extra_proposals: Vec<ProposalInput>,
    /// Hex refs into the pending proposal set.
    pub proposal_refs: Vec<String>,
}

/// Outcome of delivering one welcome after a commit.
#[derive(Debug)]
pub struct WelcomeOutcome {
    /// The newly added member the welcome was addressed to.
    pub recipient: PublicKey,
    /// Publish result, or why delivery failed. Failures never roll back
    /// the committed epoch; the admin retries delivery out of band.
    pub result: std::result::Result<PublishResult, Error>,
}

/// Result of a successful [`MarmotGroup::commit`].
#[derive(Debug)]
pub struct CommitResponse {
    /// Relay responses for the commit event itself.
    pub commit: PublishResult,
    /// Per-recipient welcome delivery outcomes.
    pub welcomes: Vec<WelcomeOutcome>,
}

/// The per-group state machine.
pub struct MarmotGroup {
    state: ClientState,
    dirty: bool,
    group_data: NostrGroupData,
    store: Arc<GroupStore>,
    ciphersuite: Arc<dyn Ciphersuite>,
    signer: Arc<dyn NostrSigner>,
    network: Arc<dyn NetworkInterface>,
}

impl MarmotGroup {
    /// Binds a loaded state to its environment.
    ///
    /// # Errors
    ///
    /// Fails when the state carries no Marmot group data extension.
    pub fn new(
        state: ClientState,
        store: Arc<GroupStore>,
        ciphersuite: Arc<dyn Ciphersuite>,
        signer: Arc<dyn NostrSigner>,
        network: Arc<dyn NetworkInterface>,
    ) -> Result<Self> {
        let group_data = state.group_data()?;
        Ok(Self {
            state,
            dirty: false,
            group_data,
            store,
            ciphersuite,
            signer,
            network,
        })
    }

    /// The private MLS group id.
    #[must_use]
    pub const fn group_id(&self) -> &GroupId {
        &self.state.group_id
    }

    /// The public Nostr group id relays route on.
    #[must_use]
    pub const fn nostr_group_id(&self) -> &[u8; 32] {
        &self.group_data.nostr_group_id
    }

    /// Current epoch.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.state.epoch
    }

    /// The cached Nostr group metadata.
    #[must_use]
    pub const fn group_data(&self) -> &NostrGroupData {
        &self.group_data
    }

    /// The in-memory client state.
    #[must_use]
    pub const fn state(&self) -> &ClientState {
        &self.state
    }

    /// Whether the in-memory state has unsaved changes.
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Current member pubkeys, in leaf order.
    #[must_use]
    pub fn members(&self) -> Vec<PublicKey> {
        self.state.members()
    }

    fn relays(&self) -> Result<Vec<RelayUrl>> {
        if self.group_data.relays.is_empty() {
            return Err(Error::NoGroupRelays);
        }
        Ok(self.group_data.relays.clone())
    }

    fn exporter_at(&self, state: &ClientState, epoch: u64) -> Result<zeroize::Zeroizing<[u8; 32]>> {
        self.ciphersuite
            .exporter_secret(state, epoch)?
            .ok_or_else(|| {
                Error::Crypto(CryptoError(format!("no exporter secret for epoch {epoch}")))
            })
    }

    /// Builds, encrypts, and publishes proposals without touching local
    /// state: a proposal takes effect only when it returns through
    /// [`MarmotGroup::ingest`], so every member (the proposer included)
    /// stages it the same way.
    ///
    /// # Errors
    ///
    /// Fails on missing relays, proposal construction errors, envelope
    /// errors, or when a proposal event gets no relay acknowledgment.
    pub async fn propose(&self, input: ProposalInput) -> Result<Vec<PublishResult>> {
        let relays = self.relays()?;
        let proposals = input.resolve(&self.state)?;

        let mut responses = Vec::with_capacity(proposals.len());
        for proposal in &proposals {
            let message = self
                .ciphersuite
                .create_proposal_message(&self.state, proposal)?;
            let exporter = self.exporter_at(&self.state, self.state.epoch)?;
            let event = create_group_event(
                &self.signer,
                &self.group_data.nostr_group_id,
                &exporter,
                &message,
            )
            .await?;

            let result = self.network.publish(&relays, &event).await?;
            if !result.is_success() {
                return Err(Error::NoRelayReceivedEvent(event.id));
            }
            tracing::debug!(
                target: "marmot_core::group",
                event_id = %event.id,
                "published proposal"
            );
            responses.push(result);
        }
        Ok(responses)
    }

    /// Serializes a rumor canonically, seals it as an application
    /// message, and publishes it to the group relays. On the first relay
    /// acknowledgment the sender ratchet advance becomes authoritative
    /// and is persisted; with zero acknowledgments local state is
    /// untouched.
    ///
    /// # Errors
    ///
    /// Fails on missing relays, envelope errors, or
    /// [`Error::NoRelayReceivedEvent`] when no relay acknowledges.
    pub async fn send_application_rumor(
        &mut self,
        mut rumor: UnsignedEvent,
    ) -> Result<PublishResult> {
        let relays = self.relays()?;
        rumor.ensure_id();
        let payload = rumor.as_json();

        let (new_state, message) = self
            .ciphersuite
            .create_application_message(&self.state, payload.as_bytes())?;

        let exporter = self.exporter_at(&self.state, self.state.epoch)?;
        let event = create_group_event(
            &self.signer,
            &self.group_data.nostr_group_id,
            &exporter,
            &message,
        )
        .await?;

        let result = self.network.publish(&relays, &event).await?;
        if !result.is_success() {
            return Err(Error::NoRelayReceivedEvent(event.id));
        }

        self.state = new_state;
        self.dirty = true;
        self.save().await?;
        Ok(result)
    }

    /// Commits pending and/or inline proposals, advancing the epoch.
    ///
    /// Admins only. The commit event is encrypted under the post-commit
    /// exporter secret and published first; local state advances on the
    /// first relay acknowledgment and is persisted before any welcome
    /// leaves the device, so welcome failures cannot resurrect the old
    /// epoch. Welcomes for members added by the committed proposals are
    /// gift-wrapped and sent to each recipient's inbox relays in
    /// parallel; their failures are reported, not fatal.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotAdmin`] for non-admin identities,
    /// [`Error::ProposalRefNotFound`] for stale refs, and
    /// [`Error::NoRelayReceivedEvent`] when no relay acknowledges the
    /// commit (state unchanged).
    pub async fn commit(&mut self, options: CommitOptions) -> Result<CommitResponse> {
        let relays = self.relays()?;

        let own_pubkey = self.signer.get_public_key().await?;
        if !self.group_data.is_admin(&own_pubkey) {
            return Err(Error::NotAdmin);
        }

        let mut all_proposals: Vec<Proposal> = Vec::new();
        for input in &options.extra_proposals {
            all_proposals.extend(input.resolve(&self.state)?);
        }
        for proposal_ref in &options.proposal_refs {
            let proposal = self
                .state
                .unapplied_proposals
                .get(proposal_ref)
                .cloned()
                .ok_or_else(|| Error::ProposalRefNotFound(proposal_ref.clone()))?;
            all_proposals.push(proposal);
        }

        // The committed set: explicit proposals, or the whole pending set
        // when the commit drains implicitly. Welcome recipients are the
        // members added by this set.
        let committed: Vec<Proposal> = if all_proposals.is_empty() {
            self.state.unapplied_proposals.values().cloned().collect()
        } else {
            all_proposals.clone()
        };

        let output = self.ciphersuite.create_commit(&self.state, &all_proposals)?;

        let exporter = self.exporter_at(&output.new_state, output.new_state.epoch)?;
        let event = create_group_event(
            &self.signer,
            &self.group_data.nostr_group_id,
            &exporter,
            &output.commit,
        )
        .await?;

        let commit_result = self.network.publish(&relays, &event).await?;
        if !commit_result.is_success() {
            return Err(Error::NoRelayReceivedEvent(event.id));
        }
        for (relay, reason) in &commit_result.rejected_by {
            tracing::warn!(
                target: "marmot_core::group",
                %relay,
                reason = %reason,
                "relay rejected commit"
            );
        }

        // First acknowledgment makes the commit locally authoritative.
        self.state = output.new_state;
        self.group_data = self.state.group_data()?;
        self.dirty = true;
        self.save().await?;

        let welcomes = match output.welcome {
            Some(payload) => {
                self.deliver_welcomes(&committed, payload, &own_pubkey)
                    .await
            }
            None => Vec::new(),
        };

        Ok(CommitResponse {
            commit: commit_result,
            welcomes,
        })
    }

    /// Gift-wraps and sends the welcome to every member added by the
    /// committed proposals, in parallel. Individual failures are
    /// collected, logged, and returned.
    async fn deliver_welcomes(
        &self,
        committed: &[Proposal],
        welcome_payload: Vec<u8>,
        author: &PublicKey,
    ) -> Vec<WelcomeOutcome> {
        let recipients: Vec<PublicKey> = committed
            .iter()
            .filter_map(|proposal| match proposal {
                Proposal::Add { key_package } => key_package.pubkey().ok(),
                _ => None,
            })
            .collect();

        let welcome = MlsMessage::welcome(welcome_payload);

        let sends = recipients.into_iter().map(|recipient| {
            let welcome = welcome.clone();
            async move {
                let result = self.send_one_welcome(&welcome, author, recipient).await;
                if let Err(e) = &result {
                    tracing::warn!(
                        target: "marmot_core::group",
                        recipient = %recipient.to_hex(),
                        error = %e,
                        "welcome delivery failed"
                    );
                }
                WelcomeOutcome { recipient, result }
            }
        });

        join_all(sends).await
    }

    async fn send_one_welcome(
        &self,
        welcome: &MlsMessage,
        author: &PublicKey,
        recipient: PublicKey,
    ) -> Result<PublishResult> {
        let rumor = create_welcome_rumor(author, welcome, &self.group_data.relays)?;
        let gift_wrap = create_gift_wrap(&self.signer, &recipient, rumor).await?;

        let inbox = tokio::time::timeout(
            INBOX_RESOLUTION_TIMEOUT,
            self.network.inbox_relays(&recipient),
        )
        .await
        .map_err(|_| {
            Error::Network(crate::network::NetworkError::Timeout(
                "inbox relay resolution timed out".to_string(),
            ))
        })??;

        let result = self.network.publish(&inbox, &gift_wrap).await?;
        if !result.is_success() {
            return Err(Error::NoRelayReceivedEvent(gift_wrap.id));
        }
        Ok(result)
    }

    /// Persists the in-memory state if it has unsaved changes. The dirty
    /// flag clears only on a successful write.
    ///
    /// # Errors
    ///
    /// Fails on store errors; the in-memory state stays consistent.
    pub async fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.store.update(&self.state).await?;
        self.dirty = false;
        Ok(())
    }
}

impl std::fmt::Debug for MarmotGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarmotGroup")
            .field("group_id", &self.state.group_id.to_hex())
            .field("epoch", &self.state.epoch)
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}
