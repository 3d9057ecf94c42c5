//! Batch ingest: the concurrency-critical path.
//!
//! Converts encrypted group events into a deterministic epoch advance,
//! tolerating out-of-order arrival and concurrent commits. Non-commits
//! are applied before commits within a batch so referenced proposals are
//! pending when their commit is evaluated; commits at the same epoch are
//! totally ordered by `(epoch, created_at, event id)` so every honest
//! member picks the same winner. Events that fail trial decryption or
//! processing are requeued and retried, bounded by the retry budget.
//!
//! Ingest is a lazy sequence: [`MarmotGroup::ingest`] returns an
//! [`IngestRun`] that yields one [`ProcessResult`] per
//! [`IngestRun::next`] call, decrypting and processing only as far as
//! the consumer pulls. Dropping the run at any yield boundary cancels
//! the rest of the batch.

use std::collections::VecDeque;

use nostr::{Event, EventId, JsonUtil, Kind, UnsignedEvent};

use crate::codec::{ContentType, MlsMessage, WireFormat};
use crate::error::{Error, Result};
use crate::event::{decrypt_group_event_content, group_id_from_event};
use crate::mls::provider::ProcessedMessage;

use super::MarmotGroup;

/// Ingest tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    /// How many requeue rounds may run without the batch draining.
    pub max_retries: u32,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self { max_retries: 5 }
    }
}

/// One processed incoming event, in yield order.
#[derive(Debug)]
pub enum ProcessResult {
    /// A commit advanced the group to `epoch`.
    Commit {
        /// Wrapper event id.
        event_id: EventId,
        /// The epoch after the commit applied.
        epoch: u64,
    },
    /// A proposal entered the pending set.
    Proposal {
        /// Wrapper event id.
        event_id: EventId,
        /// Hex ref of the staged proposal; absent when the proposal was
        /// already pending (duplicate delivery).
        proposal_ref: Option<String>,
    },
    /// A decrypted application message.
    ApplicationMessage {
        /// Wrapper event id.
        event_id: EventId,
        /// The decrypted rumor.
        rumor: UnsignedEvent,
    },
}

/// A lazy ingest in progress over one group.
///
/// Each [`IngestRun::next`] call does just enough work to produce the
/// next result: application messages become observable as soon as they
/// decrypt, without waiting for the rest of the batch or for any retry
/// round. State is persisted at the end of every round that ran.
///
/// Dropping the run stops the batch at the last yield boundary. Results
/// already yielded stay applied in memory; they reach the store on the
/// group's next save.
pub struct IngestRun<'g> {
    group: &'g mut MarmotGroup,
    options: IngestOptions,
    /// Events awaiting trial decryption in the upcoming round.
    pending: Vec<Event>,
    retry_count: u32,
    /// Decrypted items of the current round: non-commits in arrival
    /// order, then commits in tiebreak order.
    queue: VecDeque<(Event, MlsMessage)>,
    /// Events requeued for the next round.
    unreadable: Vec<Event>,
    /// Whether a round is mid-flight (queue drained but not yet saved).
    mid_round: bool,
}

impl MarmotGroup {
    /// Starts a lazy ingest over a batch of group events.
    ///
    /// The returned run yields results as they are produced; consume it
    /// with [`IngestRun::next`], or [`IngestRun::collect`] to drain the
    /// whole batch.
    pub fn ingest(&mut self, events: Vec<Event>, options: IngestOptions) -> IngestRun<'_> {
        IngestRun {
            group: self,
            options,
            pending: events,
            retry_count: 0,
            queue: VecDeque::new(),
            unreadable: Vec::new(),
            mid_round: false,
        }
    }

    /// Trial-decrypts a batch against every epoch this state can key:
    /// the recorded exporter history plus the next epoch when the
    /// provider can derive it. The envelope does not reveal its epoch, so
    /// failure only means "not yet readable".
    fn decrypt_batch(&self, events: &[Event]) -> (Vec<(Event, MlsMessage)>, Vec<Event>) {
        let mut candidate_epochs: Vec<u64> = vec![self.state.epoch, self.state.epoch + 1];
        for epoch in self.state.exporter_secrets.keys().rev() {
            if !candidate_epochs.contains(epoch) {
                candidate_epochs.push(*epoch);
            }
        }

        let mut read = Vec::new();
        let mut unreadable = Vec::new();

        'events: for event in events {
            if event.kind != Kind::MlsGroupMessage {
                tracing::debug!(
                    target: "marmot_core::group::ingest",
                    event_id = %event.id,
                    kind = event.kind.as_u16(),
                    "skipping non-group-message event"
                );
                continue;
            }
            match group_id_from_event(event) {
                Ok(id) if id == self.group_data.nostr_group_id => {}
                _ => {
                    tracing::debug!(
                        target: "marmot_core::group::ingest",
                        event_id = %event.id,
                        "skipping event for another group"
                    );
                    continue;
                }
            }

            for epoch in &candidate_epochs {
                let Ok(Some(secret)) = self.ciphersuite.exporter_secret(&self.state, *epoch)
                else {
                    continue;
                };
                if let Ok(plaintext) = decrypt_group_event_content(&event.content, &secret) {
                    if let Ok(message) = MlsMessage::decode(&plaintext) {
                        read.push((event.clone(), message));
                        continue 'events;
                    }
                }
            }
            unreadable.push(event.clone());
        }

        (read, unreadable)
    }

    /// Total order for concurrent commits: smaller epoch, then smaller
    /// `created_at`, then lexicographically smaller event id.
    fn sort_commits(mut commits: Vec<(Event, MlsMessage)>) -> Vec<(Event, MlsMessage)> {
        commits.sort_by(|(a_evt, a_msg), (b_evt, b_msg)| {
            a_msg
                .epoch()
                .cmp(&b_msg.epoch())
                .then_with(|| a_evt.created_at.cmp(&b_evt.created_at))
                .then_with(|| a_evt.id.to_hex().cmp(&b_evt.id.to_hex()))
        });
        commits
    }

    fn apply_non_commit(&mut self, event: &Event, message: &MlsMessage) -> Result<ProcessResult> {
        let content_type = message.content_type();
        let processed = self.ciphersuite.process_message(&self.state, message)?;

        match processed {
            ProcessedMessage::StateUpdated(new_state) => {
                let proposal_ref = match content_type {
                    Some(ContentType::Proposal) => new_state
                        .unapplied_proposals
                        .keys()
                        .find(|k| !self.state.unapplied_proposals.contains_key(*k))
                        .cloned(),
                    _ => None,
                };
                self.state = new_state;
                self.dirty = true;
                Ok(ProcessResult::Proposal {
                    event_id: event.id,
                    proposal_ref,
                })
            }
            ProcessedMessage::Application { new_state, data } => {
                let rumor = UnsignedEvent::from_json(&data)
                    .map_err(|e| Error::InvalidEvent(format!("application rumor: {e}")))?;
                self.state = new_state;
                self.dirty = true;
                Ok(ProcessResult::ApplicationMessage {
                    event_id: event.id,
                    rumor,
                })
            }
        }
    }

    fn apply_commit(&mut self, event: &Event, message: &MlsMessage) -> Result<ProcessResult> {
        let processed = self.ciphersuite.process_message(&self.state, message)?;
        match processed {
            ProcessedMessage::StateUpdated(new_state) => {
                let epoch = new_state.epoch;
                self.state = new_state;
                self.group_data = self.state.group_data()?;
                self.dirty = true;
                tracing::debug!(
                    target: "marmot_core::group::ingest",
                    event_id = %event.id,
                    epoch,
                    "commit applied"
                );
                Ok(ProcessResult::Commit {
                    event_id: event.id,
                    epoch,
                })
            }
            ProcessedMessage::Application { .. } => Err(Error::InvalidEvent(
                "commit message decrypted to application data".to_string(),
            )),
        }
    }
}

impl IngestRun<'_> {
    /// Produces the next processing result, or `None` once the batch has
    /// drained. The consumer may stop calling (or drop the run) at any
    /// yield boundary.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::MaxRetriesExceeded`] when a retry round makes
    /// no progress beyond the budget, or on store errors while
    /// persisting at a round boundary.
    pub async fn next(&mut self) -> Result<Option<ProcessResult>> {
        loop {
            // Drain the current round's queue first.
            while let Some((event, message)) = self.queue.pop_front() {
                if message.is_private_commit() {
                    if let Some(result) = self.step_commit(&event, &message) {
                        return Ok(Some(result));
                    }
                } else if let Some(result) = self.step_non_commit(&event, &message) {
                    return Ok(Some(result));
                }
            }

            // End of a round: persist, then promote the requeued events.
            if self.mid_round {
                self.group.save().await?;
                self.mid_round = false;
                if self.unreadable.is_empty() {
                    self.pending.clear();
                    return Ok(None);
                }
                self.pending = std::mem::take(&mut self.unreadable);
                self.retry_count += 1;
            }

            if self.retry_count > self.options.max_retries {
                return Err(Error::MaxRetriesExceeded(self.options.max_retries));
            }
            if self.pending.is_empty() {
                return Ok(None);
            }

            let (read, unreadable) = self.group.decrypt_batch(&self.pending);
            self.pending.clear();

            if read.is_empty() {
                if unreadable.is_empty() {
                    return Ok(None);
                }
                self.pending = unreadable;
                self.retry_count += 1;
                continue;
            }

            let (commits, non_commits): (Vec<_>, Vec<_>) = read
                .into_iter()
                .partition(|(_, msg)| msg.is_private_commit());

            // Proposals and application messages first, in arrival order,
            // so commits in the same round see their proposals staged.
            self.queue.extend(non_commits);
            self.queue.extend(MarmotGroup::sort_commits(commits));
            self.unreadable = unreadable;
            self.mid_round = true;
        }
    }

    /// Drains the rest of the run into a vector, in yield order.
    ///
    /// # Errors
    ///
    /// Same conditions as [`IngestRun::next`].
    pub async fn collect(mut self) -> Result<Vec<ProcessResult>> {
        let mut results = Vec::new();
        while let Some(result) = self.next().await? {
            results.push(result);
        }
        Ok(results)
    }

    /// Processes one non-commit item; `None` when it was skipped or
    /// requeued rather than yielded.
    fn step_non_commit(&mut self, event: &Event, message: &MlsMessage) -> Option<ProcessResult> {
        if !matches!(
            message.wire_format(),
            WireFormat::PrivateMessage | WireFormat::PublicMessage
        ) {
            tracing::debug!(
                target: "marmot_core::group::ingest",
                event_id = %event.id,
                "skipping non-framed in-band message"
            );
            return None;
        }
        match self.group.apply_non_commit(event, message) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::debug!(
                    target: "marmot_core::group::ingest",
                    event_id = %event.id,
                    error = %e,
                    "requeueing unprocessable message"
                );
                self.unreadable.push(event.clone());
                None
            }
        }
    }

    /// Processes one commit item; `None` when it was stale, requeued, or
    /// failed.
    fn step_commit(&mut self, event: &Event, message: &MlsMessage) -> Option<ProcessResult> {
        let commit_epoch = message.epoch()?;
        if commit_epoch < self.group.state.epoch {
            // Already superseded: either applied or lost the same-epoch
            // tiebreak.
            tracing::debug!(
                target: "marmot_core::group::ingest",
                event_id = %event.id,
                commit_epoch,
                current = self.group.state.epoch,
                "dropping stale commit"
            );
            return None;
        }
        if commit_epoch > self.group.state.epoch + 1 {
            // Too far ahead; may become applicable after an earlier
            // commit lands.
            self.unreadable.push(event.clone());
            return None;
        }
        match self.group.apply_commit(event, message) {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::debug!(
                    target: "marmot_core::group::ingest",
                    event_id = %event.id,
                    error = %e,
                    "requeueing unprocessable commit"
                );
                self.unreadable.push(event.clone());
                None
            }
        }
    }
}

impl std::fmt::Debug for IngestRun<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestRun")
            .field("pending", &self.pending.len())
            .field("queued", &self.queue.len())
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}
