//! Relay network access.
//!
//! The engine consumes the network through [`NetworkInterface`] so tests
//! and embedders can substitute their own transport. [`RelayNetwork`]
//! is the production implementation over a `nostr-sdk` relay pool.

use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, EventId, Filter, Kind, PublicKey, RelayUrl, TagKind};
use nostr_sdk::{Client, RelayPoolNotification};
use thiserror::Error;
use tokio::sync::mpsc;

/// Default timeout for relay operations, including inbox-relay resolution.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Replaceable event kind listing a user's inbox (DM) relays.
const KIND_INBOX_RELAYS: u16 = 10_050;

/// Errors from the relay transport.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// A relay URL failed validation.
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    /// Publishing failed before any relay answered.
    #[error("publish failed: {0}")]
    Publish(String),

    /// A subscription could not be established.
    #[error("subscription failed: {0}")]
    Subscription(String),

    /// A one-shot request failed.
    #[error("request failed: {0}")]
    Request(String),

    /// The operation timed out.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The pubkey published no usable inbox relay list.
    #[error("no inbox relays known for {0}")]
    NoInboxRelays(PublicKey),
}

/// Result type for network operations.
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

/// Per-relay outcome of publishing one event.
#[derive(Debug, Clone)]
pub struct PublishResult {
    /// Id of the published event.
    pub event_id: EventId,
    /// Relays that acknowledged the event.
    pub accepted_by: Vec<RelayUrl>,
    /// Relays that rejected it, with their reasons.
    pub rejected_by: Vec<(RelayUrl, String)>,
}

impl PublishResult {
    /// Whether at least one relay acknowledged the event.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.accepted_by.is_empty()
    }
}

/// Abstract relay transport consumed by the engine.
///
/// In-flight operations honor cancellation from the caller's runtime;
/// the engine itself owns no timers beyond the inbox-relay bound.
#[async_trait]
pub trait NetworkInterface: Send + Sync {
    /// Fetches all events matching `filter` from `relays`; terminates on
    /// end-of-stored-events.
    async fn request(&self, relays: &[RelayUrl], filter: Filter) -> NetworkResult<Vec<Event>>;

    /// Opens a live subscription; events arrive on the returned channel.
    async fn subscribe(
        &self,
        relays: &[RelayUrl],
        filter: Filter,
    ) -> NetworkResult<mpsc::Receiver<Event>>;

    /// Publishes `event` to `relays`, reporting per-relay outcomes.
    async fn publish(&self, relays: &[RelayUrl], event: &Event) -> NetworkResult<PublishResult>;

    /// Resolves the inbox relays a pubkey receives gift wraps on.
    /// Yields at least one URL or fails.
    async fn inbox_relays(&self, pubkey: &PublicKey) -> NetworkResult<Vec<RelayUrl>>;
}

/// Relay-pool-backed network implementation.
pub struct RelayNetwork {
    client: Client,
}

impl RelayNetwork {
    /// Wraps an existing relay-pool client. The client needs no signer;
    /// all events arrive pre-signed.
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Ensures `relays` are in the pool and connected.
    async fn connect_relays(&self, relays: &[RelayUrl]) -> NetworkResult<()> {
        for url in relays {
            // Adding an already-known relay is harmless.
            let _: Result<bool, _> = self.client.add_relay(url.as_str()).await;
        }
        self.client.connect().await;
        Ok(())
    }

    /// Extracts relay URLs from `["relay", url]` tags across events.
    fn relay_urls_from_events(events: Vec<Event>) -> Vec<RelayUrl> {
        events
            .into_iter()
            .flat_map(|e| e.tags)
            .filter(|tag| tag.kind() == TagKind::Relay)
            .filter_map(|tag| tag.content().and_then(|c| RelayUrl::parse(c).ok()))
            .collect()
    }
}

#[async_trait]
impl NetworkInterface for RelayNetwork {
    async fn request(&self, relays: &[RelayUrl], filter: Filter) -> NetworkResult<Vec<Event>> {
        self.connect_relays(relays).await?;
        let urls: Vec<String> = relays.iter().map(ToString::to_string).collect();
        let events = self
            .client
            .fetch_events_from(urls, filter, DEFAULT_TIMEOUT)
            .await
            .map_err(|e| NetworkError::Request(e.to_string()))?;
        Ok(events.into_iter().collect())
    }

    async fn subscribe(
        &self,
        relays: &[RelayUrl],
        filter: Filter,
    ) -> NetworkResult<mpsc::Receiver<Event>> {
        self.connect_relays(relays).await?;
        let output = self
            .client
            .subscribe(filter, None)
            .await
            .map_err(|e| NetworkError::Subscription(e.to_string()))?;

        let (tx, rx) = mpsc::channel(100);
        let client = self.client.clone();
        let subscription_id = output.val;

        tokio::spawn(async move {
            let _ = client
                .handle_notifications(|notification| async {
                    if let RelayPoolNotification::Event { event, .. } = notification {
                        if tx.send((*event).clone()).await.is_err() {
                            // Receiver dropped, stop handling.
                            return Ok(true);
                        }
                    }
                    Ok(false)
                })
                .await;
            client.unsubscribe(&subscription_id).await;
        });

        Ok(rx)
    }

    async fn publish(&self, relays: &[RelayUrl], event: &Event) -> NetworkResult<PublishResult> {
        self.connect_relays(relays).await?;
        let urls: Vec<String> = relays.iter().map(ToString::to_string).collect();

        let send_result = tokio::time::timeout(
            DEFAULT_TIMEOUT,
            self.client.send_event_to(urls, event),
        )
        .await
        .map_err(|_| NetworkError::Timeout("event publish timed out".to_string()))?
        .map_err(|e| NetworkError::Publish(e.to_string()))?;

        let accepted_by: Vec<RelayUrl> = send_result.success.iter().cloned().collect();
        let rejected_by: Vec<(RelayUrl, String)> = send_result
            .failed
            .iter()
            .map(|(url, error)| (url.clone(), error.clone()))
            .collect();

        Ok(PublishResult {
            event_id: event.id,
            accepted_by,
            rejected_by,
        })
    }

    async fn inbox_relays(&self, pubkey: &PublicKey) -> NetworkResult<Vec<RelayUrl>> {
        let filter = Filter::new()
            .kind(Kind::Custom(KIND_INBOX_RELAYS))
            .author(*pubkey);
        let events = self
            .client
            .fetch_events(filter, DEFAULT_TIMEOUT)
            .await
            .map_err(|e| NetworkError::Request(e.to_string()))?;

        let urls = Self::relay_urls_from_events(events.into_iter().collect());
        if urls.is_empty() {
            return Err(NetworkError::NoInboxRelays(*pubkey));
        }
        Ok(urls)
    }
}

impl std::fmt::Debug for RelayNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayNetwork").finish_non_exhaustive()
    }
}
