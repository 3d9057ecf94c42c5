//! Per-identity orchestrator.
//!
//! A [`MarmotClient`] owns one identity's signer, stores, and network
//! handle. It publishes and revokes key packages, creates groups, joins
//! groups from welcomes, and hands out engine instances. At most one
//! [`MarmotGroup`] exists per group id per client; the facade caches the
//! instance so concurrent callers share it.

use std::collections::HashMap;
use std::sync::Arc;

use nostr::signer::NostrSigner;
use nostr::{Event, Keys, PublicKey, RelayUrl, UnsignedEvent};
use rand::RngCore;
use tokio::sync::Mutex;

use crate::codec::NostrGroupData;
use crate::error::{Error, Result};
use crate::event::{
    create_delete_key_package_event, create_key_package_event, create_relay_list_event,
    parse_welcome_rumor, unwrap_gift_wrap,
};
use crate::group::MarmotGroup;
use crate::mls::provider::CiphersuiteRegistry;
use crate::mls::{ClientState, CompleteKeyPackage, GroupId};
use crate::network::NetworkInterface;
use crate::store::{GroupStore, KeyPackageStore, StorageBackend};

/// Options for [`MarmotClient::publish_key_package`].
#[derive(Debug, Default)]
pub struct PublishKeyPackageOptions {
    /// Registry name of the ciphersuite; the default suite when absent.
    pub ciphersuite: Option<String>,
    /// Relays to publish the kind-443 event on.
    pub relays: Vec<RelayUrl>,
    /// Client name advertised in the event tags.
    pub client: Option<String>,
}

/// Options for [`MarmotClient::create_group`].
#[derive(Debug, Default)]
pub struct CreateGroupOptions {
    /// Group description.
    pub description: String,
    /// Additional admin pubkeys; the creator is always an admin.
    pub admin_pubkeys: Vec<PublicKey>,
    /// Group relays. At least one is required to publish traffic.
    pub relays: Vec<RelayUrl>,
    /// Registry name of the ciphersuite; the default suite when absent.
    pub ciphersuite: Option<String>,
    /// Founding key package; generated when absent.
    pub founder_key_package: Option<CompleteKeyPackage>,
}

/// Per-identity client facade.
pub struct MarmotClient {
    signer: Arc<dyn NostrSigner>,
    pubkey: PublicKey,
    ciphersuites: CiphersuiteRegistry,
    key_packages: Arc<KeyPackageStore>,
    group_store: Arc<GroupStore>,
    network: Arc<dyn NetworkInterface>,
    groups: Mutex<HashMap<String, Arc<Mutex<MarmotGroup>>>>,
}

impl MarmotClient {
    /// Builds a client for the signer's identity. Both stores share
    /// `backend`, namespaced under the identity's pubkey so one backend
    /// can host several identities.
    ///
    /// # Errors
    ///
    /// Fails when the signer cannot report its public key.
    pub async fn new(
        signer: Arc<dyn NostrSigner>,
        network: Arc<dyn NetworkInterface>,
        backend: Arc<dyn StorageBackend>,
        ciphersuites: CiphersuiteRegistry,
    ) -> Result<Self> {
        let pubkey = signer.get_public_key().await?;
        let prefix = pubkey.to_hex();
        let key_packages = Arc::new(KeyPackageStore::new(
            Arc::clone(&backend),
            ciphersuites.clone(),
            prefix.clone(),
        ));
        let group_store = Arc::new(GroupStore::new(backend, prefix));

        Ok(Self {
            signer,
            pubkey,
            ciphersuites,
            key_packages,
            group_store,
            network,
            groups: Mutex::new(HashMap::new()),
        })
    }

    /// The identity's public key.
    #[must_use]
    pub const fn pubkey(&self) -> &PublicKey {
        &self.pubkey
    }

    /// The identity's key-package store.
    #[must_use]
    pub fn key_packages(&self) -> &Arc<KeyPackageStore> {
        &self.key_packages
    }

    /// The identity's group store.
    #[must_use]
    pub fn group_store(&self) -> &Arc<GroupStore> {
        &self.group_store
    }

    fn suite_by_name(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn crate::mls::provider::Ciphersuite>> {
        let suite = match name {
            Some(name) => self.ciphersuites.by_name(name),
            None => self.ciphersuites.default_suite(),
        };
        suite.ok_or_else(|| {
            Error::Crypto(crate::mls::provider::CryptoError(format!(
                "no ciphersuite registered for {name:?}"
            )))
        })
    }

    /// Generates a complete key package, stores it, and publishes its
    /// public half as a kind-443 event.
    ///
    /// # Errors
    ///
    /// Fails on generation or store errors, and with
    /// [`Error::NoRelayReceivedEvent`] when no relay acknowledges.
    pub async fn publish_key_package(&self, options: PublishKeyPackageOptions) -> Result<Event> {
        if options.relays.is_empty() {
            return Err(Error::NoGroupRelays);
        }
        let suite = self.suite_by_name(options.ciphersuite.as_deref())?;
        let credential = crate::credential::Credential::new(&self.pubkey);
        let complete = suite.generate_key_package(credential)?;
        self.key_packages.add(&complete).await?;

        let event = create_key_package_event(
            &self.signer,
            &complete.public_package,
            &options.relays,
            options.client.as_deref(),
        )
        .await?;

        let result = self.network.publish(&options.relays, &event).await?;
        if !result.is_success() {
            return Err(Error::NoRelayReceivedEvent(event.id));
        }
        tracing::debug!(
            target: "marmot_core::client",
            event_id = %event.id,
            "published key package"
        );
        Ok(event)
    }

    /// Publishes the replaceable kind-10051 list naming the relays this
    /// identity's key packages live on.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NoRelayReceivedEvent`] when no relay
    /// acknowledges.
    pub async fn publish_key_package_relay_list(&self, relays: &[RelayUrl]) -> Result<Event> {
        let event = create_relay_list_event(&self.signer, relays).await?;
        let result = self.network.publish(relays, &event).await?;
        if !result.is_success() {
            return Err(Error::NoRelayReceivedEvent(event.id));
        }
        Ok(event)
    }

    /// Builds and publishes a NIP-09 deletion revoking previously
    /// published key-package events, targeting the relays those events
    /// advertise. Matching local records are dropped from the store.
    ///
    /// # Errors
    ///
    /// Fails when an event was not authored by this identity, when no
    /// target relays can be determined, or when no relay acknowledges.
    pub async fn delete_key_package(&self, events: &[Event]) -> Result<Event> {
        for event in events {
            if event.pubkey != self.pubkey {
                return Err(Error::InvalidEvent(
                    "cannot revoke another identity's key package".to_string(),
                ));
            }
        }

        let deletion = create_delete_key_package_event(&self.signer, events).await?;

        let mut relays: Vec<RelayUrl> = Vec::new();
        for event in events {
            for tag in event.tags.iter().filter(|t| t.kind() == nostr::TagKind::Relays) {
                for url in tag.clone().to_vec().into_iter().skip(1) {
                    if let Ok(url) = RelayUrl::parse(&url) {
                        if !relays.contains(&url) {
                            relays.push(url);
                        }
                    }
                }
            }
        }
        if relays.is_empty() {
            return Err(Error::NoGroupRelays);
        }

        let result = self.network.publish(&relays, &deletion).await?;
        if !result.is_success() {
            return Err(Error::NoRelayReceivedEvent(deletion.id));
        }

        // Drop the local records too; the secret half is useless once
        // the public half is revoked.
        for event in events {
            if let Ok(kp) = crate::event::parse_key_package_event(event) {
                if let Ok(key) = self.key_packages.ref_for(&kp) {
                    let _ = self.key_packages.remove(&key).await;
                }
            }
        }

        Ok(deletion)
    }

    /// Creates a new group with this identity as founder and admin.
    ///
    /// The MLS group id is 32 random bytes and never leaves the device;
    /// the Nostr group id relays see is generated independently inside
    /// the group data extension.
    ///
    /// # Errors
    ///
    /// Fails without relays, or on provider/store errors.
    pub async fn create_group(
        &self,
        name: impl Into<String>,
        options: CreateGroupOptions,
    ) -> Result<GroupId> {
        if options.relays.is_empty() {
            return Err(Error::NoGroupRelays);
        }
        let suite = self.suite_by_name(options.ciphersuite.as_deref())?;

        let mut admins = options.admin_pubkeys;
        admins.push(self.pubkey);

        let group_data = NostrGroupData::new(name, options.description, admins, options.relays);

        let founder = match options.founder_key_package {
            Some(complete) => complete,
            None => {
                let credential = crate::credential::Credential::new(&self.pubkey);
                suite.generate_key_package(credential)?
            }
        };

        let mut id_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let group_id = GroupId::from_slice(&id_bytes);

        let state = suite.create_group(group_id.clone(), &founder, &group_data)?;
        self.group_store.add(&state).await?;

        tracing::debug!(
            target: "marmot_core::client",
            group = %group_id.to_hex(),
            "created group"
        );
        Ok(group_id)
    }

    /// Loads a ready-to-use engine for a group, caching the instance so
    /// a group id never has two live engines in one client.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::GroupNotFound`] for unknown ids.
    pub async fn get_group(&self, group_id: &GroupId) -> Result<Arc<Mutex<MarmotGroup>>> {
        let key = group_id.to_hex();
        let mut groups = self.groups.lock().await;
        if let Some(existing) = groups.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let state = self
            .group_store
            .get(&key)
            .await?
            .ok_or(Error::GroupNotFound)?;
        let suite = self
            .ciphersuites
            .by_id(state.ciphersuite)
            .ok_or_else(|| {
                Error::Crypto(crate::mls::provider::CryptoError(format!(
                    "no ciphersuite registered for id {}",
                    state.ciphersuite
                )))
            })?;

        let group = MarmotGroup::new(
            state,
            Arc::clone(&self.group_store),
            suite,
            Arc::clone(&self.signer),
            Arc::clone(&self.network),
        )?;
        let group = Arc::new(Mutex::new(group));
        groups.insert(key, Arc::clone(&group));
        Ok(group)
    }

    /// Lists every stored group state.
    ///
    /// # Errors
    ///
    /// Fails on store errors.
    pub async fn list_groups(&self) -> Result<Vec<ClientState>> {
        self.group_store.list().await
    }

    /// Removes a group's state record and drops its cached engine.
    ///
    /// # Errors
    ///
    /// Fails on store errors.
    pub async fn remove_group(&self, group_id: &GroupId) -> Result<()> {
        let key = group_id.to_hex();
        self.groups.lock().await.remove(&key);
        self.group_store.remove(&key).await
    }

    /// Unwraps a kind-1059 gift wrap addressed to this identity and
    /// returns the inviter plus the inner welcome rumor.
    ///
    /// Unwrapping needs the identity's decryption keys, which remote
    /// signers do not expose; callers with local keys pass them here.
    ///
    /// # Errors
    ///
    /// Fails when the wrap is malformed or addressed elsewhere.
    pub async fn unwrap_welcome(
        &self,
        keys: &Keys,
        gift_wrap: &Event,
    ) -> Result<(PublicKey, UnsignedEvent)> {
        unwrap_gift_wrap(keys, gift_wrap).await
    }

    /// Joins a group from a welcome rumor by resolving which stored key
    /// package the welcome consumed, building the joiner state, and
    /// persisting it.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::KeyPackageNotFound`] when no stored package
    /// opens the welcome.
    pub async fn join_group_from_welcome(&self, rumor: &UnsignedEvent) -> Result<GroupId> {
        let (payload, _relays) = parse_welcome_rumor(rumor)?;

        for public in self.key_packages.list().await? {
            let key = self.key_packages.ref_for(&public)?;
            let Some(complete) = self.key_packages.get_complete(&key).await? else {
                continue;
            };
            let Some(suite) = self.ciphersuites.by_id(complete.public_package.ciphersuite)
            else {
                continue;
            };
            if let Ok(state) = suite.join_from_welcome(&payload, &complete) {
                let group_id = state.group_id.clone();
                self.group_store.add(&state).await?;
                tracing::debug!(
                    target: "marmot_core::client",
                    group = %group_id.to_hex(),
                    "joined group from welcome"
                );
                return Ok(group_id);
            }
        }
        Err(Error::KeyPackageNotFound)
    }
}

impl std::fmt::Debug for MarmotClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarmotClient")
            .field("pubkey", &self.pubkey.to_hex())
            .finish_non_exhaustive()
    }
}
