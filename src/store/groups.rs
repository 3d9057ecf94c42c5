//! Durable store of serialized group states.
//!
//! Records are keyed by the hex MLS group id, which never appears on
//! relays. For a given group id there is at most one record; `update`
//! replaces it atomically. The engine persists after every successful
//! epoch transition and removes only on explicit group removal.

use std::sync::Arc;

use crate::codec::{decode_client_state, encode_client_state};
use crate::error::{Error, Result};
use crate::mls::ClientState;

use super::{ChangeNotifier, StorageBackend, StoreChange, StoreError};

/// Keyed store of client states, one per group.
pub struct GroupStore {
    backend: Arc<dyn StorageBackend>,
    prefix: String,
    notifier: ChangeNotifier,
}

impl GroupStore {
    /// Creates a store over `backend`, namespaced under `prefix`.
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            notifier: ChangeNotifier::default(),
        }
    }

    /// Registers a callback fired on every mutation.
    pub fn on_change(&self, listener: impl Fn(&StoreChange) + Send + Sync + 'static) {
        self.notifier.subscribe(Box::new(listener));
    }

    fn backend_key(&self, key: &str) -> String {
        format!("{}/groups/{key}", self.prefix)
    }

    fn key_of(&self, backend_key: &str) -> Option<String> {
        backend_key
            .strip_prefix(&format!("{}/groups/", self.prefix))
            .map(ToString::to_string)
    }

    async fn write(&self, state: &ClientState) -> Result<String> {
        let key = state.group_id_hex();
        let json = encode_client_state(state)?;
        self.backend
            .set(&self.backend_key(&key), json.into_bytes())
            .await?;
        self.notifier.notify(&StoreChange::Put(key.clone()));
        Ok(key)
    }

    /// Inserts or replaces the state record; returns the store key.
    ///
    /// # Errors
    ///
    /// Fails on backend or serialization errors.
    pub async fn add(&self, state: &ClientState) -> Result<String> {
        self.write(state).await
    }

    /// Replaces the state record for its group id.
    ///
    /// # Errors
    ///
    /// Fails on backend or serialization errors.
    pub async fn update(&self, state: &ClientState) -> Result<()> {
        self.write(state).await.map(|_| ())
    }

    /// Loads the state stored under the hex group id.
    ///
    /// # Errors
    ///
    /// Fails on backend errors or a corrupt record.
    pub async fn get(&self, key: &str) -> Result<Option<ClientState>> {
        let Some(bytes) = self.backend.get(&self.backend_key(key)).await? else {
            return Ok(None);
        };
        let json = String::from_utf8(bytes).map_err(|e| {
            Error::Store(StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
        })?;
        let state = decode_client_state(&json).map_err(|e| {
            Error::Store(StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
        })?;
        Ok(Some(state))
    }

    /// Removes the record under the hex group id, if present.
    ///
    /// # Errors
    ///
    /// Fails on backend errors.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.backend.remove(&self.backend_key(key)).await?;
        self.notifier.notify(&StoreChange::Removed(key.to_string()));
        Ok(())
    }

    async fn store_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .backend
            .keys()
            .await?
            .iter()
            .filter_map(|k| self.key_of(k))
            .collect())
    }

    /// Loads every stored state.
    ///
    /// # Errors
    ///
    /// Fails on backend errors or a corrupt record.
    pub async fn list(&self) -> Result<Vec<ClientState>> {
        let mut out = Vec::new();
        for key in self.store_keys().await? {
            if let Some(state) = self.get(&key).await? {
                out.push(state);
            }
        }
        Ok(out)
    }

    /// Number of stored groups.
    ///
    /// # Errors
    ///
    /// Fails on backend errors.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.store_keys().await?.len())
    }

    /// Removes every record in this store's namespace.
    ///
    /// # Errors
    ///
    /// Fails on backend errors.
    pub async fn clear(&self) -> Result<()> {
        for key in self.store_keys().await? {
            self.backend.remove(&self.backend_key(&key)).await?;
        }
        self.notifier.notify(&StoreChange::Cleared);
        Ok(())
    }
}

impl std::fmt::Debug for GroupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
