//! Durable store of complete key packages.
//!
//! Records are keyed by the hex key-package reference, the ciphersuite
//! KDF over the serialized public package. A record is written when the
//! local identity generates a package, consumed when another member's
//! commit adds that package to a group, and removable afterwards.

use std::sync::Arc;

use crate::codec::{decode_complete_key_package, encode_complete_key_package};
use crate::error::{Error, Result};
use crate::mls::provider::CiphersuiteRegistry;
use crate::mls::{CompleteKeyPackage, KeyPackage, PrivateKeyPackage};

use super::{ChangeNotifier, StorageBackend, StoreChange, StoreError};

/// Keyed store of `(publicPackage, privatePackage)` pairs.
pub struct KeyPackageStore {
    backend: Arc<dyn StorageBackend>,
    ciphersuites: CiphersuiteRegistry,
    prefix: String,
    notifier: ChangeNotifier,
}

impl KeyPackageStore {
    /// Creates a store over `backend`, namespaced under `prefix`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        ciphersuites: CiphersuiteRegistry,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            ciphersuites,
            prefix: prefix.into(),
            notifier: ChangeNotifier::default(),
        }
    }

    /// Registers a callback fired on every mutation.
    pub fn on_change(&self, listener: impl Fn(&StoreChange) + Send + Sync + 'static) {
        self.notifier.subscribe(Box::new(listener));
    }

    fn backend_key(&self, key: &str) -> String {
        format!("{}/keypackages/{key}", self.prefix)
    }

    fn key_of(&self, backend_key: &str) -> Option<String> {
        backend_key
            .strip_prefix(&format!("{}/keypackages/", self.prefix))
            .map(ToString::to_string)
    }

    /// Computes the hex store key for a public package.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if the package's ciphersuite is unknown
    /// or the reference KDF fails.
    pub fn ref_for(&self, package: &KeyPackage) -> Result<String> {
        let suite = self
            .ciphersuites
            .by_id(package.ciphersuite)
            .ok_or_else(|| {
                crate::mls::provider::CryptoError(format!(
                    "unknown ciphersuite {}",
                    package.ciphersuite
                ))
            })?;
        Ok(suite.key_package_ref(package)?.to_hex())
    }

    /// Upserts a complete key package and returns its store key.
    ///
    /// # Errors
    ///
    /// Fails on backend errors or an unresolvable ciphersuite.
    pub async fn add(&self, complete: &CompleteKeyPackage) -> Result<String> {
        let key = self.ref_for(&complete.public_package)?;
        let bytes = encode_complete_key_package(complete)?;
        self.backend.set(&self.backend_key(&key), bytes).await?;
        self.notifier.notify(&StoreChange::Put(key.clone()));
        Ok(key)
    }

    async fn load(&self, key: &str) -> Result<Option<CompleteKeyPackage>> {
        let Some(bytes) = self.backend.get(&self.backend_key(key)).await? else {
            return Ok(None);
        };
        let complete = decode_complete_key_package(&bytes).map_err(|e| {
            Error::Store(StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
        })?;
        Ok(Some(complete))
    }

    /// Fetches the complete pair under `key`.
    ///
    /// # Errors
    ///
    /// Fails on backend errors or a corrupt record.
    pub async fn get_complete(&self, key: &str) -> Result<Option<CompleteKeyPackage>> {
        self.load(key).await
    }

    /// Fetches the public half under `key`.
    ///
    /// # Errors
    ///
    /// Fails on backend errors or a corrupt record.
    pub async fn get_public(&self, key: &str) -> Result<Option<KeyPackage>> {
        Ok(self.load(key).await?.map(|c| c.public_package))
    }

    /// Fetches the private half under `key`.
    ///
    /// # Errors
    ///
    /// Fails on backend errors or a corrupt record.
    pub async fn get_private(&self, key: &str) -> Result<Option<PrivateKeyPackage>> {
        Ok(self.load(key).await?.map(|c| c.private_package))
    }

    /// Returns whether a record exists under `key`.
    ///
    /// # Errors
    ///
    /// Fails on backend errors.
    pub async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.backend.get(&self.backend_key(key)).await?.is_some())
    }

    /// Removes the record under `key` if present.
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

    /// Number of stored packages.
    ///
    /// # Errors
    ///
    /// Fails on backend errors.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.store_keys().await?.len())
    }

    /// Lists the public halves of every stored package.
    ///
    /// # Errors
    ///
    /// Fails on backend errors or a corrupt record.
    pub async fn list(&self) -> Result<Vec<KeyPackage>> {
        let mut out = Vec::new();
        for key in self.store_keys().await? {
            if let Some(complete) = self.load(&key).await? {
                out.push(complete.public_package);
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for KeyPackageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPackageStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
