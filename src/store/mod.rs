//! Durable stores for key packages and group state.
//!
//! Both stores sit on a pluggable key-value backend and are namespaced by
//! a per-identity prefix so one backend can host several identities
//! without collisions. Backends must provide atomic single-key writes;
//! the stores never need multi-key transactions. Every mutation fires the
//! store's change listeners.

mod groups;
mod key_packages;

pub use groups::GroupStore;
pub use key_packages::KeyPackageStore;

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors from the storage layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend failed to read or write.
    #[error("storage backend: {0}")]
    Backend(String),

    /// A stored record failed to decode.
    #[error("corrupt record at {key}: {reason}")]
    Corrupt {
        /// Store-local key of the bad record.
        key: String,
        /// Decode failure description.
        reason: String,
    },
}

/// Result type for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Pluggable key-value backend shared by the stores.
///
/// Implementations must serialize concurrent writes to the same key with
/// last-write-wins semantics; writes to different keys may proceed in
/// parallel.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reads the value at `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Upserts `value` at `key`.
    async fn set(&self, key: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Removes `key` if present.
    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Removes every key in the backend.
    async fn clear(&self) -> StoreResult<()>;

    /// Lists every key in the backend.
    async fn keys(&self) -> StoreResult<Vec<String>>;
}

/// In-memory backend. The default for tests and ephemeral identities.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    map: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.map.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.map.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        self.map.write().await.clear();
        Ok(())
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.map.read().await.keys().cloned().collect())
    }
}

/// A single store mutation, delivered to change listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// A record was added or replaced under the store-local key.
    Put(String),
    /// The record under the store-local key was removed.
    Removed(String),
    /// Every record in the store was removed.
    Cleared,
}

type ChangeListener = Box<dyn Fn(&StoreChange) + Send + Sync>;

/// Callback registry fired on every store mutation.
#[derive(Default)]
pub(crate) struct ChangeNotifier {
    listeners: Mutex<Vec<ChangeListener>>,
}

impl ChangeNotifier {
    pub(crate) fn subscribe(&self, listener: ChangeListener) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    pub(crate) fn notify(&self, change: &StoreChange) {
        if let Ok(listeners) = self.listeners.lock() {
            for listener in listeners.iter() {
                listener(change);
            }
        }
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.listeners.lock().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("ChangeNotifier").field("listeners", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn memory_backend_set_get_remove() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("a").await.unwrap(), None);

        backend.set("a", vec![1, 2, 3]).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some(vec![1, 2, 3]));

        backend.set("a", vec![4]).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some(vec![4]));

        backend.remove("a").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_backend_keys_and_clear() {
        let backend = MemoryBackend::new();
        backend.set("x/1", vec![]).await.unwrap();
        backend.set("x/2", vec![]).await.unwrap();

        let mut keys = backend.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["x/1", "x/2"]);

        backend.clear().await.unwrap();
        assert!(backend.keys().await.unwrap().is_empty());
    }

    #[test]
    fn notifier_fires_all_listeners() {
        let notifier = ChangeNotifier::default();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            notifier.subscribe(Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        notifier.notify(&StoreChange::Cleared);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn notifier_passes_change_details() {
        let notifier = ChangeNotifier::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            notifier.subscribe(Box::new(move |change| {
                if let Ok(mut seen) = seen.lock() {
                    seen.push(change.clone());
                }
            }));
        }

        notifier.notify(&StoreChange::Put("abc".to_string()));
        notifier.notify(&StoreChange::Removed("abc".to_string()));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                StoreChange::Put("abc".to_string()),
                StoreChange::Removed("abc".to_string())
            ]
        );
    }
}
