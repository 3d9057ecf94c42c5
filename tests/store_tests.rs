//! Store contracts: key-package round-trips, group-state persistence,
//! prefix isolation between identities, and change notifications.

mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use helpers::test_registry;
use marmot_core::codec::NostrGroupData;
use marmot_core::credential::Credential;
use marmot_core::mls::provider::Ciphersuite;
use marmot_core::mls::GroupId;
use marmot_core::store::{GroupStore, KeyPackageStore, MemoryBackend, StoreChange};
use marmot_core::test_util::TestCiphersuite;
use nostr::Keys;

fn key_package_store(backend: &Arc<MemoryBackend>, prefix: &str) -> KeyPackageStore {
    KeyPackageStore::new(
        Arc::clone(backend) as Arc<dyn marmot_core::store::StorageBackend>,
        test_registry(),
        prefix,
    )
}

fn group_store(backend: &Arc<MemoryBackend>, prefix: &str) -> GroupStore {
    GroupStore::new(
        Arc::clone(backend) as Arc<dyn marmot_core::store::StorageBackend>,
        prefix,
    )
}

fn test_state(keys: &Keys) -> marmot_core::mls::ClientState {
    let group_data = NostrGroupData::new(
        "store test",
        "",
        [keys.public_key()],
        [nostr::RelayUrl::parse("wss://relay.test").unwrap()],
    );
    let complete = TestCiphersuite
        .generate_key_package(Credential::new(&keys.public_key()))
        .unwrap();
    TestCiphersuite
        .create_group(GroupId::from_slice(&[7u8; 32]), &complete, &group_data)
        .unwrap()
}

/// S6: add, look up, count, remove a complete key package.
#[tokio::test]
async fn key_package_store_roundtrip() {
    let backend = Arc::new(MemoryBackend::new());
    let store = key_package_store(&backend, "alice");
    let keys = Keys::generate();

    let complete = TestCiphersuite
        .generate_key_package(Credential::new(&keys.public_key()))
        .unwrap();

    let key = store.add(&complete).await.unwrap();
    assert!(store.has(&key).await.unwrap());
    assert_eq!(
        store.get_public(&key).await.unwrap().unwrap(),
        complete.public_package
    );
    assert_eq!(
        store.get_private(&key).await.unwrap().unwrap(),
        complete.private_package
    );
    assert_eq!(store.count().await.unwrap(), 1);

    store.remove(&key).await.unwrap();
    assert!(!store.has(&key).await.unwrap());
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn key_package_store_key_is_the_reference_hash() {
    let backend = Arc::new(MemoryBackend::new());
    let store = key_package_store(&backend, "alice");
    let keys = Keys::generate();

    let complete = TestCiphersuite
        .generate_key_package(Credential::new(&keys.public_key()))
        .unwrap();

    let key = store.add(&complete).await.unwrap();
    let expected = TestCiphersuite
        .key_package_ref(&complete.public_package)
        .unwrap()
        .to_hex();
    assert_eq!(key, expected);
    assert_eq!(store.ref_for(&complete.public_package).unwrap(), expected);
}

#[tokio::test]
async fn key_package_store_add_is_upsert() {
    let backend = Arc::new(MemoryBackend::new());
    let store = key_package_store(&backend, "alice");
    let keys = Keys::generate();

    let complete = TestCiphersuite
        .generate_key_package(Credential::new(&keys.public_key()))
        .unwrap();

    let k1 = store.add(&complete).await.unwrap();
    let k2 = store.add(&complete).await.unwrap();
    assert_eq!(k1, k2);
    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn key_package_store_list_returns_public_halves() {
    let backend = Arc::new(MemoryBackend::new());
    let store = key_package_store(&backend, "alice");
    let keys = Keys::generate();

    let a = TestCiphersuite
        .generate_key_package(Credential::new(&keys.public_key()))
        .unwrap();
    let b = TestCiphersuite
        .generate_key_package(Credential::new(&keys.public_key()))
        .unwrap();
    store.add(&a).await.unwrap();
    store.add(&b).await.unwrap();

    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&a.public_package));
    assert!(listed.contains(&b.public_package));

    store.clear().await.unwrap();
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn group_store_roundtrip_and_update() {
    let backend = Arc::new(MemoryBackend::new());
    let store = group_store(&backend, "alice");
    let keys = Keys::generate();
    let state = test_state(&keys);

    let key = store.add(&state).await.unwrap();
    assert_eq!(key, state.group_id_hex());
    assert_eq!(store.count().await.unwrap(), 1);

    let loaded = store.get(&key).await.unwrap().unwrap();
    assert_eq!(loaded, state);

    // Update replaces the single record for the group id.
    let mut advanced = state.clone();
    advanced.epoch = 4;
    store.update(&advanced).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 1);
    assert_eq!(store.get(&key).await.unwrap().unwrap().epoch, 4);

    store.remove(&key).await.unwrap();
    assert!(store.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn group_store_list_and_clear() {
    let backend = Arc::new(MemoryBackend::new());
    let store = group_store(&backend, "alice");
    let keys = Keys::generate();

    let mut a = test_state(&keys);
    a.group_id = GroupId::from_slice(&[1u8; 32]);
    let mut b = test_state(&keys);
    b.group_id = GroupId::from_slice(&[2u8; 32]);

    store.add(&a).await.unwrap();
    store.add(&b).await.unwrap();
    assert_eq!(store.list().await.unwrap().len(), 2);

    store.clear().await.unwrap();
    assert_eq!(store.count().await.unwrap(), 0);
}

/// One backend hosts several identities without collisions.
#[tokio::test]
async fn prefixes_isolate_identities() {
    let backend = Arc::new(MemoryBackend::new());
    let alice_store = group_store(&backend, "alice");
    let bob_store = group_store(&backend, "bob");
    let keys = Keys::generate();
    let state = test_state(&keys);

    alice_store.add(&state).await.unwrap();
    assert_eq!(alice_store.count().await.unwrap(), 1);
    assert_eq!(bob_store.count().await.unwrap(), 0);

    bob_store.clear().await.unwrap();
    assert_eq!(alice_store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn group_store_fires_change_listeners() {
    let backend = Arc::new(MemoryBackend::new());
    let store = group_store(&backend, "alice");
    let keys = Keys::generate();
    let state = test_state(&keys);

    let changes = Arc::new(Mutex::new(Vec::new()));
    {
        let changes = Arc::clone(&changes);
        store.on_change(move |change| {
            changes.lock().unwrap().push(change.clone());
        });
    }

    let key = store.add(&state).await.unwrap();
    store.update(&state).await.unwrap();
    store.remove(&key).await.unwrap();
    store.clear().await.unwrap();

    let seen = changes.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            StoreChange::Put(key.clone()),
            StoreChange::Put(key.clone()),
            StoreChange::Removed(key.clone()),
            StoreChange::Cleared,
        ]
    );
}

#[tokio::test]
async fn key_package_store_fires_change_listeners() {
    let backend = Arc::new(MemoryBackend::new());
    let store = key_package_store(&backend, "alice");
    let keys = Keys::generate();
    let complete = TestCiphersuite
        .generate_key_package(Credential::new(&keys.public_key()))
        .unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = Arc::clone(&count);
        store.on_change(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    let key = store.add(&complete).await.unwrap();
    store.remove(&key).await.unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn corrupt_group_record_is_reported() {
    let backend = Arc::new(MemoryBackend::new());
    let store = group_store(&backend, "alice");

    use marmot_core::store::StorageBackend;
    backend
        .set("alice/groups/deadbeef", b"not json".to_vec())
        .await
        .unwrap();

    let err = store.get("deadbeef").await.unwrap_err();
    assert!(matches!(
        err,
        marmot_core::Error::Store(marmot_core::store::StoreError::Corrupt { .. })
    ));
}
