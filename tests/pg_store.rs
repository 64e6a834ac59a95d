#![cfg(feature = "pg-tests")]

//! Contract tests for the Postgres store. They need a disposable database
//! reachable via `COSE_TEST_POSTGRES_DSN` and are gated behind the
//! `pg-tests` feature so the default test run stays hermetic.
use cose_signer::config::PostgresConfig;
use cose_signer::model::Identity;
use cose_signer::store::postgres::PostgresStore;
use cose_signer::store::{IdentityStore, StoreError, COMMIT, ROLLBACK};
use std::time::Duration;
use uuid::Uuid;

async fn store() -> PostgresStore {
    let dsn = std::env::var("COSE_TEST_POSTGRES_DSN")
        .expect("COSE_TEST_POSTGRES_DSN must point at a disposable database");
    PostgresStore::connect(&PostgresConfig {
        dsn,
        max_open_conns: 5,
        max_idle_conns: 5,
        conn_max_lifetime: Duration::from_secs(600),
        conn_max_idle_time: Duration::from_secs(60),
    })
    .await
    .expect("connect postgres store")
}

// Public keys are unique per run: the row outlives the test in a reused
// database, so derive them from the fresh uuid.
fn identity(uid: Uuid, pubkey_tag: u8) -> Identity {
    let mut public_key = vec![pubkey_tag; 64];
    public_key[..16].copy_from_slice(uid.as_bytes());
    Identity {
        uid,
        private_key: vec![0xEE; 48],
        public_key,
        auth_token: format!("token-{uid}"),
    }
}

#[tokio::test]
async fn insert_commit_and_lookups() {
    let store = store().await;
    let uid = Uuid::new_v4();
    let id = identity(uid, 0x11);

    let mut tx = store.start_transaction().await.unwrap();
    store.store_new_identity(&mut tx, id.clone()).await.unwrap();
    store.close_transaction(tx, COMMIT).await.unwrap();

    let stored = store.get_identity(uid).await.unwrap();
    assert_eq!(stored.private_key, id.private_key);
    assert_eq!(stored.public_key, id.public_key);
    assert_eq!(stored.auth_token, id.auth_token);

    assert_eq!(
        store.get_uuid_for_public_key(&id.public_key).await.unwrap(),
        uid
    );
    assert!(store.exists_private_key(uid).await.unwrap());
    assert!(store.exists_public_key(uid).await.unwrap());
    assert!(store
        .exists_uuid_for_public_key(&id.public_key)
        .await
        .unwrap());
    assert_eq!(store.get_auth_token(uid).await.unwrap(), id.auth_token);
}

#[tokio::test]
async fn rollback_leaves_no_row() {
    let store = store().await;
    let uid = Uuid::new_v4();

    let mut tx = store.start_transaction().await.unwrap();
    store
        .store_new_identity(&mut tx, identity(uid, 0x22))
        .await
        .unwrap();
    store.close_transaction(tx, ROLLBACK).await.unwrap();

    assert!(matches!(
        store.get_identity(uid).await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn duplicate_insert_conflicts_and_keeps_row() {
    let store = store().await;
    let uid = Uuid::new_v4();
    let id = identity(uid, 0x33);

    let mut tx = store.start_transaction().await.unwrap();
    store.store_new_identity(&mut tx, id.clone()).await.unwrap();
    store.close_transaction(tx, COMMIT).await.unwrap();

    let mut tx = store.start_transaction().await.unwrap();
    let err = store
        .store_new_identity(&mut tx, id.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict));
    store.close_transaction(tx, ROLLBACK).await.unwrap();

    let stored = store.get_identity(uid).await.unwrap();
    assert_eq!(stored.private_key, id.private_key);
    assert_eq!(stored.public_key, id.public_key);
}

#[tokio::test]
async fn set_auth_token_in_transaction() {
    let store = store().await;
    let uid = Uuid::new_v4();

    let mut tx = store.start_transaction().await.unwrap();
    store
        .store_new_identity(&mut tx, identity(uid, 0x44))
        .await
        .unwrap();
    store.close_transaction(tx, COMMIT).await.unwrap();

    let mut tx = store.start_transaction().await.unwrap();
    store.set_auth_token(&mut tx, uid, "rotated").await.unwrap();
    store.close_transaction(tx, COMMIT).await.unwrap();

    assert_eq!(store.get_auth_token(uid).await.unwrap(), "rotated");
}
