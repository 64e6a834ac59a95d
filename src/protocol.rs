//! Protocol coordinator.
//!
//! Sits between the HTTP adapter and the store/crypto layers. Owns the
//! process-wide mutable state: two read-mostly lookup caches and the
//! atomically swappable SKID table. One instance per process, constructed at
//! startup and torn down with it.
//!
//! Cache policy: identities are immutable once persisted, so cached entries
//! are never invalidated and duplicate inserts of the same identity are
//! harmless. The working set is bounded by the number of registered
//! identities; there is no eviction.
use crate::crypto::keywrap::KeyEncrypter;
use crate::crypto::{CryptoError, SignatureCrypto};
use crate::model::Identity;
use crate::store::{IdentityStore, StoreError, StoreResult, StoreTx};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Length of a subject key identifier as carried in the trust list.
pub const SKID_LEN: usize = 8;

pub type Skid = [u8; SKID_LEN];

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("SKID unknown for identity {0} (missing X.509 public key certificate)")]
    SkidUnknown(Uuid),
    #[error("invalid identity: {0}")]
    Invalid(String),
}

pub struct Protocol {
    store: Arc<dyn IdentityStore>,
    crypto: Arc<dyn SignatureCrypto>,
    key_encrypter: KeyEncrypter,

    /// uid → identity in cleartext form (decrypted private key, PEM public key).
    identity_cache: DashMap<Uuid, Arc<Identity>>,
    /// base64(raw public key) → uid.
    uid_cache: DashMap<String, Uuid>,

    /// Published uid → SKID snapshot. Readers take the shared mode; the
    /// reconciler takes the exclusive mode briefly to swap.
    skid_store: RwLock<HashMap<Uuid, Skid>>,
}

impl Protocol {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        crypto: Arc<dyn SignatureCrypto>,
        secret: &[u8],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            store,
            crypto,
            key_encrypter: KeyEncrypter::new(secret)?,
            identity_cache: DashMap::new(),
            uid_cache: DashMap::new(),
            skid_store: RwLock::new(HashMap::new()),
        })
    }

    pub fn crypto(&self) -> &dyn SignatureCrypto {
        self.crypto.as_ref()
    }

    pub fn store(&self) -> &dyn IdentityStore {
        self.store.as_ref()
    }

    pub async fn start_transaction(&self) -> StoreResult<StoreTx> {
        self.store.start_transaction().await
    }

    pub async fn close_transaction(&self, tx: StoreTx, commit: bool) -> StoreResult<()> {
        self.store.close_transaction(tx, commit).await
    }

    /// Validate a cleartext identity, convert it to storage form (encrypted
    /// private key, raw public key) and delegate the insert. The caller owns
    /// the transaction.
    pub async fn store_new_identity(
        &self,
        tx: &mut StoreTx,
        mut identity: Identity,
    ) -> Result<(), ProtocolError> {
        identity
            .check_attributes()
            .map_err(|e| ProtocolError::Invalid(e.to_string()))?;

        identity.private_key = self.key_encrypter.encrypt(&identity.private_key)?;
        identity.public_key = self.crypto.public_key_pem_to_bytes(&identity.public_key)?;

        self.store.store_new_identity(tx, identity).await?;
        Ok(())
    }

    /// Resolve an identity in cleartext form, via the cache or the store.
    pub async fn get_identity(&self, uid: Uuid) -> Result<Arc<Identity>, ProtocolError> {
        if let Some(identity) = self.identity_cache.get(&uid) {
            return Ok(identity.clone());
        }

        let identity = Arc::new(self.fetch_identity_from_storage(uid).await?);
        self.identity_cache.insert(uid, identity.clone());
        Ok(identity)
    }

    async fn fetch_identity_from_storage(&self, uid: Uuid) -> Result<Identity, ProtocolError> {
        let mut identity = self.store.get_identity(uid).await?;

        identity.private_key = self.key_encrypter.decrypt(&identity.private_key)?;
        identity.public_key = self.crypto.public_key_bytes_to_pem(&identity.public_key)?;

        identity
            .check_attributes()
            .map_err(|e| ProtocolError::Invalid(e.to_string()))?;
        Ok(identity)
    }

    /// Inverse lookup from a PEM public key, via the cache or the store.
    pub async fn get_uuid_for_public_key(&self, pub_pem: &[u8]) -> Result<Uuid, ProtocolError> {
        let raw = self.crypto.public_key_pem_to_bytes(pub_pem)?;
        let cache_key = BASE64.encode(&raw);

        if let Some(uid) = self.uid_cache.get(&cache_key) {
            return Ok(*uid);
        }

        let uid = self.store.get_uuid_for_public_key(&raw).await?;
        self.uid_cache.insert(cache_key, uid);
        Ok(uid)
    }

    pub async fn exists(&self, uid: Uuid) -> Result<bool, ProtocolError> {
        match self.get_identity(uid).await {
            Ok(_) => Ok(true),
            Err(ProtocolError::Store(StoreError::NotFound)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Current SKID for an identity, or `SkidUnknown` when the latest trust
    /// list had no matching certificate.
    pub async fn get_skid(&self, uid: Uuid) -> Result<Skid, ProtocolError> {
        self.skid_store
            .read()
            .await
            .get(&uid)
            .copied()
            .ok_or(ProtocolError::SkidUnknown(uid))
    }

    /// Atomically publish a fresh SKID snapshot. After this returns, every
    /// subsequent `get_skid` observes the new mapping.
    pub async fn set_skid_store(&self, new: HashMap<Uuid, Skid>) {
        *self.skid_store.write().await = new;
    }
}
