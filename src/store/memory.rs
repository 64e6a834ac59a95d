//! In-memory implementation of the identity store.
//!
//! # Purpose
//! Implements `IdentityStore` entirely in memory using a `HashMap` guarded by
//! `tokio::sync::RwLock`. It exists for:
//! - tests (no external dependencies)
//! - DSN-less development where durability is not required
//!
//! Not durable: all state is lost on process restart.
//!
//! # Transactions
//! Writes are buffered in the handle and applied under the write lock at
//! commit, so a write is only visible after `close_transaction(.., COMMIT)`
//! — the same visibility contract as the Postgres engine. Conflict checks run
//! both at insert time (fail fast) and again at commit (another transaction
//! may have won the race in between).
use super::{IdentityStore, StoreError, StoreResult, StoreTx, TxInner};
use crate::model::Identity;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct InMemoryStore {
    identities: Arc<RwLock<HashMap<Uuid, Identity>>>,
}

/// Buffered mutations for one open transaction.
#[derive(Default)]
pub struct MemoryTx {
    ops: Vec<PendingOp>,
}

enum PendingOp {
    Insert(Identity),
    SetAuthToken(Uuid, String),
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            identities: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn conflicts(map: &HashMap<Uuid, Identity>, candidate: &Identity) -> bool {
    map.contains_key(&candidate.uid)
        || map.values().any(|id| id.public_key == candidate.public_key)
}

#[async_trait]
impl IdentityStore for InMemoryStore {
    async fn start_transaction(&self) -> StoreResult<StoreTx> {
        Ok(StoreTx(TxInner::Memory(MemoryTx::default())))
    }

    async fn close_transaction(&self, tx: StoreTx, commit: bool) -> StoreResult<()> {
        let TxInner::Memory(tx) = tx.0 else {
            return Err(StoreError::ForeignTx);
        };
        if !commit {
            return Ok(());
        }
        let mut map = self.identities.write().await;
        for op in tx.ops {
            match op {
                PendingOp::Insert(identity) => {
                    if conflicts(&map, &identity) {
                        return Err(StoreError::Conflict);
                    }
                    map.insert(identity.uid, identity);
                }
                PendingOp::SetAuthToken(uid, token) => {
                    match map.get_mut(&uid) {
                        Some(identity) => identity.auth_token = token,
                        None => return Err(StoreError::NotFound),
                    }
                }
            }
        }
        Ok(())
    }

    async fn store_new_identity(&self, tx: &mut StoreTx, identity: Identity) -> StoreResult<()> {
        identity
            .check_attributes()
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let TxInner::Memory(tx) = &mut tx.0 else {
            return Err(StoreError::ForeignTx);
        };

        let map = self.identities.read().await;
        let pending_conflict = tx.ops.iter().any(|op| match op {
            PendingOp::Insert(pending) => {
                pending.uid == identity.uid || pending.public_key == identity.public_key
            }
            PendingOp::SetAuthToken(..) => false,
        });
        if conflicts(&map, &identity) || pending_conflict {
            return Err(StoreError::Conflict);
        }
        drop(map);

        tx.ops.push(PendingOp::Insert(identity));
        Ok(())
    }

    async fn get_identity(&self, uid: Uuid) -> StoreResult<Identity> {
        self.identities
            .read()
            .await
            .get(&uid)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_uuid_for_public_key(&self, public_key: &[u8]) -> StoreResult<Uuid> {
        self.identities
            .read()
            .await
            .values()
            .find(|id| id.public_key == public_key)
            .map(|id| id.uid)
            .ok_or(StoreError::NotFound)
    }

    async fn exists_private_key(&self, uid: Uuid) -> StoreResult<bool> {
        Ok(self
            .identities
            .read()
            .await
            .get(&uid)
            .is_some_and(|id| !id.private_key.is_empty()))
    }

    async fn exists_public_key(&self, uid: Uuid) -> StoreResult<bool> {
        Ok(self
            .identities
            .read()
            .await
            .get(&uid)
            .is_some_and(|id| !id.public_key.is_empty()))
    }

    async fn exists_uuid_for_public_key(&self, public_key: &[u8]) -> StoreResult<bool> {
        Ok(self
            .identities
            .read()
            .await
            .values()
            .any(|id| id.public_key == public_key))
    }

    async fn get_auth_token(&self, uid: Uuid) -> StoreResult<String> {
        self.identities
            .read()
            .await
            .get(&uid)
            .map(|id| id.auth_token.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn set_auth_token(&self, tx: &mut StoreTx, uid: Uuid, token: &str) -> StoreResult<()> {
        let TxInner::Memory(tx) = &mut tx.0 else {
            return Err(StoreError::ForeignTx);
        };
        if !self.identities.read().await.contains_key(&uid) {
            return Err(StoreError::NotFound);
        }
        tx.ops.push(PendingOp::SetAuthToken(uid, token.to_string()));
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
