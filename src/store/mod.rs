//! Identity storage backends.
//!
//! One capability set, two implementations: a durable Postgres engine and an
//! in-memory store used for tests and DSN-less development. The coordinator
//! only ever talks to the trait.
use crate::model::Identity;
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

/// Finalize a transaction by committing it.
pub const COMMIT: bool = true;
/// Finalize a transaction by rolling it back.
pub const ROLLBACK: bool = false;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entry already exists")]
    Conflict,
    #[error("entry does not exist")]
    NotFound,
    #[error("invalid identity: {0}")]
    Invalid(String),
    #[error("transaction handle does not belong to this store")]
    ForeignTx,
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Scoped write context. Owned by whoever opened it; concluding it twice is
/// ruled out by move semantics (`close_transaction` consumes the handle).
/// Dropping the handle without closing rolls back.
pub struct StoreTx(pub(crate) TxInner);

pub(crate) enum TxInner {
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
    Memory(memory::MemoryTx),
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Open a read-committed write context. Transient connection exhaustion
    /// is retried internally with bounded backoff.
    async fn start_transaction(&self) -> StoreResult<StoreTx>;

    /// Finalize the transaction: commit when `commit` is true, else roll back.
    async fn close_transaction(&self, tx: StoreTx, commit: bool) -> StoreResult<()>;

    /// Insert a new identity row in storage form (encrypted private key, raw
    /// public key). `Conflict` when the uid or the public key is already
    /// taken; `Invalid` when any attribute is empty. The write becomes
    /// visible only after commit. Not retried while the transaction is open.
    async fn store_new_identity(&self, tx: &mut StoreTx, identity: Identity) -> StoreResult<()>;

    /// Fetch an identity in storage form, or `NotFound`.
    async fn get_identity(&self, uid: Uuid) -> StoreResult<Identity>;

    /// Inverse lookup from raw public key bytes, or `NotFound`.
    async fn get_uuid_for_public_key(&self, public_key: &[u8]) -> StoreResult<Uuid>;

    async fn exists_private_key(&self, uid: Uuid) -> StoreResult<bool>;
    async fn exists_public_key(&self, uid: Uuid) -> StoreResult<bool>;
    async fn exists_uuid_for_public_key(&self, public_key: &[u8]) -> StoreResult<bool>;

    async fn get_auth_token(&self, uid: Uuid) -> StoreResult<String>;
    async fn set_auth_token(&self, tx: &mut StoreTx, uid: Uuid, token: &str) -> StoreResult<()>;

    async fn health_check(&self) -> StoreResult<()>;
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}
