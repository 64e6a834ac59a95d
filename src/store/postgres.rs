//! Postgres-backed identity store.
//!
//! # What this module is
//! The durable implementation of `IdentityStore` (via `sqlx`). It holds one
//! row per registered identity in storage form: the private key as
//! ciphertext, the public key as raw point bytes so the inverse lookup is a
//! byte-exact equality match.
//!
//! # Schema
//! The schema is created on first connect; there is a single identity table
//! plus a `version` table that records the one-shot data-migration level.
//! A version mismatch is fatal at startup: the operator has to run the
//! out-of-band migrator before this service will touch the data.
//!
//! # Transient errors
//! Connection exhaustion (SQLSTATE 53300 "too many connections" and 53400
//! "configuration limit exceeded") is retried with a 100 ms backoff, at most
//! five attempts. All other errors surface verbatim. Inserts that run inside
//! an open transaction are never retried; the caller rolls back instead.
use super::{IdentityStore, StoreError, StoreResult, StoreTx, TxInner};
use crate::config::PostgresConfig;
use crate::model::Identity;
use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use uuid::Uuid;

const IDENTITY_TABLE: &str = "cose_identity";

const CREATE_IDENTITY_TABLE: &str = "CREATE TABLE IF NOT EXISTS cose_identity(\
     uid VARCHAR(255) NOT NULL PRIMARY KEY, \
     private_key BYTEA NOT NULL, \
     public_key BYTEA NOT NULL UNIQUE, \
     auth_token VARCHAR(255) NOT NULL)";

const CREATE_VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS version(\
     id VARCHAR(255) NOT NULL PRIMARY KEY, \
     migration_version VARCHAR(255) NOT NULL)";

const MIGRATION_ID: &str = "cose_identity_db_migration";
const MIGRATION_VERSION: &str = "2.0";

const MAX_CONN_ATTEMPTS: u32 = 5;
const CONN_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Durable identity store backed by Postgres.
///
/// Safe to share across request handlers: each call leases a connection from
/// the `sqlx` pool, whose limits bound concurrency against the database.
pub struct PostgresStore {
    pool: PgPool,
}

/// Row shape for the identity table. Kept separate from the domain type so
/// column naming and storage formats stay localized here.
#[derive(Debug, FromRow)]
struct DbIdentity {
    private_key: Vec<u8>,
    public_key: Vec<u8>,
    auth_token: String,
}

impl PostgresStore {
    /// Connect, create the schema if needed, and check the migration level.
    ///
    /// Pool limits and lifetimes come from configuration; defaults are
    /// conservative (10 open / 10 idle / 10 min lifetime / 1 min idle).
    pub async fn connect(pg: &PostgresConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(pg.max_open_conns)
            .min_connections(pg.max_idle_conns)
            .max_lifetime(pg.conn_max_lifetime)
            .idle_timeout(pg.conn_max_idle_time)
            .connect(&pg.dsn)
            .await
            .map_err(|e| StoreError::Unexpected(e.into()))?;

        tracing::info!(table = IDENTITY_TABLE, "preparing postgres usage");

        sqlx::query(CREATE_IDENTITY_TABLE)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Unexpected(e.into()))?;
        sqlx::query(CREATE_VERSION_TABLE)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Unexpected(e.into()))?;

        ensure_migration_version(&pool).await?;

        Ok(Self { pool })
    }
}

/// Record the migration level on a fresh database; refuse to serve data that
/// was written at a different level.
async fn ensure_migration_version(pool: &PgPool) -> StoreResult<()> {
    let stored: Option<String> =
        sqlx::query_scalar("SELECT migration_version FROM version WHERE id = $1")
            .bind(MIGRATION_ID)
            .fetch_optional(pool)
            .await
            .map_err(|e| StoreError::Unexpected(e.into()))?;

    match stored {
        None => {
            sqlx::query("INSERT INTO version (id, migration_version) VALUES ($1, $2)")
                .bind(MIGRATION_ID)
                .bind(MIGRATION_VERSION)
                .execute(pool)
                .await
                .map_err(|e| StoreError::Unexpected(e.into()))?;
            Ok(())
        }
        Some(v) if v == MIGRATION_VERSION => Ok(()),
        Some(v) => Err(StoreError::Unexpected(anyhow!(
            "database migration version is {v}, this binary expects {MIGRATION_VERSION}; \
             run the data migrator first"
        ))),
    }
}

fn is_connection_exhausted(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("53300") | Some("53400"))
        }
        _ => false,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Whether another round is warranted for this attempt/error combination.
fn should_retry(err: &sqlx::Error, attempts: &mut u32) -> bool {
    if is_connection_exhausted(err) && *attempts + 1 < MAX_CONN_ATTEMPTS {
        *attempts += 1;
        true
    } else {
        false
    }
}

#[async_trait]
impl IdentityStore for PostgresStore {
    async fn start_transaction(&self) -> StoreResult<StoreTx> {
        let mut attempts = 0;
        loop {
            match self.pool.begin().await {
                Ok(tx) => return Ok(StoreTx(TxInner::Postgres(tx))),
                Err(err) if should_retry(&err, &mut attempts) => {
                    tracing::debug!(
                        attempt = attempts,
                        max = MAX_CONN_ATTEMPTS,
                        error = %err,
                        "start_transaction: connection not available"
                    );
                    tokio::time::sleep(CONN_RETRY_BACKOFF).await;
                }
                Err(err) => return Err(StoreError::Unexpected(err.into())),
            }
        }
    }

    async fn close_transaction(&self, tx: StoreTx, commit: bool) -> StoreResult<()> {
        let TxInner::Postgres(tx) = tx.0 else {
            return Err(StoreError::ForeignTx);
        };
        let res = if commit { tx.commit().await } else { tx.rollback().await };
        res.map_err(|e| StoreError::Unexpected(e.into()))
    }

    async fn store_new_identity(&self, tx: &mut StoreTx, identity: Identity) -> StoreResult<()> {
        identity
            .check_attributes()
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let TxInner::Postgres(tx) = &mut tx.0 else {
            return Err(StoreError::ForeignTx);
        };

        let res = sqlx::query(
            "INSERT INTO cose_identity (uid, private_key, public_key, auth_token) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(identity.uid.to_string())
        .bind(&identity.private_key)
        .bind(&identity.public_key)
        .bind(&identity.auth_token)
        .execute(&mut **tx)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict),
            Err(err) => Err(StoreError::Unexpected(err.into())),
        }
    }

    async fn get_identity(&self, uid: Uuid) -> StoreResult<Identity> {
        let mut attempts = 0;
        loop {
            let res = sqlx::query_as::<_, DbIdentity>(
                "SELECT private_key, public_key, auth_token FROM cose_identity WHERE uid = $1",
            )
            .bind(uid.to_string())
            .fetch_optional(&self.pool)
            .await;

            match res {
                Ok(Some(row)) => {
                    return Ok(Identity {
                        uid,
                        private_key: row.private_key,
                        public_key: row.public_key,
                        auth_token: row.auth_token,
                    });
                }
                Ok(None) => return Err(StoreError::NotFound),
                Err(err) if should_retry(&err, &mut attempts) => {
                    tracing::debug!(
                        attempt = attempts,
                        max = MAX_CONN_ATTEMPTS,
                        error = %err,
                        "get_identity: connection not available"
                    );
                    tokio::time::sleep(CONN_RETRY_BACKOFF).await;
                }
                Err(err) => return Err(StoreError::Unexpected(err.into())),
            }
        }
    }

    async fn get_uuid_for_public_key(&self, public_key: &[u8]) -> StoreResult<Uuid> {
        let mut attempts = 0;
        loop {
            let res: Result<Option<String>, _> =
                sqlx::query_scalar("SELECT uid FROM cose_identity WHERE public_key = $1")
                    .bind(public_key)
                    .fetch_optional(&self.pool)
                    .await;

            match res {
                Ok(Some(uid)) => {
                    return Uuid::parse_str(&uid)
                        .map_err(|e| StoreError::Unexpected(anyhow!("stored uid invalid: {e}")));
                }
                Ok(None) => return Err(StoreError::NotFound),
                Err(err) if should_retry(&err, &mut attempts) => {
                    tokio::time::sleep(CONN_RETRY_BACKOFF).await;
                }
                Err(err) => return Err(StoreError::Unexpected(err.into())),
            }
        }
    }

    async fn exists_private_key(&self, uid: Uuid) -> StoreResult<bool> {
        self.exists_scalar(
            "SELECT 1 FROM cose_identity WHERE uid = $1 AND length(private_key) > 0",
            uid.to_string(),
        )
        .await
    }

    async fn exists_public_key(&self, uid: Uuid) -> StoreResult<bool> {
        self.exists_scalar(
            "SELECT 1 FROM cose_identity WHERE uid = $1 AND length(public_key) > 0",
            uid.to_string(),
        )
        .await
    }

    async fn exists_uuid_for_public_key(&self, public_key: &[u8]) -> StoreResult<bool> {
        let mut attempts = 0;
        loop {
            let res: Result<Option<i32>, _> =
                sqlx::query_scalar("SELECT 1 FROM cose_identity WHERE public_key = $1")
                    .bind(public_key)
                    .fetch_optional(&self.pool)
                    .await;
            match res {
                Ok(found) => return Ok(found.is_some()),
                Err(err) if should_retry(&err, &mut attempts) => {
                    tokio::time::sleep(CONN_RETRY_BACKOFF).await;
                }
                Err(err) => return Err(StoreError::Unexpected(err.into())),
            }
        }
    }

    async fn get_auth_token(&self, uid: Uuid) -> StoreResult<String> {
        let mut attempts = 0;
        loop {
            let res: Result<Option<String>, _> =
                sqlx::query_scalar("SELECT auth_token FROM cose_identity WHERE uid = $1")
                    .bind(uid.to_string())
                    .fetch_optional(&self.pool)
                    .await;
            match res {
                Ok(Some(token)) => return Ok(token),
                Ok(None) => return Err(StoreError::NotFound),
                Err(err) if should_retry(&err, &mut attempts) => {
                    tokio::time::sleep(CONN_RETRY_BACKOFF).await;
                }
                Err(err) => return Err(StoreError::Unexpected(err.into())),
            }
        }
    }

    async fn set_auth_token(&self, tx: &mut StoreTx, uid: Uuid, token: &str) -> StoreResult<()> {
        let TxInner::Postgres(tx) = &mut tx.0 else {
            return Err(StoreError::ForeignTx);
        };
        let res = sqlx::query("UPDATE cose_identity SET auth_token = $1 WHERE uid = $2")
            .bind(token)
            .bind(uid.to_string())
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Unexpected(e.into()))?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Unexpected(e.into()))
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

impl PostgresStore {
    async fn exists_scalar(&self, query: &'static str, uid: String) -> StoreResult<bool> {
        let mut attempts = 0;
        loop {
            let res: Result<Option<i32>, _> = sqlx::query_scalar(query)
                .bind(&uid)
                .fetch_optional(&self.pool)
                .await;
            match res {
                Ok(found) => return Ok(found.is_some()),
                Err(err) if should_retry(&err, &mut attempts) => {
                    tokio::time::sleep(CONN_RETRY_BACKOFF).await;
                }
                Err(err) => return Err(StoreError::Unexpected(err.into())),
            }
        }
    }
}
