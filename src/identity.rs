//! Identity lifecycle handling.
//!
//! Creates new identities: key generation, encrypted persistence, one-time
//! public key registration with the PKI backend, and CSR submission. Used by
//! the `PUT /register` endpoint and by first-time initialization of
//! identities listed in the configuration.
use crate::client::{ClientError, PkiClient};
use crate::model::Identity;
use crate::protocol::{Protocol, ProtocolError};
use crate::store::{StoreError, COMMIT, ROLLBACK};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("identity is already registered")]
    AlreadyExists,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("key registration with PKI backend failed: {0}")]
    Upstream(#[from] ClientError),
}

pub struct IdentityHandler {
    protocol: Arc<Protocol>,
    client: Arc<PkiClient>,
    subject_country: String,
    subject_organization: String,
}

impl IdentityHandler {
    pub fn new(
        protocol: Arc<Protocol>,
        client: Arc<PkiClient>,
        subject_country: String,
        subject_organization: String,
    ) -> Self {
        Self {
            protocol,
            client,
            subject_country,
            subject_organization,
        }
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    /// Create and register a new identity. Returns the CSR (DER) on success.
    ///
    /// The store insert and the public key registration share one
    /// transaction scope: if the PKI backend rejects the key, nothing is
    /// committed and the uuid stays free for another attempt. The CSR
    /// submission is fire-and-forget.
    pub async fn init_identity(
        &self,
        uid: Uuid,
        auth_token: String,
    ) -> Result<Vec<u8>, RegistrationError> {
        if self.protocol.exists(uid).await? {
            return Err(RegistrationError::AlreadyExists);
        }

        tracing::info!(%uid, "initializing new identity");

        let crypto = self.protocol.crypto();
        let priv_pem = crypto.generate_key().map_err(ProtocolError::from)?;
        let pub_pem = crypto
            .public_key_from_private(&priv_pem)
            .map_err(ProtocolError::from)?;
        let csr = crypto
            .csr(
                &priv_pem,
                uid,
                &self.subject_country,
                &self.subject_organization,
            )
            .map_err(ProtocolError::from)?;
        let registration = crypto
            .signed_key_registration(&priv_pem, uid)
            .map_err(ProtocolError::from)?;

        let identity = Identity {
            uid,
            private_key: priv_pem,
            public_key: pub_pem,
            auth_token,
        };

        let mut tx = self.protocol.start_transaction().await.map_err(ProtocolError::from)?;

        if let Err(err) = self.protocol.store_new_identity(&mut tx, identity).await {
            let _ = self.protocol.close_transaction(tx, ROLLBACK).await;
            return Err(match err {
                ProtocolError::Store(StoreError::Conflict) => RegistrationError::AlreadyExists,
                other => other.into(),
            });
        }

        if let Err(err) = self.client.submit_key_registration(uid, &registration).await {
            let _ = self.protocol.close_transaction(tx, ROLLBACK).await;
            return Err(err.into());
        }

        self.spawn_csr_submission(uid, csr.clone());

        self.protocol
            .close_transaction(tx, COMMIT)
            .await
            .map_err(ProtocolError::from)?;

        metrics::counter!("identity_registrations_total").increment(1);
        Ok(csr)
    }

    fn spawn_csr_submission(&self, uid: Uuid, csr: Vec<u8>) {
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(err) = client.submit_csr(uid, &csr).await {
                tracing::error!(%uid, error = %err, "submitting CSR failed");
            }
        });
    }

    /// First-time initialization of identities listed in the configuration.
    /// Already-initialized entries are skipped.
    pub async fn init_identities(
        &self,
        tokens: &HashMap<Uuid, String>,
    ) -> Result<(), RegistrationError> {
        tracing::debug!(count = tokens.len(), "initializing configured identities");

        for (&uid, token) in tokens {
            let exists = self
                .protocol
                .store()
                .exists_private_key(uid)
                .await
                .map_err(ProtocolError::from)?;
            if exists {
                tracing::debug!(%uid, "already initialized, skipping");
                continue;
            }

            if token.is_empty() {
                return Err(ProtocolError::Invalid(format!(
                    "missing auth token for identity {uid}"
                ))
                .into());
            }

            self.init_identity(uid, token.clone()).await?;
        }

        Ok(())
    }
}
