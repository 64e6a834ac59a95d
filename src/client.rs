//! HTTP client for the external trust backends.
//!
//! Two collaborators live behind this module: the certificate-list server
//! (signed trust list + the signer's public key) and the PKI backend that
//! accepts key registrations and certificate signing requests. Every request
//! carries a 10 s timeout; callers own the retry/tolerance policy.
use crate::crypto::{CryptoError, SignatureCrypto};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const BACKEND_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} failed with status {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("unexpected trust list response: missing newline separator")]
    MissingNewline,
    #[error("invalid signature for public key certificate list")]
    BadSignature,
    #[error("unable to decode public key certificate list: {0}")]
    Decode(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// One entry of the trust list; lives for a single reconciliation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateEntry {
    #[serde(rename = "certificateType")]
    pub certificate_type: String,
    pub country: String,
    #[serde(with = "base64_bytes")]
    pub kid: Vec<u8>,
    #[serde(rename = "rawData", with = "base64_bytes")]
    pub raw_data: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    pub thumbprint: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize)]
struct TrustList {
    certificates: Vec<CertificateEntry>,
}

/// Where verified trust-list entries come from. The reconciler only sees
/// this seam, so tests can script outcomes without a network.
#[async_trait]
pub trait TrustListSource: Send + Sync {
    async fn certificates(&self) -> Result<Vec<CertificateEntry>, ClientError>;
}

pub struct PkiClient {
    http: reqwest::Client,
    crypto: Arc<dyn SignatureCrypto>,
    key_service_url: String,
    identity_service_url: String,
    certificate_server_url: String,
    certificate_server_pubkey_url: String,
}

impl PkiClient {
    pub fn new(
        crypto: Arc<dyn SignatureCrypto>,
        key_service_url: String,
        identity_service_url: String,
        certificate_server_url: String,
        certificate_server_pubkey_url: String,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(BACKEND_REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ClientError::Transport {
                url: "<client construction>".into(),
                source,
            })?;
        Ok(Self {
            http,
            crypto,
            key_service_url,
            identity_service_url,
            certificate_server_url,
            certificate_server_pubkey_url,
        })
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, ClientError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.to_string(),
                source,
            })?;

        if !status.is_success() {
            return Err(ClientError::Status {
                url: url.to_string(),
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }

    async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                url: url.to_string(),
                status,
                body,
            });
        }
        Ok(())
    }

    /// Fetch the signer's public key for trust-list verification.
    pub async fn request_certificate_list_public_key(&self) -> Result<Vec<u8>, ClientError> {
        self.get(&self.certificate_server_pubkey_url).await
    }

    /// Announce a freshly generated public key to the PKI backend.
    pub async fn submit_key_registration(
        &self,
        uid: Uuid,
        registration: &[u8],
    ) -> Result<(), ClientError> {
        tracing::debug!(%uid, "submitting key registration");
        self.post(
            &self.key_service_url,
            "application/json",
            registration.to_vec(),
        )
        .await
    }

    /// Submit a certificate signing request (DER) to the PKI backend.
    pub async fn submit_csr(&self, uid: Uuid, csr: &[u8]) -> Result<(), ClientError> {
        tracing::debug!(%uid, "submitting CSR");
        self.post(
            &self.identity_service_url,
            "application/octet-stream",
            csr.to_vec(),
        )
        .await
    }
}

#[async_trait]
impl TrustListSource for PkiClient {
    /// Fetch and verify the trust list. The body is framed as
    /// `base64(signature) "\n" json-bytes`; the signature covers the JSON
    /// bytes verbatim, so no canonicalization happens before verification.
    async fn certificates(&self) -> Result<Vec<CertificateEntry>, ClientError> {
        tracing::debug!("requesting public key certificate list");
        let body = self.get(&self.certificate_server_url).await?;

        let newline = body
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(ClientError::MissingNewline)?;
        let (signature_b64, rest) = body.split_at(newline);
        let cert_list = &rest[1..];

        let signature = BASE64
            .decode(signature_b64)
            .map_err(|e| ClientError::Decode(format!("signature segment: {e}")))?;

        let pub_key_pem = self.request_certificate_list_public_key().await?;
        let ok = self.crypto.verify(&pub_key_pem, cert_list, &signature)?;
        if !ok {
            return Err(ClientError::BadSignature);
        }

        let trust_list: TrustList =
            serde_json::from_slice(cert_list).map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(trust_list.certificates)
    }
}

/// Serde adapter for byte fields carried as base64 strings in JSON.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
