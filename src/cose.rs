//! COSE_Sign1 assembly.
//!
//! Output discipline is canonical CBOR: minimal-length integers,
//! definite-length containers, deterministic map-key ordering. The protected
//! header is fixed to `{alg: ES256}`, whose serialized form is the three
//! bytes `A1 01 26`; the 8-byte subject key identifier rides in the
//! unprotected header under label 4.
use crate::protocol::{Protocol, ProtocolError, Skid};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ciborium::Value;
use coset::{
    iana, CoseSign1Builder, Header, HeaderBuilder, ProtectedHeader, SignatureContext,
    TaggedCborSerializable,
};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Length of a SHA-256 digest.
pub const HASH_LEN: usize = 32;

pub type Sha256Sum = [u8; HASH_LEN];

/// Transport-neutral signing request produced by the request adapter.
///
/// `payload` carries the bytes that end up in the COSE payload slot: the
/// canonical CBOR of the submitted data, or the digest itself when the
/// caller never discloses the original data.
#[derive(Debug, Clone)]
pub struct SignRequest {
    pub id: Uuid,
    pub hash: Sha256Sum,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum CoseError {
    #[error("unable to parse JSON request body: {0}")]
    InvalidJson(String),
    #[error("unable to encode COSE object: {0}")]
    Encode(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct CoseSigner {
    protocol: Arc<Protocol>,
    /// Protected header `{alg: ES256}`; serializes to `A1 01 26`.
    protected: Header,
}

impl CoseSigner {
    pub fn new(protocol: Arc<Protocol>) -> Self {
        let protected = HeaderBuilder::new()
            .algorithm(iana::Algorithm::ES256)
            .build();
        Self {
            protocol,
            protected,
        }
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    /// Canonical CBOR encoding of the to-be-signed structure
    /// `["Signature1", <protected bstr>, <empty bstr>, <payload bstr>]`.
    /// The SHA-256 of these bytes is what gets signed.
    pub fn sig_struct_bytes(&self, payload: &[u8]) -> Vec<u8> {
        let protected = ProtectedHeader {
            original_data: None,
            header: self.protected.clone(),
        };
        coset::sig_structure_data(SignatureContext::CoseSign1, protected, None, &[], payload)
    }

    /// Re-encode a JSON object with string-only values as canonical CBOR.
    /// Anything that is not a flat string→string object is rejected.
    pub fn cbor_from_json(&self, data: &[u8]) -> Result<Vec<u8>, CoseError> {
        let object: HashMap<String, String> =
            serde_json::from_slice(data).map_err(|e| CoseError::InvalidJson(e.to_string()))?;

        // Canonical map-key ordering: shorter keys first, ties broken by
        // lexicographic byte order.
        let mut entries: Vec<(String, String)> = object.into_iter().collect();
        entries.sort_by(|a, b| a.0.len().cmp(&b.0.len()).then_with(|| a.0.cmp(&b.0)));

        let map = Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Text(k), Value::Text(v)))
                .collect(),
        );
        let mut out = Vec::new();
        ciborium::into_writer(&map, &mut out).map_err(|e| CoseError::Encode(e.to_string()))?;
        Ok(out)
    }

    /// Sign the request digest and assemble the tagged COSE_Sign1:
    /// `Tag(18, [<protected bstr>, {4: <kid>}, <payload bstr>, <sig bstr>])`.
    pub async fn sign(&self, request: &SignRequest, priv_pem: &[u8]) -> Result<Vec<u8>, CoseError> {
        tracing::info!(
            uid = %request.id,
            hash = %BASE64.encode(request.hash),
            "signing request"
        );

        let skid = self.protocol.get_skid(request.id).await?;
        let signature = self
            .protocol
            .crypto()
            .sign_hash(priv_pem, &request.hash)
            .map_err(ProtocolError::from)?;

        self.assemble(&skid, &request.payload, &signature)
    }

    fn assemble(&self, kid: &Skid, payload: &[u8], signature: &[u8]) -> Result<Vec<u8>, CoseError> {
        let unprotected = HeaderBuilder::new().key_id(kid.to_vec()).build();
        let sign1 = CoseSign1Builder::new()
            .protected(self.protected.clone())
            .unprotected(unprotected)
            .payload(payload.to_vec())
            .signature(signature.to_vec())
            .build();

        sign1
            .to_tagged_vec()
            .map_err(|e| CoseError::Encode(e.to_string()))
    }
}
