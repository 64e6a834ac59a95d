//! Signing request adapter.
//!
//! Recognized request shapes:
//!
//! | endpoint         | Content-Type               | Content-Transfer-Encoding | body                    |
//! |------------------|----------------------------|---------------------------|-------------------------|
//! | `/:uuid/cbor/hash` | `application/octet-stream` | —                       | raw 32-byte digest      |
//! | `/:uuid/cbor/hash` | `text/plain`               | `hex`                   | hex-encoded digest      |
//! | `/:uuid/cbor/hash` | `text/plain`               | anything else           | base64-encoded digest   |
//! | `/:uuid/cbor`      | `application/cbor`         | —                       | canonical CBOR payload  |
//! | `/:uuid/cbor`      | `application/json`         | —                       | string→string object    |
//!
//! For data requests the digest is `SHA-256(Sig_structure(payload))` and the
//! COSE payload slot carries the (CBOR) payload bytes. For hash requests the
//! payload slot carries the decoded digest itself; the original data is
//! never disclosed to this service.
use crate::api::error::{bad_request, internal, not_found, unauthorized, ApiError};
use crate::api::AUTH_HEADER;
use crate::app::AppState;
use crate::cose::{CoseError, Sha256Sum, SignRequest, HASH_LEN};
use crate::protocol::ProtocolError;
use crate::store::StoreError;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::time::Instant;
use uuid::Uuid;

const BIN_TYPE: &str = "application/octet-stream";
const TEXT_TYPE: &str = "text/plain";
const JSON_TYPE: &str = "application/json";
const CBOR_TYPE: &str = "application/cbor";

const HEX_ENCODING: &str = "hex";

pub async fn sign_data(
    Path(uuid): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    handle_request(state, &uuid, &headers, &body, false).await
}

pub async fn sign_hash(
    Path(uuid): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    handle_request(state, &uuid, &headers, &body, true).await
}

async fn handle_request(
    state: AppState,
    uuid: &str,
    headers: &HeaderMap,
    body: &[u8],
    is_hash_request: bool,
) -> Result<Response, ApiError> {
    let uid = Uuid::parse_str(uuid).map_err(|e| {
        tracing::warn!(uuid, "invalid UUID in request path");
        not_found(format!("invalid UUID: \"{uuid}\": {e}"))
    })?;

    let identity = match state.signer.protocol().get_identity(uid).await {
        Ok(identity) => identity,
        Err(ProtocolError::Store(StoreError::NotFound)) => {
            return Err(not_found("unknown UUID"));
        }
        Err(err) => return Err(internal("identity lookup failed", &err)),
    };

    check_auth(headers, &identity.auth_token)?;

    let (payload, hash) = if is_hash_request {
        let hash = hash_from_hash_request(headers, body).map_err(log_warn(uid))?;
        (hash.to_vec(), hash)
    } else {
        payload_and_hash_from_data_request(&state, headers, body).map_err(log_warn(uid))?
    };

    let request = SignRequest {
        id: uid,
        hash,
        payload,
    };

    let started = Instant::now();
    let cose = match state.signer.sign(&request, &identity.private_key).await {
        Ok(cose) => cose,
        Err(CoseError::Protocol(err @ ProtocolError::SkidUnknown(_))) => {
            tracing::warn!(%uid, error = %err, "rejecting signing request");
            return Err(bad_request(err.to_string()));
        }
        Err(err) => return Err(internal("could not create COSE object", &err)),
    };
    metrics::histogram!("signature_creation_duration_seconds")
        .record(started.elapsed().as_secs_f64());
    metrics::counter!("signature_creations_total").increment(1);

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, CBOR_TYPE)],
        cose,
    )
        .into_response())
}

fn log_warn(uid: Uuid) -> impl FnOnce(ApiError) -> ApiError {
    move |err| {
        tracing::warn!(%uid, message = %err.message, "bad signing request");
        err
    }
}

/// Bearer check: the header value and the stored token are compared as
/// opaque strings.
fn check_auth(headers: &HeaderMap, token: &str) -> Result<(), ApiError> {
    let provided = headers
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if provided != token {
        return Err(unauthorized("invalid auth token"));
    }
    Ok(())
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn content_encoding(headers: &HeaderMap) -> String {
    headers
        .get("Content-Transfer-Encoding")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn hash_from_hash_request(headers: &HeaderMap, body: &[u8]) -> Result<Sha256Sum, ApiError> {
    let decoded = match content_type(headers).as_str() {
        BIN_TYPE => body.to_vec(),
        TEXT_TYPE => {
            let text = std::str::from_utf8(body)
                .map_err(|_| bad_request("hash request body is not valid text"))?;
            if content_encoding(headers) == HEX_ENCODING {
                hex::decode(text.trim())
                    .map_err(|e| bad_request(format!("decoding hex encoded hash failed: {e}")))?
            } else {
                BASE64
                    .decode(text.trim())
                    .map_err(|e| bad_request(format!("decoding base64 encoded hash failed: {e}")))?
            }
        }
        other => {
            return Err(bad_request(format!(
                "invalid content-type for hash: \"{other}\", expected (\"{BIN_TYPE}\" | \"{TEXT_TYPE}\")"
            )));
        }
    };

    Sha256Sum::try_from(decoded.as_slice()).map_err(|_| {
        bad_request(format!(
            "invalid SHA256 hash size: expected {HASH_LEN} bytes, got {} bytes",
            decoded.len()
        ))
    })
}

fn payload_and_hash_from_data_request(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(Vec<u8>, Sha256Sum), ApiError> {
    let payload = match content_type(headers).as_str() {
        JSON_TYPE => state.signer.cbor_from_json(body).map_err(|e| {
            bad_request(format!("unable to CBOR encode JSON object: {e}"))
        })?,
        CBOR_TYPE => body.to_vec(),
        other => {
            return Err(bad_request(format!(
                "invalid content-type for original data: \"{other}\", \
                 expected (\"{CBOR_TYPE}\" | \"{JSON_TYPE}\")"
            )));
        }
    };

    let to_be_signed = state.signer.sig_struct_bytes(&payload);
    let hash: Sha256Sum = Sha256::digest(&to_be_signed).into();
    Ok((payload, hash))
}
