//! Identity registration endpoint.
use crate::api::error::{bad_request, conflict, internal, unauthorized, ApiError};
use crate::api::AUTH_HEADER;
use crate::app::AppState;
use crate::identity::RegistrationError;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct RegistrationRequest {
    pub uuid: Uuid,
    pub auth: String,
}

/// `PUT /register`, guarded by the service-wide registration token. Returns
/// the identity's CSR (DER) on success.
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let provided = headers
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if provided != state.register_auth {
        return Err(unauthorized("invalid auth token"));
    }

    let request: RegistrationRequest = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("unable to parse registration request: {e}")))?;

    if request.uuid.is_nil() {
        return Err(bad_request("uuid has nil value"));
    }
    if request.auth.is_empty() {
        return Err(bad_request("empty auth token"));
    }

    let csr = match state
        .identity_handler
        .init_identity(request.uuid, request.auth)
        .await
    {
        Ok(csr) => csr,
        Err(RegistrationError::AlreadyExists) => {
            return Err(conflict("identity is already registered"));
        }
        Err(err) => return Err(internal("identity registration failed", &err)),
    };

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        csr,
    )
        .into_response())
}
