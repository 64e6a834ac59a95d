//! HTTP application wiring.
//!
//! # Purpose
//! Builds the axum router, configures middleware, and defines the shared
//! application state injected into handlers.
//!
//! # Notes
//! This module centralizes route composition to keep `main` small and
//! testable; integration tests drive the same router without a listener.
use crate::api;
use crate::cose::CoseSigner;
use crate::identity::IdentityHandler;
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Time after which the transport answers for us when no timely response
/// could be produced.
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct AppState {
    pub signer: Arc<CoseSigner>,
    pub identity_handler: Arc<IdentityHandler>,
    pub register_auth: String,
    pub server_id: String,
}

pub fn build_router(state: AppState) -> Router {
    let trace_layer =
        TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version()
            )
        });

    Router::new()
        .route("/register", put(api::register::register))
        .route("/:uuid/cbor", post(api::sign::sign_data))
        .route("/:uuid/cbor/hash", post(api::sign::sign_hash))
        .route("/healtz", get(api::system::health))
        .route("/readiness", get(api::system::readiness))
        .layer(TimeoutLayer::new(GATEWAY_TIMEOUT))
        .layer(trace_layer)
        .with_state(state)
}
