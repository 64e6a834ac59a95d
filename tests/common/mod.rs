#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::Router;
use cose_signer::app::{build_router, AppState};
use cose_signer::client::PkiClient;
use cose_signer::cose::CoseSigner;
use cose_signer::crypto::EcdsaCrypto;
use cose_signer::identity::IdentityHandler;
use cose_signer::protocol::Protocol;
use cose_signer::store::memory::InMemoryStore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const REGISTER_AUTH: &str = "register-secret";
pub const SERVER_ID: &str = "cose-signer/test";

/// Stand-in for the PKI backend: accepts key registrations and CSRs, and can
/// be switched into failure mode.
pub struct PkiStub {
    pub addr: SocketAddr,
    fail: Arc<AtomicBool>,
}

impl PkiStub {
    pub async fn spawn() -> Self {
        let fail = Arc::new(AtomicBool::new(false));
        let fail_keys = fail.clone();
        let fail_csr = fail.clone();

        let app = Router::new()
            .route(
                "/keys",
                post(move || {
                    let fail = fail_keys.clone();
                    async move {
                        if fail.load(Ordering::SeqCst) {
                            StatusCode::INTERNAL_SERVER_ERROR
                        } else {
                            StatusCode::OK
                        }
                    }
                }),
            )
            .route(
                "/csr",
                post(move || {
                    let fail = fail_csr.clone();
                    async move {
                        if fail.load(Ordering::SeqCst) {
                            StatusCode::INTERNAL_SERVER_ERROR
                        } else {
                            StatusCode::OK
                        }
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind pki stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });

        Self { addr, fail }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

pub struct TestHarness {
    pub router: Router,
    pub protocol: Arc<Protocol>,
    pub pki: PkiStub,
}

/// Full service wiring over the in-memory store, with the PKI stub as the
/// external backend. The reconciler is not spawned; tests publish SKID
/// mappings directly through the protocol handle.
pub async fn harness() -> TestHarness {
    let pki = PkiStub::spawn().await;
    let crypto = Arc::new(EcdsaCrypto);
    let protocol = Arc::new(
        Protocol::new(Arc::new(InMemoryStore::new()), crypto.clone(), &[42u8; 32])
            .expect("protocol"),
    );

    let client = Arc::new(
        PkiClient::new(
            crypto,
            format!("http://{}/keys", pki.addr),
            format!("http://{}/csr", pki.addr),
            format!("http://{}/list", pki.addr),
            format!("http://{}/pubkey", pki.addr),
        )
        .expect("pki client"),
    );

    let identity_handler = Arc::new(IdentityHandler::new(
        protocol.clone(),
        client,
        "DE".to_string(),
        "test org".to_string(),
    ));

    let state = AppState {
        signer: Arc::new(CoseSigner::new(protocol.clone())),
        identity_handler,
        register_auth: REGISTER_AUTH.to_string(),
        server_id: SERVER_ID.to_string(),
    };

    TestHarness {
        router: build_router(state),
        protocol,
        pki,
    }
}

pub fn register_request(uuid: &str, auth: &str, register_auth: &str) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri("/register")
        .header("content-type", "application/json")
        .header("X-Auth-Token", register_auth)
        .body(Body::from(
            serde_json::json!({ "uuid": uuid, "auth": auth }).to_string(),
        ))
        .expect("request")
}

pub async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body")
        .to_vec()
}
