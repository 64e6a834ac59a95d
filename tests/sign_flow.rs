mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{body_bytes, harness, register_request, REGISTER_AUTH, SERVER_ID};
use coset::{CoseSign1, TaggedCborSerializable};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tower::ServiceExt;
use uuid::Uuid;

const UUID_A: &str = "11111111-1111-1111-1111-111111111111";
const KID: [u8; 8] = *b"KID-TEST";

/// Register an identity over HTTP and publish a SKID for it.
async fn register_and_publish_skid(harness: &common::TestHarness, uuid: &str, auth: &str) {
    let response = harness
        .router
        .clone()
        .oneshot(register_request(uuid, auth, REGISTER_AUTH))
        .await
        .expect("register");
    assert_eq!(response.status(), StatusCode::OK);

    let uid = Uuid::parse_str(uuid).unwrap();
    let mut mapping = HashMap::new();
    mapping.insert(uid, KID);
    harness.protocol.set_skid_store(mapping).await;
}

fn sign_hash_request(uuid: &str, auth: &str, body: Vec<u8>, content_type: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/{uuid}/cbor/hash"))
        .header("content-type", content_type)
        .header("X-Auth-Token", auth)
        .body(Body::from(body))
        .expect("request")
}

async fn verifying_key(harness: &common::TestHarness, uuid: &str) -> VerifyingKey {
    let uid = Uuid::parse_str(uuid).unwrap();
    let identity = harness.protocol.get_identity(uid).await.unwrap();
    let pem = std::str::from_utf8(&identity.public_key).unwrap();
    VerifyingKey::from_public_key_pem(pem).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn register_then_sign_zero_hash() {
    let harness = harness().await;
    register_and_publish_skid(&harness, UUID_A, "tok-A").await;

    let response = harness
        .router
        .clone()
        .oneshot(sign_hash_request(
            UUID_A,
            "tok-A",
            vec![0u8; 32],
            "application/octet-stream",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let cose = body_bytes(response).await;
    // Tag 18, four-element array, protected header `A1 01 26`.
    assert_eq!(&cose[..6], &[0xD2, 0x84, 0x43, 0xA1, 0x01, 0x26]);

    let decoded = CoseSign1::from_tagged_slice(&cose).unwrap();
    assert_eq!(decoded.unprotected.key_id, KID.to_vec());
    assert_eq!(decoded.payload.as_deref(), Some([0u8; 32].as_slice()));

    // The signature is ECDSA over the submitted digest itself.
    let signature = Signature::from_slice(&decoded.signature).unwrap();
    verifying_key(&harness, UUID_A)
        .await
        .verify_prehash(&[0u8; 32], &signature)
        .expect("signature verifies over the zero digest");
}

#[tokio::test(flavor = "multi_thread")]
async fn hash_request_accepts_hex_and_base64_text() {
    let harness = harness().await;
    register_and_publish_skid(&harness, UUID_A, "tok-A").await;

    let digest = [7u8; 32];

    let hex_request = Request::builder()
        .method("POST")
        .uri(format!("/{UUID_A}/cbor/hash"))
        .header("content-type", "text/plain")
        .header("Content-Transfer-Encoding", "hex")
        .header("X-Auth-Token", "tok-A")
        .body(Body::from(hex::encode(digest)))
        .unwrap();
    let response = harness.router.clone().oneshot(hex_request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let decoded = CoseSign1::from_tagged_slice(&body_bytes(response).await).unwrap();
    assert_eq!(decoded.payload.as_deref(), Some(digest.as_slice()));

    use base64::Engine;
    let b64_request = Request::builder()
        .method("POST")
        .uri(format!("/{UUID_A}/cbor/hash"))
        .header("content-type", "text/plain")
        .header("X-Auth-Token", "tok-A")
        .body(Body::from(
            base64::engine::general_purpose::STANDARD.encode(digest),
        ))
        .unwrap();
    let response = harness.router.clone().oneshot(b64_request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn sign_json_data_payload_is_canonical_cbor() {
    let harness = harness().await;
    register_and_publish_skid(&harness, UUID_A, "tok-A").await;

    let request = Request::builder()
        .method("POST")
        .uri(format!("/{UUID_A}/cbor"))
        .header("content-type", "application/json")
        .header("X-Auth-Token", "tok-A")
        .body(Body::from(r#"{"hello":"world"}"#))
        .unwrap();
    let response = harness.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let cose = body_bytes(response).await;
    let decoded = CoseSign1::from_tagged_slice(&cose).unwrap();

    // Payload slot holds the canonical CBOR of the JSON object.
    let mut expected_payload = vec![0xA1, 0x65];
    expected_payload.extend_from_slice(b"hello");
    expected_payload.push(0x65);
    expected_payload.extend_from_slice(b"world");
    assert_eq!(decoded.payload.as_deref(), Some(expected_payload.as_slice()));

    // Signature verifies over SHA-256(Sig_structure(payload)).
    let mut to_be_signed = vec![0x84, 0x6A];
    to_be_signed.extend_from_slice(b"Signature1");
    to_be_signed.extend_from_slice(&[0x43, 0xA1, 0x01, 0x26, 0x40]);
    assert!(expected_payload.len() < 24);
    to_be_signed.push(0x40 + expected_payload.len() as u8);
    to_be_signed.extend_from_slice(&expected_payload);

    let hash: [u8; 32] = Sha256::digest(&to_be_signed).into();
    let signature = Signature::from_slice(&decoded.signature).unwrap();
    verifying_key(&harness, UUID_A)
        .await
        .verify_prehash(&hash, &signature)
        .expect("signature verifies over the signature structure digest");
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_auth_token_is_unauthorized() {
    let harness = harness().await;
    register_and_publish_skid(&harness, UUID_A, "tok-A").await;

    let response = harness
        .router
        .clone()
        .oneshot(sign_hash_request(
            UUID_A,
            "wrong",
            vec![0u8; 32],
            "application/octet-stream",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_uuid_is_not_found() {
    let harness = harness().await;

    let response = harness
        .router
        .clone()
        .oneshot(sign_hash_request(
            "99999999-9999-9999-9999-999999999999",
            "tok-A",
            vec![0u8; 32],
            "application/octet-stream",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = harness
        .router
        .clone()
        .oneshot(sign_hash_request(
            "not-a-uuid",
            "tok-A",
            vec![0u8; 32],
            "application/octet-stream",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_skid_is_bad_request() {
    let harness = harness().await;
    register_and_publish_skid(&harness, UUID_A, "tok-A").await;
    // Simulate a trust list that no longer carries this identity.
    harness.protocol.set_skid_store(HashMap::new()).await;

    let response = harness
        .router
        .clone()
        .oneshot(sign_hash_request(
            UUID_A,
            "tok-A",
            vec![0u8; 32],
            "application/octet-stream",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("SKID unknown"), "body: {body}");
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_bodies_are_bad_requests() {
    let harness = harness().await;
    register_and_publish_skid(&harness, UUID_A, "tok-A").await;

    // Wrong digest size.
    let response = harness
        .router
        .clone()
        .oneshot(sign_hash_request(
            UUID_A,
            "tok-A",
            vec![0u8; 31],
            "application/octet-stream",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unsupported content type on the hash endpoint.
    let response = harness
        .router
        .clone()
        .oneshot(sign_hash_request(
            UUID_A,
            "tok-A",
            vec![0u8; 32],
            "application/json",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // JSON with non-string values on the data endpoint.
    let request = Request::builder()
        .method("POST")
        .uri(format!("/{UUID_A}/cbor"))
        .header("content-type", "application/json")
        .header("X-Auth-Token", "tok-A")
        .body(Body::from(r#"{"n": 1}"#))
        .unwrap();
    let response = harness.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn health_endpoints_report_server_id() {
    let harness = harness().await;

    for path in ["/healtz", "/readiness"] {
        let request = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let response = harness.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, SERVER_ID.as_bytes());
    }
}
