//! ECDSA P-256 primitives for identity keys.
//!
//! The service signs with exactly one algorithm (ES256); the capability trait
//! keeps the seam where another curve would plug in, but adding one would
//! also require a new COSE protected header and is out of scope.
//!
//! Key representations:
//! - private keys travel as PKCS#8 PEM bytes
//! - public keys travel as SPKI PEM bytes in memory and as the raw 64-byte
//!   uncompressed point (`x || y`, no SEC1 tag) in storage
//! - signatures are fixed-length 64-byte `r || s` concatenations
pub mod keywrap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{Duration, SecondsFormat, Utc};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::generic_array::GenericArray;
use p256::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use p256::EncodedPoint;
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Length of a raw public key: two 32-byte coordinates.
pub const RAW_PUBLIC_KEY_LEN: usize = 64;
/// Length of a raw signature: `r || s`.
pub const SIGNATURE_LEN: usize = 64;

/// Registered key material stays valid for ten years unless revoked
/// out-of-band.
const KEY_VALIDITY_DAYS: i64 = 3650;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("invalid public key encoding: {0}")]
    InvalidPublicKey(String),
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("ciphertext integrity check failed")]
    Integrity,
    #[error("certificate signing request generation failed: {0}")]
    Csr(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Signing/verification capability set. The concrete algorithm is ECDSA over
/// NIST P-256 with SHA-256.
pub trait SignatureCrypto: Send + Sync {
    /// Generate a fresh key pair, returned as PKCS#8 PEM private key bytes.
    fn generate_key(&self) -> CryptoResult<Vec<u8>>;

    /// Derive the SPKI PEM public key from a PEM private key.
    fn public_key_from_private(&self, priv_pem: &[u8]) -> CryptoResult<Vec<u8>>;

    /// PEM public key → raw 64-byte point.
    fn public_key_pem_to_bytes(&self, pub_pem: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Raw 64-byte point → PEM public key.
    fn public_key_bytes_to_pem(&self, raw: &[u8]) -> CryptoResult<Vec<u8>>;

    /// SubjectPublicKeyInfo DER (as carried in an X.509 certificate) → PEM.
    fn public_key_der_to_pem(&self, spki_der: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Sign a pre-computed SHA-256 digest; returns the fixed-length `r || s`.
    fn sign_hash(&self, priv_pem: &[u8], hash: &[u8; 32]) -> CryptoResult<[u8; SIGNATURE_LEN]>;

    /// Verify a raw `r || s` signature over `data` (hashed internally).
    fn verify(&self, pub_pem: &[u8], data: &[u8], signature: &[u8]) -> CryptoResult<bool>;

    /// Self-signed JSON key-registration payload for the PKI backend.
    fn signed_key_registration(&self, priv_pem: &[u8], uid: Uuid) -> CryptoResult<Vec<u8>>;

    /// PKCS#10 certificate signing request, DER-encoded.
    fn csr(
        &self,
        priv_pem: &[u8],
        uid: Uuid,
        country: &str,
        organization: &str,
    ) -> CryptoResult<Vec<u8>>;
}

/// The one production implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct EcdsaCrypto;

fn signing_key_from_pem(priv_pem: &[u8]) -> CryptoResult<SigningKey> {
    let pem = std::str::from_utf8(priv_pem)
        .map_err(|_| CryptoError::InvalidKey("private key PEM is not valid UTF-8".into()))?;
    SigningKey::from_pkcs8_pem(pem).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

fn verifying_key_from_pem(pub_pem: &[u8]) -> CryptoResult<VerifyingKey> {
    let pem = std::str::from_utf8(pub_pem)
        .map_err(|_| CryptoError::InvalidPublicKey("public key PEM is not valid UTF-8".into()))?;
    VerifyingKey::from_public_key_pem(pem).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

fn verifying_key_to_pem(key: &VerifyingKey) -> CryptoResult<Vec<u8>> {
    key.to_public_key_pem(LineEnding::LF)
        .map(String::into_bytes)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Payload the PKI backend expects when a new public key is announced.
/// `signature` covers the JSON serialization of `pub_key_info`.
#[derive(Debug, Serialize)]
struct KeyRegistrationInfo {
    algorithm: String,
    created: String,
    #[serde(rename = "hwDeviceId")]
    hw_device_id: String,
    #[serde(rename = "pubKey")]
    pub_key: String,
    #[serde(rename = "pubKeyId")]
    pub_key_id: String,
    #[serde(rename = "validNotAfter")]
    valid_not_after: String,
    #[serde(rename = "validNotBefore")]
    valid_not_before: String,
}

#[derive(Debug, Serialize)]
struct SignedKeyRegistration {
    #[serde(rename = "pubKeyInfo")]
    pub_key_info: KeyRegistrationInfo,
    signature: String,
}

impl SignatureCrypto for EcdsaCrypto {
    fn generate_key(&self) -> CryptoResult<Vec<u8>> {
        let key = SigningKey::random(&mut OsRng);
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(pem.as_bytes().to_vec())
    }

    fn public_key_from_private(&self, priv_pem: &[u8]) -> CryptoResult<Vec<u8>> {
        let key = signing_key_from_pem(priv_pem)?;
        verifying_key_to_pem(key.verifying_key())
    }

    fn public_key_pem_to_bytes(&self, pub_pem: &[u8]) -> CryptoResult<Vec<u8>> {
        let key = verifying_key_from_pem(pub_pem)?;
        let point = key.to_encoded_point(false);
        // Strip the 0x04 uncompressed-point tag; storage keeps bare x || y.
        Ok(point.as_bytes()[1..].to_vec())
    }

    fn public_key_bytes_to_pem(&self, raw: &[u8]) -> CryptoResult<Vec<u8>> {
        if raw.len() != RAW_PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidPublicKey(format!(
                "raw public key must be {RAW_PUBLIC_KEY_LEN} bytes, got {}",
                raw.len()
            )));
        }
        let point = EncodedPoint::from_untagged_bytes(GenericArray::from_slice(raw));
        let key = VerifyingKey::from_encoded_point(&point)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        verifying_key_to_pem(&key)
    }

    fn public_key_der_to_pem(&self, spki_der: &[u8]) -> CryptoResult<Vec<u8>> {
        let key = VerifyingKey::from_public_key_der(spki_der)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        verifying_key_to_pem(&key)
    }

    fn sign_hash(&self, priv_pem: &[u8], hash: &[u8; 32]) -> CryptoResult<[u8; SIGNATURE_LEN]> {
        let key = signing_key_from_pem(priv_pem)?;
        let signature: Signature = key
            .sign_prehash(hash)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        Ok(signature.to_bytes().into())
    }

    fn verify(&self, pub_pem: &[u8], data: &[u8], signature: &[u8]) -> CryptoResult<bool> {
        let key = verifying_key_from_pem(pub_pem)?;
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        Ok(key.verify(data, &signature).is_ok())
    }

    fn signed_key_registration(&self, priv_pem: &[u8], uid: Uuid) -> CryptoResult<Vec<u8>> {
        let pub_pem = self.public_key_from_private(priv_pem)?;
        let pub_raw = self.public_key_pem_to_bytes(&pub_pem)?;
        let pub_b64 = BASE64.encode(&pub_raw);

        let now = Utc::now();
        let not_after = now + Duration::days(KEY_VALIDITY_DAYS);
        let info = KeyRegistrationInfo {
            algorithm: "ecdsa-p256v1".to_string(),
            created: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            hw_device_id: uid.to_string(),
            pub_key: pub_b64.clone(),
            pub_key_id: pub_b64,
            valid_not_after: not_after.to_rfc3339_opts(SecondsFormat::Secs, true),
            valid_not_before: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        };

        let info_bytes =
            serde_json::to_vec(&info).map_err(|e| CryptoError::Signing(e.to_string()))?;
        let hash: [u8; 32] = Sha256::digest(&info_bytes).into();
        let signature = self.sign_hash(priv_pem, &hash)?;

        let registration = SignedKeyRegistration {
            pub_key_info: info,
            signature: BASE64.encode(signature),
        };
        serde_json::to_vec(&registration).map_err(|e| CryptoError::Signing(e.to_string()))
    }

    fn csr(
        &self,
        priv_pem: &[u8],
        uid: Uuid,
        country: &str,
        organization: &str,
    ) -> CryptoResult<Vec<u8>> {
        let pem = std::str::from_utf8(priv_pem)
            .map_err(|_| CryptoError::InvalidKey("private key PEM is not valid UTF-8".into()))?;
        let key_pair = rcgen::KeyPair::from_pem(pem).map_err(|e| CryptoError::Csr(e.to_string()))?;

        let mut params = rcgen::CertificateParams::default();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CountryName, country);
        params
            .distinguished_name
            .push(rcgen::DnType::OrganizationName, organization);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, uid.to_string());

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| CryptoError::Csr(e.to_string()))?;
        Ok(csr.der().as_ref().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID: Uuid = Uuid::from_u128(0x11111111_1111_1111_1111_111111111111);

    #[test]
    fn public_key_pem_bytes_roundtrip() {
        let crypto = EcdsaCrypto;
        let priv_pem = crypto.generate_key().unwrap();
        let pub_pem = crypto.public_key_from_private(&priv_pem).unwrap();

        let raw = crypto.public_key_pem_to_bytes(&pub_pem).unwrap();
        assert_eq!(raw.len(), RAW_PUBLIC_KEY_LEN);

        let pem_again = crypto.public_key_bytes_to_pem(&raw).unwrap();
        assert_eq!(pub_pem, pem_again);

        let raw_again = crypto.public_key_pem_to_bytes(&pem_again).unwrap();
        assert_eq!(raw, raw_again);
    }

    #[test]
    fn raw_public_key_length_checked() {
        let crypto = EcdsaCrypto;
        assert!(matches!(
            crypto.public_key_bytes_to_pem(&[0u8; 63]),
            Err(CryptoError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn sign_hash_verifies_over_original_data() {
        let crypto = EcdsaCrypto;
        let priv_pem = crypto.generate_key().unwrap();
        let pub_pem = crypto.public_key_from_private(&priv_pem).unwrap();

        let data = b"to be signed";
        let hash: [u8; 32] = Sha256::digest(data).into();
        let signature = crypto.sign_hash(&priv_pem, &hash).unwrap();
        assert_eq!(signature.len(), SIGNATURE_LEN);

        assert!(crypto.verify(&pub_pem, data, &signature).unwrap());
        assert!(!crypto.verify(&pub_pem, b"other data", &signature).unwrap());
    }

    #[test]
    fn verify_rejects_foreign_key() {
        let crypto = EcdsaCrypto;
        let priv_pem = crypto.generate_key().unwrap();
        let other_pub = {
            let other_priv = crypto.generate_key().unwrap();
            crypto.public_key_from_private(&other_priv).unwrap()
        };

        let data = b"payload";
        let hash: [u8; 32] = Sha256::digest(data).into();
        let signature = crypto.sign_hash(&priv_pem, &hash).unwrap();
        assert!(!crypto.verify(&other_pub, data, &signature).unwrap());
    }

    #[test]
    fn key_registration_is_self_signed() {
        let crypto = EcdsaCrypto;
        let priv_pem = crypto.generate_key().unwrap();
        let pub_pem = crypto.public_key_from_private(&priv_pem).unwrap();

        let registration = crypto.signed_key_registration(&priv_pem, UID).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&registration).unwrap();

        let info = &value["pubKeyInfo"];
        assert_eq!(info["algorithm"], "ecdsa-p256v1");
        assert_eq!(info["hwDeviceId"], UID.to_string());

        let info_bytes = serde_json::to_vec(info).unwrap();
        let signature = BASE64
            .decode(value["signature"].as_str().unwrap())
            .unwrap();
        assert!(crypto.verify(&pub_pem, &info_bytes, &signature).unwrap());
    }

    #[test]
    fn csr_is_der_encoded() {
        let crypto = EcdsaCrypto;
        let priv_pem = crypto.generate_key().unwrap();
        let csr = crypto.csr(&priv_pem, UID, "DE", "example org").unwrap();
        assert!(!csr.is_empty());
        // DER SEQUENCE tag of the CertificationRequest.
        assert_eq!(csr[0], 0x30);
    }

    #[test]
    fn spki_der_decodes_to_same_pem() {
        let crypto = EcdsaCrypto;
        let priv_pem = crypto.generate_key().unwrap();
        let pub_pem = crypto.public_key_from_private(&priv_pem).unwrap();

        let key = verifying_key_from_pem(&pub_pem).unwrap();
        let der = key.to_public_key_der().unwrap();
        let pem_from_der = crypto.public_key_der_to_pem(der.as_bytes()).unwrap();
        assert_eq!(pub_pem, pem_from_der);
    }
}
