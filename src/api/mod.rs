//! HTTP adapter for the signing service.
//!
//! Parses the transport envelope into the protocol types, checks the bearer
//! token, and maps errors to the status table. Success bodies are raw bytes
//! (tagged COSE_Sign1 or CSR DER); error bodies are plain text.
pub mod error;
pub mod register;
pub mod sign;
pub mod system;

/// Bearer header shared by registration and signing requests.
pub const AUTH_HEADER: &str = "X-Auth-Token";
