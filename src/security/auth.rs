//! Signed device authorization request
//!
//! The body carries the device metadata, its public key and a timestamp.
//! The server checks the `X-RDFM-Device-Signature` header against the
//! public key before it looks at anything else.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::keys::DeviceKey;
use crate::Result;

/// Header carrying the body signature
pub const SIGNATURE_HEADER: &str = "X-RDFM-Device-Signature";

/// Device metadata as sent to the server
pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Serialize)]
struct AuthBody<'a> {
    metadata: &'a Metadata,
    public_key: &'a str,
    timestamp: i64,
}

/// Authorization request ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    /// JSON body, exactly the bytes that were signed
    pub body: Vec<u8>,
    /// Base64 PKCS#1 v1.5 signature of `body`
    pub signature: String,
}

/// Successful authorization
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    /// Token lifetime in seconds
    pub expires: i64,
    /// The device token
    pub token: String,
}

/// Build and sign an authorization request for `metadata`
///
/// # Errors
///
/// Returns error if the body cannot be serialized or signed
pub fn sign_request(key: &DeviceKey, metadata: &Metadata) -> Result<SignedRequest> {
    let body = serde_json::to_vec(&AuthBody {
        metadata,
        public_key: key.public_key_pem(),
        timestamp: Utc::now().timestamp(),
    })?;
    let signature = key.sign(&body)?;
    Ok(SignedRequest { body, signature })
}
