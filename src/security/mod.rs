//! Device identity: RSA key, signed authorization and the server token

pub mod auth;
pub mod keys;
pub mod token;

pub use auth::{AuthResponse, Metadata, SIGNATURE_HEADER, SignedRequest, sign_request};
pub use keys::{DeviceKey, LINUX_KEY_BITS, MCUMGR_KEY_BITS};
pub use token::{DeviceToken, TokenClaims, decode_claims};
