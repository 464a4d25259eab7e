//! Device token issued by the server
//!
//! The token is a JWT whose claims say how long it lives. The device never
//! verifies the signature, it only reads `expires` to know when to
//! authenticate again.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::{Error, Result};

/// Re-authenticate this long before the token runs out
pub const EXPIRY_MARGIN_SECONDS: i64 = 5;

/// Claims the server puts in a device token
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenClaims {
    /// Device identifier the token was issued to
    pub device_id: String,

    /// Issue time (unix seconds)
    #[serde(alias = "created")]
    pub created_at: i64,

    /// Lifetime in seconds
    pub expires: i64,
}

/// Decode the claims of `token` without checking its signature
///
/// # Errors
///
/// Returns `Auth` if the token is not a JWT carrying the device claims
pub fn decode_claims(token: &str) -> Result<TokenClaims> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    jsonwebtoken::decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| Error::Auth(format!("malformed device token: {e}")))
}

/// A token together with the time it was obtained
#[derive(Debug, Clone)]
pub struct DeviceToken {
    raw: SecretString,
    claims: TokenClaims,
    acquired: DateTime<Utc>,
}

impl DeviceToken {
    /// Wrap a token just received from the server
    ///
    /// # Errors
    ///
    /// Returns `Auth` for an empty or undecodable token
    pub fn new(raw: String) -> Result<Self> {
        Self::acquired_at(raw, Utc::now())
    }

    /// Wrap a token obtained at `acquired`
    ///
    /// # Errors
    ///
    /// Returns `Auth` for an empty or undecodable token
    pub fn acquired_at(raw: String, acquired: DateTime<Utc>) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::Auth("server returned an empty token".to_string()));
        }
        let claims = decode_claims(&raw)?;
        Ok(Self {
            raw: SecretString::from(raw),
            claims,
            acquired,
        })
    }

    /// Decoded claims
    #[must_use]
    pub const fn claims(&self) -> &TokenClaims {
        &self.claims
    }

    /// Value for the `Authorization` header
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("Bearer token={}", self.raw.expose_secret())
    }

    /// Time after which the token should be replaced
    ///
    /// A lifetime that does not fit a timestamp counts as already expired.
    #[must_use]
    pub fn refresh_at(&self) -> DateTime<Utc> {
        self.claims
            .expires
            .checked_sub(EXPIRY_MARGIN_SECONDS)
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| self.acquired.checked_add_signed(lifetime))
            .unwrap_or(self.acquired)
    }

    /// Whether the token is about to expire at `now`
    #[must_use]
    pub fn needs_refresh_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.refresh_at()
    }

    /// Whether the token is about to expire
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh_at(Utc::now())
    }
}
