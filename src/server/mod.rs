//! RDFM server HTTP API
//!
//! Device authorization, update checks and artifact fetches. One
//! [`ServerClient`] serves one device identity and caches its token.

pub mod download;
pub mod metadata;

use std::sync::{Arc, Mutex, PoisonError};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

pub use download::{DownloadSettings, ResumableReader, install_update};
pub use metadata::{KEY_DEVICE_TYPE, KEY_MAC_ADDRESS, KEY_SOFTWARE_VERSION, KEY_TAGS, base_metadata};

use crate::security::{AuthResponse, DeviceKey, DeviceToken, Metadata, SIGNATURE_HEADER, sign_request};
use crate::{Error, Result};

/// Authorization endpoint
pub const AUTH_PATH: &str = "/api/v1/auth/device";

/// Update check endpoint
pub const UPDATE_CHECK_PATH: &str = "/api/v1/update/check";

/// Management WebSocket endpoint
pub const DEVICE_WS_PATH: &str = "/api/v1/devices/ws";

/// Package offered by an update check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    /// Package id
    pub id: i64,
    /// Upload time as reported by the server
    #[serde(default)]
    pub created: String,
    /// SHA-256 of the artifact, hex
    pub sha256: String,
    /// Where to download the artifact
    pub uri: String,
}

/// Client for one device identity
#[derive(Debug)]
pub struct ServerClient {
    base: Url,
    http: reqwest::Client,
    key: Arc<DeviceKey>,
    token: Mutex<Option<DeviceToken>>,
    certificate: Option<Vec<u8>>,
}

impl ServerClient {
    /// Client for `server_url`, trusting `certificate` (PEM) in addition to
    /// the system roots
    ///
    /// # Errors
    ///
    /// Returns `Config` for a bad URL or certificate
    pub fn new(server_url: &str, key: Arc<DeviceKey>, certificate: Option<Vec<u8>>) -> Result<Self> {
        let base = Url::parse(server_url)
            .map_err(|e| Error::Config(format!("invalid server URL {server_url:?}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "server URL must use http or https, got {}",
                base.scheme()
            )));
        }

        let mut builder = reqwest::Client::builder();
        if let Some(pem) = &certificate {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| Error::Config(format!("invalid server certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build()?;

        Ok(Self {
            base,
            http,
            key,
            token: Mutex::new(None),
            certificate,
        })
    }

    /// Server base URL
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base
    }

    /// Extra trusted certificate (PEM)
    #[must_use]
    pub fn certificate(&self) -> Option<&[u8]> {
        self.certificate.as_deref()
    }

    /// Underlying HTTP client
    #[must_use]
    pub const fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// `path` appended to the base URL
    ///
    /// # Errors
    ///
    /// Returns `Config` if the base URL cannot hold a path
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("server URL {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(path.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }

    /// WebSocket URL for `path` (`ws` for `http`, `wss` for `https`)
    ///
    /// # Errors
    ///
    /// Returns `Config` if the URL cannot be converted
    pub fn ws_url(&self, path: &str) -> Result<Url> {
        let mut url = self.endpoint(path)?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| Error::Config(format!("cannot convert {url} to {scheme}")))?;
        Ok(url)
    }

    /// Ask the server for a token
    ///
    /// Returns `false` while an administrator has not accepted the device.
    ///
    /// # Errors
    ///
    /// Returns `Auth` for a rejected request, `Http` for network errors
    pub async fn authorize(&self, metadata: &Metadata) -> Result<bool> {
        let request = sign_request(&self.key, metadata)?;
        self.invalidate_token();

        let response = self
            .http
            .post(self.endpoint(AUTH_PATH)?)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json")
            .header(SIGNATURE_HEADER, request.signature)
            .body(request.body)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let auth: AuthResponse = response.json().await?;
                let token = DeviceToken::new(auth.token)?;
                tracing::info!(expires = auth.expires, "device authorized");
                *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
                Ok(true)
            }
            StatusCode::UNAUTHORIZED => {
                tracing::warn!("device has not been authorized by the administrator");
                Ok(false)
            }
            StatusCode::BAD_REQUEST => Err(Error::Auth("invalid message schema or signature".to_string())),
            status => Err(Error::Auth(format!("unexpected status code from the server: {status}"))),
        }
    }

    /// `Authorization` header value, authorizing first if the cached token
    /// is missing or about to expire
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` while the device is not accepted, or the
    /// authorization error
    pub async fn token(&self, metadata: &Metadata) -> Result<String> {
        if let Some(header) = self.cached_token() {
            return Ok(header);
        }
        if !self.authorize(metadata).await? {
            return Err(Error::Unauthorized);
        }
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(DeviceToken::header_value)
            .ok_or(Error::Unauthorized)
    }

    fn cached_token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|t| !t.needs_refresh())
            .map(DeviceToken::header_value)
    }

    /// Forget the cached token
    pub fn invalidate_token(&self) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Ask whether a newer package exists for `metadata`
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` on 401 (the token is dropped), `Connection`
    /// for other failures
    pub async fn update_check(&self, metadata: &Metadata) -> Result<Option<UpdateInfo>> {
        let token = self.token(metadata).await?;
        tracing::debug!(?metadata, "checking for updates");

        let response = self
            .http
            .post(self.endpoint(UPDATE_CHECK_PATH)?)
            .header(reqwest::header::AUTHORIZATION, token)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(metadata)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let info: UpdateInfo = response.json().await?;
                tracing::info!(package = info.id, uri = %info.uri, "an update is available");
                Ok(Some(info))
            }
            StatusCode::NO_CONTENT => {
                tracing::info!("no updates are available");
                Ok(None)
            }
            StatusCode::BAD_REQUEST => Err(Error::Connection(
                "device metadata is missing device type and/or software version".to_string(),
            )),
            StatusCode::UNAUTHORIZED => {
                self.invalidate_token();
                Err(Error::Unauthorized)
            }
            status => Err(Error::Connection(format!("unexpected status code from the server: {status}"))),
        }
    }

    /// Download a whole artifact into memory and check its digest
    ///
    /// # Errors
    ///
    /// Returns `Checksum` on mismatch, `Http` on transfer errors
    pub async fn fetch_artifact(&self, info: &UpdateInfo) -> Result<Vec<u8>> {
        let body = self.http.get(&info.uri).send().await?.error_for_status()?.bytes().await?;
        let actual = hex::encode(Sha256::digest(&body));
        if !actual.eq_ignore_ascii_case(&info.sha256) {
            return Err(Error::Checksum {
                expected: info.sha256.clone(),
                actual,
            });
        }
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> ServerClient {
        let dir = tempfile::tempdir().unwrap();
        let key = DeviceKey::load_or_create(&dir.path().join("rsa.pem"), 1024).unwrap();
        ServerClient::new(url, Arc::new(key), None).unwrap()
    }

    #[test]
    fn test_endpoints() {
        let c = client("https://rdfm.example.com/base/");
        assert_eq!(
            c.endpoint(UPDATE_CHECK_PATH).unwrap().as_str(),
            "https://rdfm.example.com/base/api/v1/update/check"
        );
        assert_eq!(
            c.ws_url(DEVICE_WS_PATH).unwrap().as_str(),
            "wss://rdfm.example.com/base/api/v1/devices/ws"
        );

        let plain = client("http://127.0.0.1:5000");
        assert_eq!(
            plain.ws_url(DEVICE_WS_PATH).unwrap().as_str(),
            "ws://127.0.0.1:5000/api/v1/devices/ws"
        );
    }

    #[test]
    fn test_rejects_bad_urls() {
        let dir = tempfile::tempdir().unwrap();
        let key = Arc::new(DeviceKey::load_or_create(&dir.path().join("rsa.pem"), 1024).unwrap());
        assert!(ServerClient::new("ftp://example.com", key.clone(), None).is_err());
        assert!(ServerClient::new("not a url", key, None).is_err());
    }

    #[test]
    fn test_update_info_parsing() {
        let info: UpdateInfo = serde_json::from_str(
            r#"{"id": 7, "created": "Mon, 01 Jan 2024 00:00:00 GMT", "sha256": "ab", "uri": "http://x/a"}"#,
        )
        .unwrap();
        assert_eq!(info.id, 7);
        assert_eq!(info.uri, "http://x/a");
    }
}
