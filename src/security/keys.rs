//! Device RSA key
//!
//! The key authenticates the device to the server. It lives in a PEM file
//! readable only by the owner; a missing file is replaced by a fresh key.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Key size of the Linux agent
pub const LINUX_KEY_BITS: usize = 4096;

/// Key size of MCUmgr device and group keys
pub const MCUMGR_KEY_BITS: usize = 3072;

/// RSA keypair of one device
pub struct DeviceKey {
    path: PathBuf,
    key: RsaPrivateKey,
    public_pem: String,
}

impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKey").field("path", &self.path).finish_non_exhaustive()
    }
}

impl DeviceKey {
    /// Load the key at `path`, generating a `bits`-bit key if there is none
    ///
    /// # Errors
    ///
    /// Returns `Auth` if the file holds no usable key or a key cannot be
    /// generated, `Io` if it cannot be written
    pub fn load_or_create(path: &Path, bits: usize) -> Result<Self> {
        let pem = match fs::read_to_string(path) {
            Ok(pem) if !pem.trim().is_empty() => Some(pem),
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let key = if let Some(pem) = pem {
            warn_if_exposed(path);
            let key = parse_private_key(&pem)?;
            tracing::debug!(path = %path.display(), "loaded device key");
            key
        } else {
            tracing::info!(path = %path.display(), bits, "generating device key");
            let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
                .map_err(|e| Error::Auth(format!("key generation failed: {e}")))?;
            write_private_key(path, &key)?;
            key
        };

        let public_pem = RsaPublicKey::from(&key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Auth(format!("cannot encode public key: {e}")))?;

        Ok(Self {
            path: path.to_path_buf(),
            key,
            public_pem,
        })
    }

    /// Key file location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Public key as PEM
    #[must_use]
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Sign `data` with RSA PKCS#1 v1.5 over SHA-256, base64-encoded
    ///
    /// # Errors
    ///
    /// Returns `Auth` if signing fails
    pub fn sign(&self, data: &[u8]) -> Result<String> {
        let digest = Sha256::digest(data);
        let signature = self
            .key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| Error::Auth(format!("signing failed: {e}")))?;
        Ok(BASE64.encode(signature))
    }

    /// Check a signature made by [`DeviceKey::sign`]
    #[must_use]
    pub fn verify(&self, data: &[u8], signature: &str) -> bool {
        let Ok(raw) = BASE64.decode(signature) else {
            return false;
        };
        RsaPublicKey::from(&self.key)
            .verify(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data), &raw)
            .is_ok()
    }
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| Error::Auth(format!("device key is neither PKCS#1 nor PKCS#8: {e}")))
}

fn write_private_key(path: &Path, key: &RsaPrivateKey) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::DirBuilder::new().recursive(true).mode(0o700).create(parent)?;
    }
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| Error::Auth(format!("cannot encode device key: {e}")))?;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(pem.as_bytes())?;
    file.sync_all()?;
    tracing::info!(path = %path.display(), "device key written");
    Ok(())
}

fn warn_if_exposed(path: &Path) {
    if let Ok(meta) = fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            tracing::warn!(
                path = %path.display(),
                mode = format_args!("{:o}", mode & 0o777),
                "device key is accessible by other users"
            );
        }
    }
}
