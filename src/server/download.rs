//! Resumable artifact download feeding the installer
//!
//! The artifact is streamed straight into [`Device::install`]; nothing but
//! the optional cache file holds the whole image. A body that breaks off is
//! re-requested from the current offset with a `Range` header, and when
//! caching is enabled the bytes already received survive a restart.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT_RANGES, CONTENT_RANGE, RANGE};
use sha2::{Digest, Sha256};

use super::UpdateInfo;
use crate::installer::{Device, InstallOutcome};
use crate::{Error, Result};

/// How downloads retry and where they are cached
#[derive(Debug, Clone, Default)]
pub struct DownloadSettings {
    /// Resume attempts after the body breaks off
    pub retry_count: u32,
    /// Pause before each resume attempt
    pub retry_time: Duration,
    /// Cache directory, `None` to stream without caching
    pub cache_dir: Option<PathBuf>,
    /// Extra trusted certificate (PEM)
    pub certificate: Option<Vec<u8>>,
}

/// Cache file for the artifact with digest `sha256`
#[must_use]
pub fn cache_path(cache_dir: &Path, sha256: &str) -> PathBuf {
    cache_dir.join(format!("update-{}.cache", sha256.to_ascii_lowercase()))
}

/// HTTP body that resumes where it broke off
pub struct ResumableReader {
    client: Client,
    url: String,
    expected_sha256: String,
    response: Option<Response>,
    replay: Option<File>,
    cache: Option<File>,
    offset: u64,
    total: Option<u64>,
    accepts_ranges: bool,
    attempts: u32,
    settings: DownloadSettings,
    hasher: Sha256,
    failure: Option<Error>,
}

impl std::fmt::Debug for ResumableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableReader")
            .field("url", &self.url)
            .field("offset", &self.offset)
            .field("total", &self.total)
            .field("accepts_ranges", &self.accepts_ranges)
            .finish_non_exhaustive()
    }
}

fn content_range_total(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit_once('/')?
        .1
        .parse()
        .ok()
}

fn advertises_ranges(response: &Response) -> bool {
    response
        .headers()
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|unit| unit.trim() == "bytes"))
}

impl ResumableReader {
    /// Start downloading `info`, continuing from a cached prefix if one exists
    ///
    /// # Errors
    ///
    /// Returns `Http` if the first request fails
    pub fn open(info: &UpdateInfo, settings: DownloadSettings) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(pem) = &settings.certificate {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| Error::Config(format!("invalid server certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        let mut reader = Self {
            client: builder.build()?,
            url: info.uri.clone(),
            expected_sha256: info.sha256.to_ascii_lowercase(),
            response: None,
            replay: None,
            cache: None,
            offset: 0,
            total: None,
            accepts_ranges: false,
            attempts: 0,
            settings,
            hasher: Sha256::new(),
            failure: None,
        };
        reader.start()?;
        Ok(reader)
    }

    fn start(&mut self) -> Result<()> {
        let Some(dir) = self.settings.cache_dir.clone() else {
            let response = self.request(0)?;
            return self.accept_full(response);
        };
        std::fs::create_dir_all(&dir)?;
        let path = cache_path(&dir, &self.expected_sha256);
        let cached = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        if cached > 0 {
            let response = self.request(cached)?;
            if response.status() == StatusCode::PARTIAL_CONTENT {
                tracing::info!(path = %path.display(), bytes = cached, "resuming download from cache");
                self.accepts_ranges = true;
                self.total = content_range_total(&response);
                self.replay = Some(File::open(&path)?);
                self.cache = Some(OpenOptions::new().append(true).open(&path)?);
                self.response = Some(response);
                return Ok(());
            }
            tracing::warn!(path = %path.display(), "server ignored the range request, discarding cache");
            self.cache = Some(File::create(&path)?);
            return self.accept_full(response);
        }

        self.cache = Some(File::create(&path)?);
        let response = self.request(0)?;
        self.accept_full(response)
    }

    fn accept_full(&mut self, response: Response) -> Result<()> {
        self.accepts_ranges = advertises_ranges(&response);
        self.total = response.content_length();
        self.response = Some(response);
        Ok(())
    }

    fn request(&self, offset: u64) -> Result<Response> {
        let mut request = self.client.get(&self.url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        Ok(request.send()?.error_for_status()?)
    }

    /// Bytes delivered so far
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Why the download gave up, if it did
    pub fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }

    fn consume(&mut self, data: &[u8], from_network: bool) -> io::Result<()> {
        self.hasher.update(data);
        self.offset += data.len() as u64;
        if from_network && let Some(cache) = &mut self.cache {
            cache.write_all(data)?;
        }
        Ok(())
    }

    fn give_up(&mut self, reason: String) -> io::Error {
        let error = Error::IncompleteDownload {
            received: self.offset,
            expected: self.total.unwrap_or(0),
            reason,
        };
        let io_error = io::Error::other(error.to_string());
        self.failure = Some(error);
        io_error
    }

    fn resume(&mut self, cause: &str) -> io::Result<()> {
        if !self.accepts_ranges {
            return Err(self.give_up(format!("{cause}; server does not advertise Accept-Ranges")));
        }
        loop {
            if self.attempts >= self.settings.retry_count {
                return Err(self.give_up(format!("{cause}; gave up after {} attempts", self.attempts)));
            }
            self.attempts += 1;
            tracing::warn!(
                offset = self.offset,
                attempt = self.attempts,
                retries = self.settings.retry_count,
                cause,
                "download interrupted, resuming"
            );
            std::thread::sleep(self.settings.retry_time);

            match self.request(self.offset) {
                Ok(response) if response.status() == StatusCode::PARTIAL_CONTENT => {
                    self.response = Some(response);
                    return Ok(());
                }
                Ok(response) => {
                    return Err(self.give_up(format!(
                        "{cause}; server answered the range request with {}",
                        response.status()
                    )));
                }
                Err(e) => tracing::warn!(error = %e, "resume request failed"),
            }
        }
    }

    /// Read whatever the consumer left unread and check the digest
    ///
    /// # Errors
    ///
    /// Returns `Checksum` on mismatch, or the download failure
    pub fn finish(&mut self) -> Result<()> {
        if let Err(e) = io::copy(self, &mut io::sink()) {
            return Err(self.take_failure().unwrap_or(Error::Io(e)));
        }
        let actual = hex::encode(self.hasher.clone().finalize());
        if actual == self.expected_sha256 {
            Ok(())
        } else {
            Err(Error::Checksum {
                expected: self.expected_sha256.clone(),
                actual,
            })
        }
    }
}

impl Read for ResumableReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(replay) = &mut self.replay {
            let n = replay.read(buf)?;
            if n > 0 {
                self.consume(&buf[..n], false)?;
                return Ok(n);
            }
            self.replay = None;
        }

        loop {
            let Some(response) = self.response.as_mut() else {
                return Err(self.give_up("no response to read from".to_string()));
            };
            match response.read(buf) {
                Ok(0) => match self.total {
                    Some(total) if self.offset < total => {
                        self.response = None;
                        self.resume("connection closed early")?;
                    }
                    _ => return Ok(0),
                },
                Ok(n) => {
                    self.consume(&buf[..n], true)?;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.response = None;
                    self.resume(&e.to_string())?;
                }
            }
        }
    }
}

/// Download `info` and install it on `device`
///
/// The artifact digest is checked once every payload is stored and before
/// anything is activated or committed. The cache file is removed unless the
/// download itself broke off, so a later attempt can resume it.
///
/// # Errors
///
/// Returns `IncompleteDownload`, `Checksum`, or the installer's error
pub fn install_update(device: &Device, info: &UpdateInfo, settings: DownloadSettings) -> Result<InstallOutcome> {
    let cache = settings.cache_dir.as_deref().map(|dir| cache_path(dir, &info.sha256));
    let mut reader = ResumableReader::open(info, settings)?;

    let result = device
        .install_verified(&mut reader, |stream| stream.finish())
        .map_err(|e| reader.take_failure().unwrap_or(e));

    let keep_cache = matches!(result, Err(Error::IncompleteDownload { .. }));
    if let Some(path) = cache
        && !keep_cache
        && let Err(e) = std::fs::remove_file(&path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "cannot remove download cache");
    }
    result
}
