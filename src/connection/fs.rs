//! File transfer requests
//!
//! Files are resolved against a base directory after following symlinks,
//! so neither `..` nor a link can reach outside of it.

use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;

use super::messages::{DeviceMessage, FS_FAILED, FS_OK};

/// Paths the server may read
#[derive(Debug, Clone)]
pub struct FileAccess {
    base_dir: PathBuf,
}

impl FileAccess {
    /// Access limited to `base_dir`
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Canonical path of `file` if it exists inside the base directory
    ///
    /// Relative paths are taken from the base directory.
    #[must_use]
    pub fn resolve(&self, file: &str) -> Option<PathBuf> {
        let base = std::fs::canonicalize(&self.base_dir).ok()?;
        let requested = Path::new(file);
        let requested = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            base.join(requested)
        };
        let resolved = std::fs::canonicalize(requested).ok()?;
        resolved.starts_with(&base).then_some(resolved)
    }
}

/// Answer `fs_file_probe` with the file size
pub async fn probe(access: &FileAccess, id: String, file: &str) -> DeviceMessage {
    let size = match access.resolve(file) {
        Some(path) => tokio::fs::metadata(&path).await.ok().filter(std::fs::Metadata::is_file),
        None => {
            tracing::warn!(file, "file probe outside of the allowed directory");
            None
        }
    };
    match size {
        Some(meta) => DeviceMessage::FsFileProbeReply {
            id,
            status: FS_OK,
            size: meta.len(),
        },
        None => DeviceMessage::FsFileProbeReply {
            id,
            status: FS_FAILED,
            size: 0,
        },
    }
}

async fn upload_parts(
    http: &reqwest::Client,
    path: &Path,
    upload_urls: &[String],
    part_size: u64,
) -> crate::Result<Vec<String>> {
    if part_size == 0 {
        return Err(crate::Error::Connection("part size must be positive".to_string()));
    }
    let mut file = tokio::fs::File::open(path).await?;
    let mut etags = Vec::with_capacity(upload_urls.len());

    for (part, url) in upload_urls.iter().enumerate() {
        let mut chunk = Vec::new();
        (&mut file).take(part_size).read_to_end(&mut chunk).await?;
        if chunk.is_empty() {
            return Err(crate::Error::Connection(format!(
                "file ended before part {part} of {}",
                upload_urls.len()
            )));
        }

        let response = http.put(url).body(chunk).send().await?.error_for_status()?;
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        tracing::debug!(part, %etag, "uploaded file part");
        etags.push(etag);
    }
    Ok(etags)
}

/// Answer `fs_file_download` by uploading the file in parts
pub async fn upload(
    access: &FileAccess,
    http: &reqwest::Client,
    id: String,
    file: &str,
    upload_urls: &[String],
    part_size: u64,
) -> DeviceMessage {
    let Some(path) = access.resolve(file) else {
        tracing::warn!(file, "file download outside of the allowed directory");
        return DeviceMessage::FsFileDownloadReply {
            id,
            status: FS_FAILED,
            etags: Vec::new(),
        };
    };

    match upload_parts(http, &path, upload_urls, part_size).await {
        Ok(etags) => {
            tracing::info!(file = %path.display(), parts = etags.len(), "file uploaded");
            DeviceMessage::FsFileDownloadReply {
                id,
                status: FS_OK,
                etags,
            }
        }
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "file upload failed");
            DeviceMessage::FsFileDownloadReply {
                id,
                status: FS_FAILED,
                etags: Vec::new(),
            }
        }
    }
}
