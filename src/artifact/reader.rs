//! Outer-archive walker
//!
//! The outer tar is walked block by block so that headers and payload data
//! can be consumed in separate calls without holding a borrowed entry
//! iterator. Nested `header.tar` and `data/NNNN.tar` archives are read with
//! the `tar` crate.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{
    ArtifactHeader, DataFile, DependValue, Depends, FORMAT_VERSION, KEY_ARTIFACT_NAME,
    KEY_DEVICE_TYPE, PayloadHeader, PayloadSink, Provides,
};
use crate::{Error, Result};

/// Tar block size
const BLOCK: u64 = 512;

#[derive(Debug, Deserialize)]
struct VersionInfo {
    format: String,
    version: u32,
}

#[derive(Debug, Deserialize)]
struct HeaderInfo {
    #[serde(default)]
    payloads: Vec<PayloadType>,
    #[serde(default)]
    artifact_provides: Provides,
    #[serde(default)]
    artifact_depends: Depends,
}

#[derive(Debug, Deserialize)]
struct PayloadType {
    #[serde(rename = "type")]
    payload_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct TypeInfo {
    #[serde(rename = "type")]
    payload_type: Option<String>,
    #[serde(default)]
    artifact_provides: Option<Provides>,
    #[serde(default)]
    artifact_depends: Option<Depends>,
    #[serde(default)]
    clears_artifact_provides: Option<Vec<String>>,
}

#[derive(Debug)]
struct OuterEntry {
    name: String,
    size: u64,
}

/// Streaming artifact reader
pub struct ArtifactReader<R: Read> {
    inner: R,
    header: Option<ArtifactHeader>,
    manifest: Option<BTreeMap<String, String>>,
    next_payload: usize,
}

impl<R: Read> ArtifactReader<R> {
    /// Wrap an artifact byte stream
    pub const fn new(inner: R) -> Self {
        Self {
            inner,
            header: None,
            manifest: None,
            next_payload: 0,
        }
    }

    /// Headers, once [`ArtifactReader::read_headers`] succeeded
    #[must_use]
    pub const fn header(&self) -> Option<&ArtifactHeader> {
        self.header.as_ref()
    }

    /// The underlying stream
    pub const fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Consume the stream up to and including the header archive
    ///
    /// # Errors
    ///
    /// Returns `Artifact` if the layout, version or headers are invalid
    pub fn read_headers(&mut self) -> Result<&ArtifactHeader> {
        if self.header.is_some() {
            return Err(Error::Artifact("headers already read".to_string()));
        }

        let first = self
            .next_entry()?
            .ok_or_else(|| Error::Artifact("empty artifact".to_string()))?;
        if first.name != "version" {
            return Err(Error::Artifact(format!(
                "expected 'version' as first entry, found '{}'",
                first.name
            )));
        }
        let raw = self.read_entry_to_vec(&first)?;
        let version: VersionInfo = serde_json::from_slice(&raw)
            .map_err(|e| Error::Artifact(format!("invalid version entry: {e}")))?;
        if version.version != FORMAT_VERSION {
            return Err(Error::Artifact(format!(
                "unsupported artifact version {} (want {FORMAT_VERSION})",
                version.version
            )));
        }
        let version_digest = hex::encode(Sha256::digest(&raw));

        loop {
            let entry = self
                .next_entry()?
                .ok_or_else(|| Error::Artifact("artifact has no header".to_string()))?;

            match entry.name.as_str() {
                "manifest" => {
                    let raw = self.read_entry_to_vec(&entry)?;
                    let manifest = parse_manifest(&raw)?;
                    check_manifest(Some(&manifest), "version", &version_digest)?;
                    self.manifest = Some(manifest);
                }
                "manifest.sig" | "manifest-augment" | "manifest-augment.sig" => {
                    tracing::debug!(entry = %entry.name, "skipping signature entry");
                    self.skip_entry(&entry)?;
                }
                name if name.starts_with("header.tar") => {
                    let header = self.read_header_archive(&entry, version)?;
                    tracing::debug!(
                        artifact = %header.name,
                        payloads = header.payloads.len(),
                        "artifact headers read"
                    );
                    return Ok(self.header.insert(header));
                }
                other => {
                    return Err(Error::Artifact(format!("unexpected entry '{other}' before header")));
                }
            }
        }
    }

    /// Stream every payload's data files into `sink`
    ///
    /// # Errors
    ///
    /// Returns `Artifact` on layout or checksum problems, or whatever the
    /// sink returns
    pub fn read_payload_data(&mut self, sink: &mut dyn PayloadSink) -> Result<()> {
        let header = self
            .header
            .clone()
            .ok_or_else(|| Error::Artifact("headers must be read before payload data".to_string()))?;

        while let Some(entry) = self.next_entry()? {
            if entry.name.starts_with("header-augment") {
                self.skip_entry(&entry)?;
                continue;
            }

            let index = data_index(&entry.name).ok_or_else(|| {
                Error::Artifact(format!("unexpected entry '{}' in data section", entry.name))
            })?;
            if index != self.next_payload {
                return Err(Error::Artifact(format!(
                    "payload data out of order: expected {:04}, found {index:04}",
                    self.next_payload
                )));
            }
            let payload = header.payloads.get(index).ok_or_else(|| {
                Error::Artifact(format!("data for payload {index:04} has no header"))
            })?;

            sink.initialize(&header, payload)?;
            sink.prepare()?;
            self.read_data_archive(&entry, payload, sink)?;
            sink.finalize()?;

            self.next_payload += 1;
        }

        if self.next_payload < header.payloads.len() {
            tracing::debug!(
                read = self.next_payload,
                declared = header.payloads.len(),
                "artifact declares payloads without data"
            );
        }

        Ok(())
    }

    fn read_header_archive(&mut self, entry: &OuterEntry, version: VersionInfo) -> Result<ArtifactHeader> {
        let compressed = is_gzip(&entry.name)?;
        let manifest = self.manifest.clone();
        let name = entry.name.clone();

        let mut header_info = None;
        let mut type_infos: BTreeMap<usize, TypeInfo> = BTreeMap::new();
        let mut meta: BTreeMap<usize, serde_json::Value> = BTreeMap::new();

        let digest = self.with_entry(entry, |body| {
            let mut hashing = HashingReader::new(body);
            {
                let decoded: Box<dyn Read + '_> = if compressed {
                    Box::new(GzDecoder::new(&mut hashing))
                } else {
                    Box::new(&mut hashing)
                };
                let mut archive = tar::Archive::new(decoded);
                for file in archive.entries()? {
                    let mut file = file?;
                    let path = file.path()?.to_string_lossy().into_owned();
                    let path = path.trim_start_matches("./");

                    if path == "header-info" {
                        header_info = Some(
                            serde_json::from_reader::<_, HeaderInfo>(&mut file)
                                .map_err(|e| Error::Artifact(format!("invalid header-info: {e}")))?,
                        );
                    } else if let Some((idx, leaf)) = header_sub_path(path) {
                        match leaf {
                            "type-info" => {
                                let info = serde_json::from_reader(&mut file).map_err(|e| {
                                    Error::Artifact(format!("invalid type-info for payload {idx:04}: {e}"))
                                })?;
                                type_infos.insert(idx, info);
                            }
                            "meta-data" => {
                                let mut raw = Vec::new();
                                file.read_to_end(&mut raw)?;
                                if !raw.is_empty() {
                                    let value = serde_json::from_slice(&raw).map_err(|e| {
                                        Error::Artifact(format!("invalid meta-data for payload {idx:04}: {e}"))
                                    })?;
                                    meta.insert(idx, value);
                                }
                            }
                            _ => {}
                        }
                    }
                }
                // Trailing padding after the inner end-of-archive blocks
                io::copy(&mut archive.into_inner(), &mut io::sink())?;
            }
            io::copy(&mut hashing, &mut io::sink())?;
            Ok(hashing.finish())
        })?;
        check_manifest(manifest.as_ref(), &name, &digest)?;

        let info = header_info.ok_or_else(|| Error::Artifact("header has no header-info".to_string()))?;
        assemble_header(version, info, type_infos, meta)
    }

    fn read_data_archive(
        &mut self,
        entry: &OuterEntry,
        payload: &PayloadHeader,
        sink: &mut dyn PayloadSink,
    ) -> Result<()> {
        let compressed = is_gzip(&entry.name)?;
        let manifest = self.manifest.clone();
        let index = payload.index;

        self.with_entry(entry, |body| {
            let decoded: Box<dyn Read + '_> = if compressed {
                Box::new(GzDecoder::new(body))
            } else {
                Box::new(body)
            };
            let mut archive = tar::Archive::new(decoded);

            for file in archive.entries()? {
                let file = file?;
                if !file.header().entry_type().is_file() {
                    continue;
                }
                let path = file.path()?.into_owned();
                let name = file_name(&path)?;
                let info = DataFile {
                    payload_index: index,
                    name: name.clone(),
                    size: file.size(),
                };

                tracing::debug!(payload = index, file = %name, size = info.size, "storing payload file");

                let mut hashing = HashingReader::new(file);
                sink.store(&mut hashing, &info)?;
                io::copy(&mut hashing, &mut io::sink())?;

                let digest = hashing.finish();
                check_manifest(manifest.as_ref(), &format!("data/{index:04}/{name}"), &digest)?;
            }

            io::copy(&mut archive.into_inner(), &mut io::sink())?;
            Ok(())
        })
    }

    /// Read the next regular file header from the outer archive
    fn next_entry(&mut self) -> Result<Option<OuterEntry>> {
        loop {
            let mut block = [0u8; 512];
            if !read_block(&mut self.inner, &mut block)? {
                return Ok(None);
            }
            if block.iter().all(|b| *b == 0) {
                return Ok(None);
            }

            let header = tar::Header::from_byte_slice(&block);
            let size = header
                .entry_size()
                .map_err(|e| Error::Artifact(format!("corrupt tar header: {e}")))?;
            let name = String::from_utf8_lossy(&header.path_bytes())
                .trim_start_matches("./")
                .to_string();
            let entry = OuterEntry { name, size };

            if header.entry_type().is_file() {
                return Ok(Some(entry));
            }

            tracing::trace!(entry = %entry.name, "skipping non-file tar entry");
            self.skip_entry(&entry)?;
        }
    }

    /// Run `f` over the entry body, then drain what it left and the padding
    fn with_entry<T>(
        &mut self,
        entry: &OuterEntry,
        f: impl FnOnce(&mut io::Take<&mut R>) -> Result<T>,
    ) -> Result<T> {
        let mut body = (&mut self.inner).take(entry.size);
        let out = f(&mut body)?;
        io::copy(&mut body, &mut io::sink())?;
        skip_padding(&mut self.inner, entry.size)?;
        Ok(out)
    }

    fn read_entry_to_vec(&mut self, entry: &OuterEntry) -> Result<Vec<u8>> {
        self.with_entry(entry, |body| {
            let mut raw = Vec::new();
            body.read_to_end(&mut raw)?;
            Ok(raw)
        })
    }

    fn skip_entry(&mut self, entry: &OuterEntry) -> Result<()> {
        self.with_entry(entry, |_| Ok(()))
    }
}

/// SHA-256 while reading
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Fill `block`, returning `false` on a clean end of stream
fn read_block(r: &mut impl Read, block: &mut [u8; 512]) -> Result<bool> {
    let mut filled = 0;
    while filled < block.len() {
        match r.read(&mut block[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(Error::Artifact("truncated tar header".to_string())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn skip_padding(r: &mut impl Read, size: u64) -> Result<()> {
    let pad = (BLOCK - size % BLOCK) % BLOCK;
    let skipped = io::copy(&mut r.take(pad), &mut io::sink())?;
    if skipped != pad {
        return Err(Error::Artifact("truncated tar padding".to_string()));
    }
    Ok(())
}

fn is_gzip(name: &str) -> Result<bool> {
    if name.ends_with(".tar") {
        Ok(false)
    } else if name.ends_with(".tar.gz") {
        Ok(true)
    } else {
        Err(Error::Artifact(format!("unsupported compression for '{name}'")))
    }
}

/// `data/0003.tar.gz` -> 3
fn data_index(name: &str) -> Option<usize> {
    let rest = name.strip_prefix("data/")?;
    let stem = rest.split('.').next()?;
    if stem.len() != 4 {
        return None;
    }
    stem.parse().ok()
}

/// `headers/0001/type-info` -> (1, "type-info")
fn header_sub_path(path: &str) -> Option<(usize, &str)> {
    let rest = path.strip_prefix("headers/")?;
    let (idx, leaf) = rest.split_once('/')?;
    Some((idx.parse().ok()?, leaf))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Artifact(format!("invalid data file path '{}'", path.display())))
}

/// `<sha256>  <path>` per line
fn parse_manifest(raw: &[u8]) -> Result<BTreeMap<String, String>> {
    let text = std::str::from_utf8(raw).map_err(|_| Error::Artifact("manifest is not UTF-8".to_string()))?;
    let mut manifest = BTreeMap::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = line.split_whitespace();
        let (Some(sum), Some(path)) = (parts.next(), parts.next()) else {
            return Err(Error::Artifact(format!("malformed manifest line '{line}'")));
        };
        manifest.insert(path.to_string(), sum.to_lowercase());
    }
    Ok(manifest)
}

fn check_manifest(manifest: Option<&BTreeMap<String, String>>, path: &str, digest: &str) -> Result<()> {
    let Some(manifest) = manifest else {
        return Ok(());
    };
    match manifest.get(path) {
        Some(expected) if expected == digest => Ok(()),
        Some(expected) => Err(Error::Checksum {
            expected: format!("{expected} ({path})"),
            actual: digest.to_string(),
        }),
        None => Err(Error::Artifact(format!("'{path}' is not listed in the manifest"))),
    }
}

fn assemble_header(
    version: VersionInfo,
    info: HeaderInfo,
    type_infos: BTreeMap<usize, TypeInfo>,
    mut meta: BTreeMap<usize, serde_json::Value>,
) -> Result<ArtifactHeader> {
    let name = info
        .artifact_provides
        .get(KEY_ARTIFACT_NAME)
        .cloned()
        .ok_or_else(|| Error::Artifact("header-info has no artifact_name".to_string()))?;

    let compatible_devices = match info.artifact_depends.get(KEY_DEVICE_TYPE) {
        Some(DependValue::Many(devices)) => devices.clone(),
        Some(DependValue::One(device)) => vec![device.clone()],
        None => Vec::new(),
    };

    let mut depends = info.artifact_depends.clone();
    let mut provides = info.artifact_provides.clone();
    let mut clears_provides = Vec::new();
    let mut payloads = Vec::with_capacity(info.payloads.len());

    for (index, declared) in info.payloads.iter().enumerate() {
        let type_info = type_infos.get(&index);
        if let Some(t) = type_info.and_then(|t| t.payload_type.as_ref())
            && *t != declared.payload_type
        {
            return Err(Error::Artifact(format!(
                "payload {index:04} type mismatch: header-info says '{}', type-info says '{t}'",
                declared.payload_type
            )));
        }

        let payload_depends = type_info.and_then(|t| t.artifact_depends.clone()).unwrap_or_default();
        let payload_provides = type_info.and_then(|t| t.artifact_provides.clone()).unwrap_or_default();
        let payload_clears = type_info
            .and_then(|t| t.clears_artifact_provides.clone())
            .unwrap_or_default();

        for (key, value) in &payload_depends {
            match depends.get(key) {
                Some(existing) if existing != value => {
                    return Err(Error::Artifact(format!("conflicting depends for key '{key}'")));
                }
                _ => {
                    depends.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, value) in &payload_provides {
            provides.insert(key.clone(), value.clone());
        }
        for key in &payload_clears {
            if !clears_provides.contains(key) {
                clears_provides.push(key.clone());
            }
        }

        payloads.push(PayloadHeader {
            index,
            payload_type: declared.payload_type.clone(),
            depends: payload_depends,
            provides: payload_provides,
            clears_provides: payload_clears,
            meta_data: meta.remove(&index),
        });
    }

    Ok(ArtifactHeader {
        format: version.format,
        version: version.version,
        name,
        compatible_devices,
        depends,
        provides,
        clears_provides,
        payloads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_index() {
        assert_eq!(data_index("data/0000.tar"), Some(0));
        assert_eq!(data_index("data/0012.tar.gz"), Some(12));
        assert_eq!(data_index("data/12.tar"), None);
        assert_eq!(data_index("header.tar"), None);
    }

    #[test]
    fn test_header_sub_path() {
        assert_eq!(header_sub_path("headers/0001/type-info"), Some((1, "type-info")));
        assert_eq!(header_sub_path("header-info"), None);
    }

    #[test]
    fn test_manifest_parsing() {
        let raw = b"AABB  data/0000/file.bin\nccdd  version\n\n";
        let manifest = parse_manifest(raw).unwrap();
        assert_eq!(manifest["data/0000/file.bin"], "aabb");
        assert_eq!(manifest["version"], "ccdd");
        assert!(parse_manifest(b"onlyonefield\n").is_err());
    }

    #[test]
    fn test_rejects_wrong_first_entry() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_ustar();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "manifest", &b"{}"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let mut reader = ArtifactReader::new(bytes.as_slice());
        let err = reader.read_headers().unwrap_err().to_string();
        assert!(err.contains("expected 'version'"));
    }
}
