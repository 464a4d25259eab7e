//! Binary delta engines
//!
//! Two interchangeable algorithms, selected by name:
//!
//! - `rsync`: librsync-compatible signature/delta/patch (BLAKE2 strong sums)
//! - `xdelta`: VCDIFF (RFC 3284) encoder and decoder
//!
//! Decoding always streams the delta and the output; the base only needs to
//! be seekable.

pub mod rsync;
pub mod xdelta;

use std::collections::BTreeMap;
use std::io::{Read, Seek, Write};

use crate::{Error, Result};

/// Anything a base image can be read from during patching
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// Metadata key prefix for artifact depends
pub const REQUIRES_PREFIX: &str = "requires:";

/// Metadata key prefix for artifact provides
pub const PROVIDES_PREFIX: &str = "provides:";

/// A delta algorithm
pub trait DeltaEngine: Send + Sync {
    /// Canonical name (`rsync` or `xdelta`)
    fn name(&self) -> &'static str;

    /// Write a delta turning `base` into `target`
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure
    fn encode(&self, base: &mut dyn Read, target: &mut dyn Read, out: &mut dyn Write) -> Result<()>;

    /// Apply `delta` on top of `base`, writing the result to `out`
    ///
    /// # Errors
    ///
    /// Returns `Delta` if the delta is malformed, or on I/O failure
    fn decode(&self, base: &mut dyn ReadSeek, delta: &mut dyn Read, out: &mut dyn Write) -> Result<()>;

    /// Artifact metadata entries, keys prefixed with `requires:` or `provides:`
    fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            format!("{REQUIRES_PREFIX}{}", support_key(self.name())),
            "true".to_string(),
        )])
    }
}

/// Provides key advertising support for `algorithm`
#[must_use]
pub fn support_key(algorithm: &str) -> String {
    format!("rdfm.software.supports_{algorithm}")
}

/// Look an engine up by name
///
/// # Errors
///
/// Returns `Delta` for anything other than `rsync` or `xdelta`
pub fn parse(algorithm: &str) -> Result<Box<dyn DeltaEngine>> {
    match algorithm {
        "rsync" => Ok(Box::new(rsync::Rsync)),
        "xdelta" => Ok(Box::new(xdelta::Xdelta)),
        other => Err(Error::Delta(format!(
            "invalid delta algorithm {other:?}; want \"rsync\" or \"xdelta\""
        ))),
    }
}

/// Every engine this build can apply
#[must_use]
pub fn supported() -> Vec<Box<dyn DeltaEngine>> {
    vec![Box::new(rsync::Rsync), Box::new(xdelta::Xdelta)]
}

/// Pick the engine whose format starts with `magic`
///
/// Used when a delta payload does not say which algorithm produced it.
#[must_use]
pub fn detect(magic: &[u8]) -> Option<Box<dyn DeltaEngine>> {
    if magic.starts_with(&rsync::DELTA_MAGIC.to_be_bytes()) {
        Some(Box::new(rsync::Rsync))
    } else if magic.starts_with(&xdelta::MAGIC) {
        Some(Box::new(xdelta::Xdelta))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_and_unknown() {
        assert_eq!(parse("rsync").unwrap().name(), "rsync");
        assert_eq!(parse("xdelta").unwrap().name(), "xdelta");

        let err = parse("bsdiff").err().unwrap().to_string();
        assert!(err.contains(r#"invalid delta algorithm "bsdiff"; want "rsync" or "xdelta""#));
    }

    #[test]
    fn test_metadata_marks_depends() {
        let meta = parse("xdelta").unwrap().metadata();
        assert_eq!(
            meta.get("requires:rdfm.software.supports_xdelta").map(String::as_str),
            Some("true")
        );
        assert_eq!(meta.len(), 1);
    }

    #[test]
    fn test_detect_by_magic() {
        assert_eq!(detect(&[0x72, 0x73, 0x02, 0x36, 0]).unwrap().name(), "rsync");
        assert_eq!(detect(&[0xd6, 0xc3, 0xc4, 0x00]).unwrap().name(), "xdelta");
        assert!(detect(b"junk").is_none());
    }
}
