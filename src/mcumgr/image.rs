//! MCUboot image metadata

use std::collections::BTreeMap;
use std::fmt;

use serde_cbor::Value;

use super::smp::{map_bool, map_bytes, map_int, map_text};
use crate::{Error, Result};

/// MCUboot image header magic (little-endian at offset 0)
pub const IMAGE_MAGIC: u32 = 0x96f3_b83d;

/// Offset of the version tuple inside the header
const VERSION_OFFSET: usize = 20;

/// Image slot as reported by the image state command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageEntry {
    /// Image number (multi-image setups)
    pub image: u32,
    /// Slot, 0 is primary
    pub slot: u32,
    /// Version string, `maj.min.rev[+build]`
    pub version: String,
    /// Image hash
    pub hash: Vec<u8>,
    /// Bootable flag
    pub bootable: bool,
    /// Marked for test boot
    pub pending: bool,
    /// Marked permanent
    pub confirmed: bool,
    /// Currently running
    pub active: bool,
    /// Pending permanently
    pub permanent: bool,
}

impl ImageEntry {
    /// Parse one entry of the `images` array
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the entry is not a map
    pub fn from_cbor(value: &Value) -> Result<Self> {
        let Value::Map(map) = value else {
            return Err(Error::Transport("image state entry is not a map".to_string()));
        };
        Ok(Self::from_map(map))
    }

    fn from_map(map: &BTreeMap<Value, Value>) -> Self {
        let small = |key| map_int(map, key).and_then(|v| u32::try_from(v).ok()).unwrap_or(0);
        Self {
            image: small("image"),
            slot: small("slot"),
            version: normalize_version(map_text(map, "version").unwrap_or_default()),
            hash: map_bytes(map, "hash").map(<[u8]>::to_vec).unwrap_or_default(),
            bootable: map_bool(map, "bootable"),
            pending: map_bool(map, "pending"),
            confirmed: map_bool(map, "confirmed"),
            active: map_bool(map, "active"),
            permanent: map_bool(map, "permanent"),
        }
    }

    /// Entry as the image state command reports it
    #[must_use]
    pub fn to_cbor(&self) -> Value {
        let text = |s: &str| Value::Text(s.to_string());
        Value::Map(BTreeMap::from([
            (text("image"), Value::Integer(self.image.into())),
            (text("slot"), Value::Integer(self.slot.into())),
            (text("version"), text(&self.version)),
            (text("hash"), Value::Bytes(self.hash.clone())),
            (text("bootable"), Value::Bool(self.bootable)),
            (text("pending"), Value::Bool(self.pending)),
            (text("confirmed"), Value::Bool(self.confirmed)),
            (text("active"), Value::Bool(self.active)),
            (text("permanent"), Value::Bool(self.permanent)),
        ]))
    }

    /// Hash as lowercase hex
    #[must_use]
    pub fn hash_hex(&self) -> String {
        hex::encode(&self.hash)
    }
}

/// `maj.min.rev.build` → `maj.min.rev+build`
#[must_use]
pub fn normalize_version(version: &str) -> String {
    if version.matches('.').count() == 3
        && let Some((head, build)) = version.rsplit_once('.')
    {
        return format!("{head}+{build}");
    }
    version.to_string()
}

/// Version tuple from the image header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageVersion {
    /// Major
    pub major: u8,
    /// Minor
    pub minor: u8,
    /// Revision
    pub revision: u16,
    /// Build number
    pub build: u32,
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)?;
        if self.build != 0 {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}

impl ImageVersion {
    /// Whether an artifact-declared version string names this version
    #[must_use]
    pub fn matches(&self, declared: &str) -> bool {
        let declared = normalize_version(declared);
        declared == self.to_string()
            || (self.build == 0 && declared == format!("{self}+0"))
    }
}

/// Check the magic and read the version of a signed image
///
/// # Errors
///
/// Returns `Artifact` if the image is too short or has a bad magic
pub fn parse_image_header(image: &[u8]) -> Result<ImageVersion> {
    if image.len() < VERSION_OFFSET + 8 {
        return Err(Error::Artifact(format!("image too short ({} bytes)", image.len())));
    }

    let magic = u32::from_le_bytes([image[0], image[1], image[2], image[3]]);
    if magic != IMAGE_MAGIC {
        return Err(Error::Artifact(format!(
            "bad image (incorrect magic value: expected {IMAGE_MAGIC:#x}, found {magic:#x})"
        )));
    }

    let v = &image[VERSION_OFFSET..VERSION_OFFSET + 8];
    Ok(ImageVersion {
        major: v[0],
        minor: v[1],
        revision: u16::from_le_bytes([v[2], v[3]]),
        build: u32::from_le_bytes([v[4], v[5], v[6], v[7]]),
    })
}
