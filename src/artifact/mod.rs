//! Streaming reader for tar-based update artifacts
//!
//! An artifact is an outer tar holding, in order: `version`, an optional
//! `manifest` (and signature), `header.tar[.gz]`, then one
//! `data/NNNN.tar[.gz]` per payload. The reader never buffers a payload;
//! each data file is handed to a [`PayloadSink`] as a stream.

mod depends;
mod memstore;
mod reader;

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};

pub use depends::{clears_key, verify_dependencies};
pub use memstore::MemoryStore;
pub use reader::ArtifactReader;

use crate::Result;

/// Supported artifact format version
pub const FORMAT_VERSION: u32 = 3;

/// Full or delta root filesystem image
pub const TYPE_ROOTFS_IMAGE: &str = "rootfs-image";

/// Single file placed at a fixed destination
pub const TYPE_SINGLE_FILE: &str = "single-file";

/// MCUboot image for one device
pub const TYPE_ZEPHYR_IMAGE: &str = "zephyr-image";

/// MCUboot images for every member of a device group
pub const TYPE_ZEPHYR_GROUP_IMAGE: &str = "zephyr-group-image";

/// Provides key holding the installed artifact name
pub const KEY_ARTIFACT_NAME: &str = "artifact_name";

/// Depends key listing compatible device types
pub const KEY_DEVICE_TYPE: &str = "device_type";

/// Provides keys published by rootfs artifacts
pub const KEY_ROOTFS_CHECKSUM: &str = "rootfs-image.checksum";
/// Rootfs image version
pub const KEY_ROOTFS_VERSION: &str = "rootfs-image.version";
/// Single zephyr image checksum
pub const KEY_ZEPHYR_CHECKSUM: &str = "zephyr-image.checksum";
/// Single zephyr image version
pub const KEY_ZEPHYR_VERSION: &str = "zephyr-image.version";
/// Group image version
pub const KEY_ZEPHYR_GROUP_VERSION: &str = "zephyr-group-image.version";
/// Prefix of per-member group image checksums
pub const KEY_ZEPHYR_GROUP_TARGET: &str = "zephyr-group-image.target";

/// Value of a depends entry: a single required value or a set of accepted ones
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependValue {
    /// Must equal the installed value
    One(String),
    /// Installed value must be one of these
    Many(Vec<String>),
}

impl DependValue {
    /// Whether `installed` satisfies this requirement
    #[must_use]
    pub fn accepts(&self, installed: &str) -> bool {
        match self {
            Self::One(v) => v == installed,
            Self::Many(vs) => vs.iter().any(|v| v == installed),
        }
    }
}

impl fmt::Display for DependValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(v) => write!(f, "{v}"),
            Self::Many(vs) => write!(f, "[{}]", vs.join(" ")),
        }
    }
}

/// Artifact depends, keyed by provides key
pub type Depends = BTreeMap<String, DependValue>;

/// Artifact or installed-system provides
pub type Provides = BTreeMap<String, String>;

/// Header of one payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Position in the artifact (matches `data/NNNN`)
    pub index: usize,

    /// Payload type, e.g. `rootfs-image`
    pub payload_type: String,

    /// Payload-level depends
    pub depends: Depends,

    /// Payload-level provides
    pub provides: Provides,

    /// Provides keys (globs) the payload removes from the installed set
    pub clears_provides: Vec<String>,

    /// Optional free-form `meta-data`
    pub meta_data: Option<serde_json::Value>,
}

/// Everything known about an artifact once its headers are read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactHeader {
    /// Format name from `version` (`mender` or `rdfm`)
    pub format: String,

    /// Format version
    pub version: u32,

    /// Artifact name
    pub name: String,

    /// Device types the artifact may be installed on
    pub compatible_devices: Vec<String>,

    /// Merged artifact and payload depends
    pub depends: Depends,

    /// Merged artifact and payload provides
    pub provides: Provides,

    /// Union of payload clears-provides
    pub clears_provides: Vec<String>,

    /// Per-payload headers
    pub payloads: Vec<PayloadHeader>,
}

impl ArtifactHeader {
    /// Whether `device_type` is listed as compatible
    #[must_use]
    pub fn is_compatible_with(&self, device_type: &str) -> bool {
        self.compatible_devices.iter().any(|d| d == device_type)
    }
}

/// A data file inside a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    /// Payload the file belongs to
    pub payload_index: usize,

    /// File name inside the payload
    pub name: String,

    /// Size in bytes
    pub size: u64,
}

/// Destination for payload data while the artifact streams by
///
/// Called once per payload: `initialize`, `prepare`, `store` for every
/// file, then `finalize`.
pub trait PayloadSink {
    /// A payload is about to be streamed
    ///
    /// # Errors
    ///
    /// Returns error if the sink cannot handle this payload
    fn initialize(&mut self, artifact: &ArtifactHeader, payload: &PayloadHeader) -> Result<()>;

    /// Called before the first file of the current payload
    ///
    /// # Errors
    ///
    /// Returns error if preparing storage fails
    fn prepare(&mut self) -> Result<()>;

    /// Consume one data file
    ///
    /// # Errors
    ///
    /// Returns error if storing fails
    fn store(&mut self, reader: &mut dyn Read, file: &DataFile) -> Result<()>;

    /// Called after the last file of the current payload
    ///
    /// # Errors
    ///
    /// Returns error if finishing the stored data fails
    fn finalize(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depend_value_accepts() {
        assert!(DependValue::One("a".into()).accepts("a"));
        assert!(!DependValue::One("a".into()).accepts("b"));
        let many = DependValue::Many(vec!["x".into(), "y".into()]);
        assert!(many.accepts("y"));
        assert!(!many.accepts("z"));
    }

    #[test]
    fn depend_value_deserializes_both_shapes() {
        let one: DependValue = serde_json::from_str(r#""v1""#).unwrap();
        let many: DependValue = serde_json::from_str(r#"["v1","v2"]"#).unwrap();
        assert_eq!(one, DependValue::One("v1".into()));
        assert_eq!(many, DependValue::Many(vec!["v1".into(), "v2".into()]));
    }
}
