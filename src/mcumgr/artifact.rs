//! Zephyr artifacts
//!
//! Firmware images are small enough to hold in memory, so both artifact
//! kinds are extracted through a [`MemoryStore`] and checked against the
//! checksums the artifact provides.

use std::collections::BTreeMap;
use std::io::Read;

use sha2::{Digest, Sha256};

use crate::artifact::{
    ArtifactHeader, ArtifactReader, KEY_ZEPHYR_CHECKSUM, KEY_ZEPHYR_GROUP_TARGET,
    KEY_ZEPHYR_GROUP_VERSION, KEY_ZEPHYR_VERSION, MemoryStore, TYPE_ZEPHYR_GROUP_IMAGE,
    TYPE_ZEPHYR_IMAGE,
};
use crate::{Error, Result};

/// Image for one device
#[derive(Debug, Clone)]
pub struct ZephyrArtifact {
    /// Artifact name
    pub name: String,
    /// Declared image version
    pub version: String,
    /// Signed MCUboot image
    pub image: Vec<u8>,
}

/// Images for every member of a group
#[derive(Debug, Clone)]
pub struct GroupArtifact {
    /// Artifact name
    pub name: String,
    /// Version shared by all members
    pub version: String,
    /// Image per member name
    pub images: BTreeMap<String, Vec<u8>>,
}

fn extract(
    artifact: impl Read,
    device_type: &str,
    payload_type: &str,
) -> Result<(ArtifactHeader, BTreeMap<String, Vec<u8>>)> {
    let mut reader = ArtifactReader::new(artifact);
    let header = reader.read_headers()?.clone();

    if !header.is_compatible_with(device_type) {
        return Err(Error::Dependency(format!(
            "artifact {} is not compatible with device type {device_type:?}",
            header.name
        )));
    }
    match header.payloads.as_slice() {
        [payload] if payload.payload_type == payload_type => {}
        [payload] => {
            return Err(Error::Artifact(format!(
                "expected a {payload_type} payload, got {}",
                payload.payload_type
            )));
        }
        payloads => {
            return Err(Error::Artifact(format!(
                "expected exactly one payload, got {}",
                payloads.len()
            )));
        }
    }

    let mut store = MemoryStore::default();
    reader.read_payload_data(&mut store)?;
    Ok((header, store.files))
}

fn provided<'a>(header: &'a ArtifactHeader, key: &str) -> Result<&'a str> {
    header
        .provides
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::Artifact(format!("artifact does not provide {key}")))
}

fn verify_checksum(data: &[u8], expected: &str) -> Result<()> {
    let actual = hex::encode(Sha256::digest(data));
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Error::Checksum {
            expected: expected.to_string(),
            actual,
        })
    }
}

impl ZephyrArtifact {
    /// Read and verify a `zephyr-image` artifact
    ///
    /// # Errors
    ///
    /// Returns `Dependency` for the wrong device type, `Artifact` for a
    /// malformed payload, `Checksum` if the image does not match
    pub fn read(artifact: impl Read, device_type: &str) -> Result<Self> {
        let (header, files) = extract(artifact, device_type, TYPE_ZEPHYR_IMAGE)?;
        if files.len() != 1 {
            return Err(Error::Artifact(format!(
                "zephyr-image payload must hold one file, got {}",
                files.len()
            )));
        }
        let Some(image) = files.into_values().next() else {
            return Err(Error::Artifact("empty zephyr-image payload".to_string()));
        };
        verify_checksum(&image, provided(&header, KEY_ZEPHYR_CHECKSUM)?)?;

        Ok(Self {
            version: provided(&header, KEY_ZEPHYR_VERSION)?.to_string(),
            name: header.name,
            image,
        })
    }
}

impl GroupArtifact {
    /// Read and verify a `zephyr-group-image` artifact
    ///
    /// Each member image is matched to its file through the
    /// `zephyr-group-image.target.<name>` checksum.
    ///
    /// # Errors
    ///
    /// Returns `Dependency` for the wrong group type, `Artifact` if a
    /// target has no matching file
    pub fn read(artifact: impl Read, group_type: &str) -> Result<Self> {
        let (header, files) = extract(artifact, group_type, TYPE_ZEPHYR_GROUP_IMAGE)?;
        let prefix = format!("{KEY_ZEPHYR_GROUP_TARGET}.");

        let by_digest: BTreeMap<String, Vec<u8>> = files
            .into_values()
            .map(|data| (hex::encode(Sha256::digest(&data)), data))
            .collect();

        let mut images = BTreeMap::new();
        for (key, checksum) in &header.provides {
            let Some(target) = key.strip_prefix(&prefix) else {
                continue;
            };
            let image = by_digest
                .get(&checksum.to_ascii_lowercase())
                .ok_or_else(|| Error::Artifact(format!("no image with checksum {checksum} for target {target}")))?;
            images.insert(target.to_string(), image.clone());
        }
        if images.is_empty() {
            return Err(Error::Artifact("group artifact declares no targets".to_string()));
        }

        Ok(Self {
            version: provided(&header, KEY_ZEPHYR_GROUP_VERSION)?.to_string(),
            name: header.name,
            images,
        })
    }

    /// Image for a member
    ///
    /// # Errors
    ///
    /// Returns `Artifact` if the artifact has no image for `member`
    pub fn image_for(&self, member: &str) -> Result<&[u8]> {
        self.images
            .get(member)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::Artifact(format!("artifact has no image for member {member}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_checksum() {
        let digest = hex::encode(Sha256::digest(b"fw"));
        assert!(verify_checksum(b"fw", &digest).is_ok());
        assert!(verify_checksum(b"fw", &digest.to_uppercase()).is_ok());
        assert!(matches!(
            verify_checksum(b"other", &digest),
            Err(Error::Checksum { .. })
        ));
    }

    #[test]
    fn test_image_for_unknown_member() {
        let artifact = GroupArtifact {
            name: "a".into(),
            version: "1.0.0".into(),
            images: BTreeMap::from([("left".to_string(), vec![1])]),
        };
        assert_eq!(artifact.image_for("left").unwrap(), &[1]);
        assert!(artifact.image_for("right").is_err());
    }
}
