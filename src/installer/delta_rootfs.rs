//! Rootfs installer that also accepts delta images
//!
//! A data file named `<name>.<size>.delta` is patched against the running
//! partition; anything else goes to [`DualRootfs`] unchanged.

use std::io::{Cursor, Read};
use std::path::Path;

use super::{DualRootfs, RebootAction, UpdatePerformer};
use crate::artifact::{ArtifactHeader, DataFile, PayloadHeader};
use crate::blockdev::{BlockDevice, map_write_error};
use crate::delta;
use crate::{Error, Result};

/// Suffix marking a delta data file
pub const DELTA_SUFFIX: &str = ".delta";

/// [`DualRootfs`] with delta support
#[derive(Debug)]
pub struct DeltaRootfs {
    inner: DualRootfs,
}

impl DeltaRootfs {
    /// Wrap a full-image installer
    #[must_use]
    pub const fn new(inner: DualRootfs) -> Self {
        Self { inner }
    }

    fn store_delta(&mut self, reader: &mut dyn Read, file: &DataFile) -> Result<()> {
        let image_size = image_size_from_name(&file.name)?;
        let active = self.inner.active()?;
        let target = self.inner.target()?;

        tracing::info!(
            delta = %file.name,
            base = %active.display(),
            target = %target.display(),
            image_size,
            "applying delta update"
        );
        apply_delta(&active, &target, image_size, reader)
    }
}

/// Patch `active` with the delta in `reader`, writing the result to `target`
fn apply_delta(active: &Path, target: &Path, image_size: i64, reader: &mut dyn Read) -> Result<()> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|_| Error::Delta("delta payload too short".to_string()))?;
    let engine = delta::detect(&magic)
        .ok_or_else(|| Error::Delta(format!("unrecognized delta format {}", hex::encode(magic))))?;

    let mut base = std::fs::File::open(active)
        .map_err(|e| Error::Install(format!("failed to open delta base {}: {e}", active.display())))?;
    let mut device = BlockDevice::open(target, image_size).map_err(|e| match e {
        Error::NoSpace(_) => e,
        e => Error::Install(format!(
            "failed to write the update to the inactive partition {}: {e}",
            target.display()
        )),
    })?;

    let mut delta = Cursor::new(magic).chain(reader);
    let declared = u64::try_from(image_size).unwrap_or(0);
    engine
        .decode(&mut base, &mut delta, &mut device)
        .map_err(|e| match e {
            Error::Io(err) => map_write_error(err, declared),
            other => other,
        })?;

    let stats = device.close()?;
    tracing::info!(
        engine = engine.name(),
        bytes = stats.bytes_accepted,
        "wrote patched image to the inactive partition"
    );
    Ok(())
}

/// Original image size encoded in `name.<size>.delta`
///
/// # Errors
///
/// Returns `Install` if the name carries no size
pub fn image_size_from_name(name: &str) -> Result<i64> {
    let parts: Vec<&str> = name.split('.').collect();
    parts
        .len()
        .checked_sub(2)
        .and_then(|i| parts[i].parse::<i64>().ok())
        .ok_or_else(|| {
            Error::Install(format!("unable to infer original image size from delta file name: {name}"))
        })
}

impl UpdatePerformer for DeltaRootfs {
    fn payload_type(&self) -> &'static str {
        self.inner.payload_type()
    }

    fn initialize(&mut self, artifact: &ArtifactHeader, payload: &PayloadHeader) -> Result<()> {
        self.inner.initialize(artifact, payload)
    }

    fn prepare_store(&mut self) -> Result<()> {
        self.inner.prepare_store()
    }

    fn store_update(&mut self, reader: &mut dyn Read, file: &DataFile) -> Result<()> {
        if file.name.ends_with(DELTA_SUFFIX) {
            return self.store_delta(reader, file);
        }
        self.inner.store_update(reader, file)
    }

    fn finish_store(&mut self) -> Result<()> {
        self.inner.finish_store()
    }

    fn install(&mut self) -> Result<()> {
        self.inner.install()
    }

    fn needs_reboot(&self) -> RebootAction {
        self.inner.needs_reboot()
    }

    fn verify_reboot(&mut self) -> Result<()> {
        self.inner.verify_reboot()
    }

    fn commit(&mut self) -> Result<()> {
        self.inner.commit()
    }

    fn supports_rollback(&self) -> bool {
        self.inner.supports_rollback()
    }

    fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()
    }

    fn rollback_reboot(&mut self) -> Result<()> {
        self.inner.rollback_reboot()
    }

    fn verify_rollback_reboot(&mut self) -> Result<()> {
        self.inner.verify_rollback_reboot()
    }

    fn failure(&mut self) -> Result<()> {
        self.inner.failure()
    }

    fn cleanup(&mut self) -> Result<()> {
        self.inner.cleanup()
    }

    fn save_state(&self) -> Result<serde_json::Value> {
        self.inner.save_state()
    }

    fn restore_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.inner.restore_state(state)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::delta::DeltaEngine;
    use crate::delta::rsync::Rsync;
    use crate::delta::xdelta::Xdelta;
    use crate::installer::MemoryBootEnv;
    use crate::installer::bootenv::BOOT_PART;

    fn images() -> (Vec<u8>, Vec<u8>) {
        let base: Vec<u8> = (0..64 * 1024u32).map(|i| (i.wrapping_mul(7919) >> 3) as u8).collect();
        let mut target = base.clone();
        target[1000..1100].fill(0xaa);
        target.extend_from_slice(b"appended tail");
        (base, target)
    }

    fn install_with(engine: &dyn DeltaEngine) {
        let dir = tempfile::tempdir().unwrap();
        let (base, target) = images();
        let a = dir.path().join("part2");
        let b = dir.path().join("part3");
        std::fs::write(&a, &base).unwrap();
        std::fs::write(&b, b"").unwrap();

        let mut patch = Vec::new();
        engine
            .encode(&mut base.as_slice(), &mut target.as_slice(), &mut patch)
            .unwrap();

        let env = Arc::new(MemoryBootEnv::with_vars(&[(BOOT_PART, "2")]));
        let mut installer = DeltaRootfs::new(DualRootfs::new(a, b.clone(), env));
        let file = DataFile {
            payload_index: 0,
            name: format!("rootfs.img.{}.delta", target.len()),
            size: patch.len() as u64,
        };
        installer.store_update(&mut patch.as_slice(), &file).unwrap();
        assert_eq!(std::fs::read(&b).unwrap(), target);
    }

    #[test]
    fn test_image_size_from_name() {
        assert_eq!(image_size_from_name("rootfs.img.1048576.delta").unwrap(), 1_048_576);
        assert!(image_size_from_name("rootfs.delta").is_err());
        assert!(image_size_from_name("delta").is_err());
    }

    #[test]
    fn test_rsync_delta_install() {
        install_with(&Rsync);
    }

    #[test]
    fn test_xdelta_delta_install() {
        install_with(&Xdelta);
    }

    #[test]
    fn test_unknown_delta_format() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("part2");
        let b = dir.path().join("part3");
        std::fs::write(&a, b"base").unwrap();
        std::fs::write(&b, b"").unwrap();

        let err = apply_delta(&a, &b, 4, &mut b"nope-not-a-delta".as_slice()).unwrap_err();
        assert!(err.to_string().contains("unrecognized delta format"));
    }
}
