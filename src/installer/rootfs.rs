//! A/B root filesystem installer

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::bootenv::{BOOT_COUNT, BOOT_PART, BOOT_PART_HEX, BootEnvironment, UPGRADE_AVAILABLE};
use super::{RebootAction, UpdatePerformer};
use crate::artifact::{DataFile, TYPE_ROOTFS_IMAGE};
use crate::blockdev::{BlockDevice, map_write_error};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RootfsState {
    active: PathBuf,
    inactive: PathBuf,
}

/// Writes full images to the inactive partition and switches the bootloader
pub struct DualRootfs {
    part_a: PathBuf,
    part_b: PathBuf,
    env: Arc<dyn BootEnvironment>,
    active_override: Option<PathBuf>,
    state: Option<RootfsState>,
}

impl std::fmt::Debug for DualRootfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualRootfs")
            .field("part_a", &self.part_a)
            .field("part_b", &self.part_b)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl DualRootfs {
    /// Installer for the partition pair
    #[must_use]
    pub fn new(part_a: PathBuf, part_b: PathBuf, env: Arc<dyn BootEnvironment>) -> Self {
        Self {
            part_a,
            part_b,
            env,
            active_override: None,
            state: None,
        }
    }

    /// Treat `active` as the running partition instead of probing `/`
    #[must_use]
    pub fn with_active(mut self, active: PathBuf) -> Self {
        self.active_override = Some(active);
        self
    }

    /// Running and spare partitions
    ///
    /// # Errors
    ///
    /// Returns `Install` if neither partition can be identified as active
    pub fn partitions(&self) -> Result<(PathBuf, PathBuf)> {
        let active = match &self.active_override {
            Some(active) => active.clone(),
            None => self.detect_active()?,
        };

        if active == self.part_a {
            Ok((self.part_a.clone(), self.part_b.clone()))
        } else if active == self.part_b {
            Ok((self.part_b.clone(), self.part_a.clone()))
        } else {
            Err(Error::Install(format!(
                "active partition {} is neither {} nor {}",
                active.display(),
                self.part_a.display(),
                self.part_b.display()
            )))
        }
    }

    fn detect_active(&self) -> Result<PathBuf> {
        if let Ok(root) = std::fs::metadata("/") {
            for part in [&self.part_a, &self.part_b] {
                if let Ok(meta) = std::fs::metadata(part)
                    && meta.rdev() == root.dev()
                {
                    return Ok(part.clone());
                }
            }
        }

        // Fall back to what the bootloader thinks it booted
        let vars = self.env.read(&[BOOT_PART])?;
        let booted = vars
            .get(BOOT_PART)
            .ok_or_else(|| Error::Install("unable to determine the active partition".to_string()))?;
        [&self.part_a, &self.part_b]
            .into_iter()
            .find(|part| partition_number(part).as_deref() == Some(booted.as_str()))
            .cloned()
            .ok_or_else(|| Error::Install(format!("boot partition {booted} matches no rootfs partition")))
    }

    fn state(&mut self) -> Result<&RootfsState> {
        if self.state.is_none() {
            let (active, inactive) = self.partitions()?;
            self.state = Some(RootfsState { active, inactive });
        }
        self.state
            .as_ref()
            .ok_or_else(|| Error::Install("rootfs state unavailable".to_string()))
    }

    /// Partition the update is written to
    ///
    /// # Errors
    ///
    /// Returns error if the partitions cannot be resolved
    pub fn target(&mut self) -> Result<PathBuf> {
        Ok(self.state()?.inactive.clone())
    }

    /// Partition currently running
    ///
    /// # Errors
    ///
    /// Returns error if the partitions cannot be resolved
    pub fn active(&mut self) -> Result<PathBuf> {
        Ok(self.state()?.active.clone())
    }

    fn boot_into(&self, partition: &Path, trial: bool) -> Result<()> {
        let number = partition_number(partition).ok_or_else(|| {
            Error::Install(format!("no partition number in {}", partition.display()))
        })?;
        let hex = number
            .parse::<u32>()
            .map(|n| format!("{n:x}"))
            .map_err(|_| Error::Install(format!("bad partition number {number}")))?;

        let mut vars = BTreeMap::from([
            (BOOT_PART.to_string(), number),
            (BOOT_PART_HEX.to_string(), hex),
            (UPGRADE_AVAILABLE.to_string(), if trial { "1" } else { "0" }.to_string()),
        ]);
        if trial {
            vars.insert(BOOT_COUNT.to_string(), "0".to_string());
        }
        self.env.write(&vars)
    }
}

impl UpdatePerformer for DualRootfs {
    fn payload_type(&self) -> &'static str {
        TYPE_ROOTFS_IMAGE
    }

    fn prepare_store(&mut self) -> Result<()> {
        let state = self.state()?;
        tracing::info!(
            active = %state.active.display(),
            target = %state.inactive.display(),
            "preparing rootfs update"
        );
        Ok(())
    }

    fn store_update(&mut self, reader: &mut dyn Read, file: &DataFile) -> Result<()> {
        let target = self.target()?;
        let size = i64::try_from(file.size).map_err(|_| Error::Install("image too large".to_string()))?;
        write_image(&target, size, reader)
    }

    fn install(&mut self) -> Result<()> {
        let target = self.target()?;
        self.boot_into(&target, true)?;
        tracing::info!(partition = %target.display(), "next boot switches to the updated partition");
        Ok(())
    }

    fn needs_reboot(&self) -> RebootAction {
        RebootAction::Required
    }

    fn verify_reboot(&mut self) -> Result<()> {
        let vars = self.env.read(&[UPGRADE_AVAILABLE])?;
        if vars.get(UPGRADE_AVAILABLE).map(String::as_str) != Some("1") {
            return Err(Error::Install(
                "reboot into the new update failed: bootloader dropped the trial".to_string(),
            ));
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let vars = BTreeMap::from([(UPGRADE_AVAILABLE.to_string(), "0".to_string())]);
        self.env.write(&vars)?;
        tracing::info!("rootfs update committed");
        Ok(())
    }

    fn supports_rollback(&self) -> bool {
        true
    }

    fn rollback(&mut self) -> Result<()> {
        let active = self.active()?;
        self.boot_into(&active, false)?;
        tracing::info!(partition = %active.display(), "boot partition restored");
        Ok(())
    }

    fn save_state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.state.clone().unwrap_or_default())?)
    }

    fn restore_state(&mut self, state: serde_json::Value) -> Result<()> {
        let state: RootfsState = serde_json::from_value(state)?;
        if !state.active.as_os_str().is_empty() {
            self.state = Some(state);
        }
        Ok(())
    }
}

/// Stream `size` bytes from `reader` onto `target`
pub(super) fn write_image(target: &Path, size: i64, reader: &mut dyn Read) -> Result<()> {
    let mut device = BlockDevice::open(target, size)?;
    let declared = u64::try_from(size).unwrap_or(0);
    io::copy(reader, &mut device).map_err(|e| map_write_error(e, declared))?;
    device.close()?;
    Ok(())
}

/// Trailing digits of a partition path (`/dev/mmcblk0p3` → `3`)
#[must_use]
pub fn partition_number(path: &Path) -> Option<String> {
    let name = path.to_string_lossy();
    let digits: String = name
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    (!digits.is_empty()).then_some(digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::MemoryBootEnv;

    fn setup(dir: &Path) -> (PathBuf, PathBuf, Arc<MemoryBootEnv>) {
        let a = dir.join("part2");
        let b = dir.join("part3");
        std::fs::write(&a, vec![1u8; 4096]).unwrap();
        std::fs::write(&b, vec![0u8; 4096]).unwrap();
        (a, b, Arc::new(MemoryBootEnv::with_vars(&[(BOOT_PART, "2")])))
    }

    #[test]
    fn test_partition_number() {
        assert_eq!(partition_number(Path::new("/dev/mmcblk0p3")).as_deref(), Some("3"));
        assert_eq!(partition_number(Path::new("/dev/sda12")).as_deref(), Some("12"));
        assert_eq!(partition_number(Path::new("/dev/root")), None);
    }

    #[test]
    fn test_active_from_boot_env() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, env) = setup(dir.path());
        let rootfs = DualRootfs::new(a.clone(), b.clone(), env);
        assert_eq!(rootfs.partitions().unwrap(), (a, b));
    }

    #[test]
    fn test_install_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, env) = setup(dir.path());
        let mut rootfs = DualRootfs::new(a, b.clone(), env.clone());

        let image = vec![7u8; 4096];
        let file = DataFile {
            payload_index: 0,
            name: "rootfs.img".into(),
            size: 4096,
        };
        rootfs.prepare_store().unwrap();
        rootfs.store_update(&mut image.as_slice(), &file).unwrap();
        rootfs.install().unwrap();

        assert_eq!(std::fs::read(&b).unwrap(), image);
        assert_eq!(env.get(BOOT_PART).as_deref(), Some("3"));
        assert_eq!(env.get(UPGRADE_AVAILABLE).as_deref(), Some("1"));
        assert_eq!(env.get(BOOT_COUNT).as_deref(), Some("0"));
        assert_eq!(rootfs.needs_reboot(), RebootAction::Required);

        rootfs.verify_reboot().unwrap();
        rootfs.commit().unwrap();
        assert_eq!(env.get(UPGRADE_AVAILABLE).as_deref(), Some("0"));
    }

    #[test]
    fn test_rollback_after_restore() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, env) = setup(dir.path());

        let mut first = DualRootfs::new(a.clone(), b.clone(), env.clone());
        first.install().unwrap();
        let saved = first.save_state().unwrap();

        let mut second = DualRootfs::new(a, b, env.clone());
        second.restore_state(saved).unwrap();
        second.rollback().unwrap();

        assert_eq!(env.get(BOOT_PART).as_deref(), Some("2"));
        assert_eq!(env.get(BOOT_PART_HEX).as_deref(), Some("2"));
        assert_eq!(env.get(UPGRADE_AVAILABLE).as_deref(), Some("0"));
    }

    #[test]
    fn test_oversized_image_is_no_space() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, env) = setup(dir.path());
        let mut rootfs = DualRootfs::new(a, b, env);

        let image = vec![7u8; 100];
        let file = DataFile {
            payload_index: 0,
            name: "rootfs.img".into(),
            size: 10,
        };
        let err = rootfs.store_update(&mut image.as_slice(), &file).unwrap_err();
        assert!(matches!(err, Error::NoSpace(10)));
    }
}
