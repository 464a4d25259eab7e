//! Single-file installer
//!
//! The payload carries four small metadata files (`dest_dir`, `filename`,
//! `permissions`, `rollback_support`) followed by the file itself.

use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::UpdatePerformer;
use crate::artifact::{DataFile, TYPE_SINGLE_FILE};
use crate::{Error, Result};

/// Clears key that matches nothing, so committing keeps unrelated provides
pub const SINGLE_FILE_CLEARS_KEY: &str = "this-key-cannot-appear-in-provides-80030197597109825875732137944464795696111936699651028614245931085587374788033687";

const DEST_DIR: &str = "dest_dir";
const FILENAME: &str = "filename";
const PERMISSIONS: &str = "permissions";
const ROLLBACK_SUPPORT: &str = "rollback_support";

/// Metadata files are tiny; anything bigger is not one
const MAX_METADATA_SIZE: u64 = 4096;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct SingleFileState {
    dest_dir: PathBuf,
    filename: String,
    permissions: u32,
    rollback_support: bool,
    staged: Option<PathBuf>,
    backup: Option<PathBuf>,
    had_original: bool,
    installed: bool,
}

/// Places one file at a fixed destination
///
/// The payload is written next to the destination first and only moved
/// into place by [`UpdatePerformer::install`].
#[derive(Debug, Default)]
pub struct SingleFile {
    state: SingleFileState,
}

impl SingleFile {
    /// Fresh installer
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SingleFileState {
                permissions: 0o644,
                ..SingleFileState::default()
            },
        }
    }

    fn destination(&self) -> PathBuf {
        self.state.dest_dir.join(&self.state.filename)
    }

    fn stage_file(&mut self, reader: &mut dyn Read) -> Result<()> {
        if self.state.dest_dir.as_os_str().is_empty() {
            return Err(Error::Install("the destination directory path cannot be empty".to_string()));
        }
        if !self.state.dest_dir.exists() {
            tracing::info!(dir = %self.state.dest_dir.display(), "creating destination directory");
            fs::create_dir_all(&self.state.dest_dir)?;
        }

        let staged = self.state.dest_dir.join(format!(".{}.new", self.state.filename));
        self.state.staged = Some(staged.clone());
        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(self.state.permissions)
            .open(&staged)?;
        io::copy(reader, &mut out)?;
        out.sync_all()?;
        tracing::debug!(path = %staged.display(), "file staged");
        Ok(())
    }
}

fn read_metadata(reader: &mut dyn Read, file: &DataFile) -> Result<String> {
    if file.size > MAX_METADATA_SIZE {
        return Err(Error::Install(format!("metadata file {} is too large", file.name)));
    }
    let mut value = String::new();
    reader.read_to_string(&mut value)?;
    Ok(value.trim().to_string())
}

impl UpdatePerformer for SingleFile {
    fn payload_type(&self) -> &'static str {
        TYPE_SINGLE_FILE
    }

    fn store_update(&mut self, reader: &mut dyn Read, file: &DataFile) -> Result<()> {
        match file.name.as_str() {
            DEST_DIR => self.state.dest_dir = PathBuf::from(read_metadata(reader, file)?),
            FILENAME => self.state.filename = read_metadata(reader, file)?,
            PERMISSIONS => {
                let raw = read_metadata(reader, file)?;
                self.state.permissions = u32::from_str_radix(&raw, 8)
                    .map_err(|_| Error::Install(format!("invalid permissions {raw:?}")))?;
            }
            ROLLBACK_SUPPORT => {
                self.state.rollback_support = read_metadata(reader, file)? == "true";
                tracing::info!(rollback = self.state.rollback_support, "single-file rollback support");
            }
            name if !self.state.filename.is_empty() && name == self.state.filename => {
                self.stage_file(reader)?;
            }
            other => tracing::debug!(file = other, "ignoring unexpected payload file"),
        }
        Ok(())
    }

    fn install(&mut self) -> Result<()> {
        let Some(staged) = self.state.staged.take() else {
            return Err(Error::Install(format!("no content was stored for {}", self.state.filename)));
        };
        let dest = self.destination();
        self.state.had_original = dest.exists();

        if self.state.rollback_support && self.state.had_original {
            let backup = self.state.dest_dir.join(format!("{}.tmp", self.state.filename));
            fs::copy(&dest, &backup)?;
            self.state.backup = Some(backup);
        }

        fs::rename(&staged, &dest)?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(self.state.permissions))?;
        self.state.installed = true;

        tracing::info!(path = %dest.display(), mode = format!("{:o}", self.state.permissions), "file updated");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if let Some(backup) = self.state.backup.take() {
            remove_if_exists(&backup)?;
        }
        Ok(())
    }

    fn supports_rollback(&self) -> bool {
        self.state.rollback_support
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.state.installed {
            return Ok(());
        }
        let dest = self.destination();
        match self.state.backup.take() {
            Some(backup) => {
                fs::rename(&backup, &dest)?;
                tracing::info!(path = %dest.display(), "restored previous file");
            }
            None if !self.state.had_original => {
                remove_if_exists(&dest)?;
                tracing::info!(path = %dest.display(), "removed newly installed file");
            }
            None => {}
        }
        self.state.installed = false;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        if let Some(staged) = self.state.staged.take() {
            remove_if_exists(&staged)?;
        }
        Ok(())
    }

    fn clears_provides(&self) -> Vec<String> {
        vec![SINGLE_FILE_CLEARS_KEY.to_string()]
    }

    fn save_state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.state = serde_json::from_value(state)?;
        Ok(())
    }
}

fn remove_if_exists(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(installer: &mut SingleFile, name: &str, data: &[u8]) {
        let file = DataFile {
            payload_index: 0,
            name: name.to_string(),
            size: data.len() as u64,
        };
        installer.store_update(&mut &data[..], &file).unwrap();
    }

    fn stage(dir: &std::path::Path, rollback: bool, content: &[u8]) -> SingleFile {
        let mut installer = SingleFile::new();
        feed(&mut installer, DEST_DIR, dir.to_string_lossy().as_bytes());
        feed(&mut installer, FILENAME, b"app.conf\n");
        feed(&mut installer, PERMISSIONS, b"600");
        feed(&mut installer, ROLLBACK_SUPPORT, if rollback { b"true".as_slice() } else { b"false".as_slice() });
        feed(&mut installer, "app.conf", content);
        installer
    }

    fn install(dir: &std::path::Path, rollback: bool, content: &[u8]) -> SingleFile {
        let mut installer = stage(dir, rollback, content);
        installer.install().unwrap();
        installer
    }

    #[test]
    fn test_staged_file_is_not_visible_until_install() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app.conf");
        std::fs::write(&target, b"old").unwrap();

        let mut installer = stage(dir.path(), false, b"new");
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
        assert!(dir.path().join(".app.conf.new").exists());

        installer.rollback().unwrap();
        installer.cleanup().unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
        assert!(!dir.path().join(".app.conf.new").exists());
    }

    #[test]
    fn test_install_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app.conf");
        std::fs::write(&target, b"old").unwrap();

        let mut installer = install(dir.path(), true, b"new");
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
        assert_eq!(std::fs::metadata(&target).unwrap().permissions().mode() & 0o777, 0o600);
        assert!(dir.path().join("app.conf.tmp").exists());

        installer.commit().unwrap();
        assert!(!dir.path().join("app.conf.tmp").exists());
    }

    #[test]
    fn test_rollback_restores_original() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app.conf");
        std::fs::write(&target, b"old").unwrap();

        let first = install(dir.path(), true, b"new");
        let saved = first.save_state().unwrap();

        let mut restored = SingleFile::new();
        restored.restore_state(saved).unwrap();
        assert!(restored.supports_rollback());
        restored.rollback().unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"old");
        assert!(!dir.path().join("app.conf.tmp").exists());
    }

    #[test]
    fn test_rollback_removes_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut installer = install(&dir.path().join("sub"), true, b"new");
        assert!(dir.path().join("sub/app.conf").exists());

        installer.rollback().unwrap();
        assert!(!dir.path().join("sub/app.conf").exists());
    }

    #[test]
    fn test_no_rollback_support() {
        let dir = tempfile::tempdir().unwrap();
        let installer = install(dir.path(), false, b"new");
        assert!(!installer.supports_rollback());
        assert!(!dir.path().join("app.conf.tmp").exists());
        assert_eq!(installer.clears_provides(), vec![SINGLE_FILE_CLEARS_KEY.to_string()]);
    }

    #[test]
    fn test_empty_destination_rejected() {
        let mut installer = SingleFile::new();
        feed(&mut installer, FILENAME, b"x");
        let file = DataFile {
            payload_index: 0,
            name: "x".into(),
            size: 1,
        };
        assert!(installer.store_update(&mut &b"1"[..], &file).is_err());
    }
}
