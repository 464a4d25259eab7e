//! Standalone install driver
//!
//! Runs one artifact from stream to installed state, persisting what
//! `commit` and `rollback` need so they can run in a later process.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::state::{STANDALONE_STATE_VERSION, StandaloneState};
use super::{InstallHandler, Installers, ProvidesDb, RebootAction, UpdatePerformer};
use crate::artifact::{ArtifactReader, Provides, verify_dependencies};
use crate::config::Config;
use crate::delta;
use crate::{Error, Result};

/// Result of a successful install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Installed artifact
    pub artifact_name: String,
    /// Committed right away because nothing could be rolled back
    pub committed: bool,
    /// Some payload needs a restart to take effect
    pub reboot_required: bool,
}

/// The device as seen by the installer
#[derive(Debug)]
pub struct Device {
    installers: Installers,
    db: ProvidesDb,
    data_dir: PathBuf,
    device_type: String,
    verification_script: Option<PathBuf>,
}

impl Device {
    /// Device with explicit parts
    #[must_use]
    pub fn new(installers: Installers, db: ProvidesDb, data_dir: PathBuf, device_type: String) -> Self {
        Self {
            installers,
            db,
            data_dir,
            device_type,
            verification_script: None,
        }
    }

    /// Device described by the agent configuration
    ///
    /// # Errors
    ///
    /// Returns error if the device type cannot be read
    pub fn from_config(config: &Config, installers: Installers) -> Result<Self> {
        let device_type = crate::config::load_device_type(&config.device_type_file)?;
        let db = ProvidesDb::new(
            &config.paths.data_dir,
            config.paths.artifact_info(),
            config.paths.provides_info(),
        );
        Ok(Self::new(installers, db, config.paths.data_dir.clone(), device_type)
            .with_verification_script(config.verification_script_path.clone()))
    }

    /// Script that must pass before [`Device::commit`]
    #[must_use]
    pub fn with_verification_script(mut self, script: Option<PathBuf>) -> Self {
        self.verification_script = script;
        self
    }

    /// Device type the artifact must be compatible with
    #[must_use]
    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// Installed artifact name
    ///
    /// # Errors
    ///
    /// Returns error if the provides database is unreadable
    pub fn artifact_name(&self) -> Result<String> {
        self.db.artifact_name()
    }

    /// Installed provides, including `artifact_name`
    ///
    /// # Errors
    ///
    /// Returns error if the provides database is unreadable
    pub fn provides(&self) -> Result<Provides> {
        self.db.provides()
    }

    /// Whether an installed artifact awaits commit or rollback
    #[must_use]
    pub fn update_pending(&self) -> bool {
        StandaloneState::exists(&self.data_dir)
    }

    /// Install an artifact from a stream
    ///
    /// # Errors
    ///
    /// Returns `Artifact`/`Dependency` for incompatible artifacts, or the
    /// installer's error; the installers have been rolled back by then
    pub fn install(&self, artifact: impl Read) -> Result<InstallOutcome> {
        self.install_verified(artifact, |_| Ok(()))
    }

    /// Install an artifact whose stream must pass `verify` first
    ///
    /// `verify` runs once every payload is stored and before any installer
    /// activates its update or anything is committed, so a rejected stream
    /// leaves the device as it was.
    ///
    /// # Errors
    ///
    /// As [`Device::install`], plus whatever `verify` returns
    pub fn install_verified<R: Read>(
        &self,
        artifact: R,
        verify: impl FnOnce(&mut R) -> Result<()>,
    ) -> Result<InstallOutcome> {
        if self.update_pending() {
            return Err(Error::Install(
                "an update is already installed; commit or roll it back first".to_string(),
            ));
        }

        let mut reader = ArtifactReader::new(artifact);
        let header = reader.read_headers()?.clone();
        tracing::info!(artifact = %header.name, payloads = header.payloads.len(), "installing artifact");

        if !header.is_compatible_with(&self.device_type) {
            return Err(Error::Dependency(format!(
                "artifact not compatible with device type {:?} (accepts {:?})",
                self.device_type, header.compatible_devices
            )));
        }

        let mut provides = self.db.provides()?;
        for engine in delta::supported() {
            provides.insert(delta::support_key(engine.name()), "true".to_string());
        }
        verify_dependencies(&header.depends, &provides)?;

        let mut handler = InstallHandler::new(&self.installers);
        if let Err(e) = reader.read_payload_data(&mut handler) {
            tracing::error!(error = %e, "storing the update failed");
            handle_failure(&mut handler.performers);
            return Err(e);
        }
        let mut performers = handler.performers;

        if let Err(e) = verify(reader.get_mut()) {
            tracing::error!(error = %e, "artifact stream rejected, discarding the stored update");
            handle_failure(&mut performers);
            return Err(e);
        }

        for performer in &mut performers {
            if let Err(e) = performer.install() {
                tracing::error!(error = %e, payload = performer.payload_type(), "install failed");
                handle_failure(&mut performers);
                return Err(e);
            }
        }

        let mut clears = header.clears_provides.clone();
        for performer in &performers {
            clears.extend(performer.clears_provides());
        }
        let state = StandaloneState {
            version: STANDALONE_STATE_VERSION,
            artifact_name: header.name.clone(),
            provides: header.provides.clone(),
            clears_provides: clears,
            payload_types: performers.iter().map(|p| p.payload_type().to_string()).collect(),
            payload_states: performers
                .iter()
                .map(|p| p.save_state())
                .collect::<Result<Vec<_>>>()?,
        };
        state.save(&self.data_dir)?;

        let reboot_required = performers
            .iter()
            .any(|p| p.needs_reboot() == RebootAction::Required);
        if reboot_required {
            tracing::info!("at least one payload requested a reboot of the device it updated");
        }

        let committed = if performers.iter().any(|p| p.supports_rollback()) {
            tracing::info!("use 'commit' to update, or 'rollback' to roll back the update");
            false
        } else {
            tracing::info!("artifact doesn't support rollback, committing immediately");
            self.commit_performers(&state, &mut performers)?;
            true
        };

        Ok(InstallOutcome {
            artifact_name: header.name,
            committed,
            reboot_required,
        })
    }

    /// Make the pending install permanent
    ///
    /// # Errors
    ///
    /// Returns `Install` if nothing is pending, or if verification or an
    /// installer's commit fails
    pub fn commit(&self) -> Result<()> {
        tracing::info!("committing artifact");
        let state = StandaloneState::load(&self.data_dir)?;
        let mut performers = self.restore(&state)?;

        if let Some(script) = &self.verification_script {
            check_before_commit(script)?;
        }
        for performer in &mut performers {
            performer.verify_reboot()?;
        }
        self.commit_performers(&state, &mut performers)
    }

    /// Undo the pending install
    ///
    /// # Errors
    ///
    /// Returns `Install` if nothing is pending or an installer fails
    pub fn rollback(&self) -> Result<()> {
        tracing::info!("rolling back artifact");
        let state = StandaloneState::load(&self.data_dir)?;
        let mut performers = self.restore(&state)?;

        for performer in performers.iter_mut().filter(|p| p.supports_rollback()) {
            performer.rollback()?;
            performer.rollback_reboot()?;
            performer.verify_rollback_reboot()?;
        }
        for performer in &mut performers {
            performer.failure()?;
            performer.cleanup()?;
        }

        StandaloneState::remove(&self.data_dir)?;
        tracing::info!(artifact = %state.artifact_name, "artifact rolled back");
        Ok(())
    }

    fn commit_performers(
        &self,
        state: &StandaloneState,
        performers: &mut [Box<dyn UpdatePerformer>],
    ) -> Result<()> {
        for performer in performers.iter_mut() {
            performer.commit()?;
        }
        for performer in performers.iter_mut() {
            performer.cleanup()?;
        }
        self.db
            .commit(&state.artifact_name, &state.provides, &state.clears_provides)?;
        StandaloneState::remove(&self.data_dir)?;
        tracing::info!(artifact = %state.artifact_name, "artifact committed");
        Ok(())
    }

    fn restore(&self, state: &StandaloneState) -> Result<Vec<Box<dyn UpdatePerformer>>> {
        state
            .payload_types
            .iter()
            .zip(state.payload_states.iter().chain(std::iter::repeat(&serde_json::Value::Null)))
            .map(|(payload_type, saved)| {
                let mut performer = self.installers.create(payload_type)?;
                performer.restore_state(saved.clone())?;
                Ok(performer)
            })
            .collect()
    }
}

fn handle_failure(performers: &mut [Box<dyn UpdatePerformer>]) {
    for performer in performers.iter_mut() {
        if performer.supports_rollback()
            && let Err(e) = performer.rollback()
        {
            tracing::error!(error = %e, payload = performer.payload_type(), "rollback failed");
        }
        if let Err(e) = performer.cleanup() {
            tracing::error!(error = %e, payload = performer.payload_type(), "cleanup failed");
        }
    }
}

/// Run the system verification script
///
/// # Errors
///
/// Returns `Install` if the script is missing or exits non-zero
pub fn check_before_commit(script: &Path) -> Result<()> {
    let output = Command::new(script)
        .output()
        .map_err(|e| Error::Install(format!("cannot run verification script {}: {e}", script.display())))?;

    let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
    log.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        tracing::info!(output = %log.trim_end(), "system correctness successfully verified");
        Ok(())
    } else {
        tracing::error!(output = %log.trim_end(), "system correctness verification failed");
        Err(Error::Install(format!(
            "verification script {} failed with {}",
            script.display(),
            output.status
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("verify.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_verification_script_success() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_before_commit(&script(dir.path(), "echo valid; exit 0")).is_ok());
    }

    #[test]
    fn test_verification_script_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_before_commit(&script(dir.path(), "echo invalid; echo error >&2; exit 1")).unwrap_err();
        assert!(err.to_string().contains("failed"));
    }

    #[test]
    fn test_verification_script_missing() {
        assert!(check_before_commit(Path::new("/this/path/is/invalid")).is_err());
    }

    #[test]
    fn test_commit_without_pending_install() {
        let dir = tempfile::tempdir().unwrap();
        let db = ProvidesDb::new(dir.path(), dir.path().join("a"), dir.path().join("p"));
        let device = Device::new(Installers::new(), db, dir.path().to_path_buf(), "dev".into());
        let err = device.commit().unwrap_err();
        assert!(err.to_string().contains("no update in progress"));
        let err = device.rollback().unwrap_err();
        assert!(err.to_string().contains("no update in progress"));
    }
}
