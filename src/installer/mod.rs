//! Update installers
//!
//! Each payload type has an [`UpdatePerformer`] that walks the install
//! lifecycle:
//!
//! ```text
//! initialize → prepare_store → store_update* → finish_store → install
//!   → (reboot) → verify_reboot → commit
//! ```
//!
//! Any failure before commit takes the rollback branch
//! (`rollback → rollback_reboot → verify_rollback_reboot → failure → cleanup`).
//! [`Device`] drives one artifact through that lifecycle and persists what is
//! needed to commit or roll back after a reboot.

pub mod bootenv;
mod delta_rootfs;
mod device;
mod rootfs;
mod single_file;
pub mod state;

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

pub use bootenv::{BootEnvironment, MemoryBootEnv, UBootEnv};
pub use delta_rootfs::DeltaRootfs;
pub use device::{Device, InstallOutcome};
pub use rootfs::DualRootfs;
pub use single_file::{SINGLE_FILE_CLEARS_KEY, SingleFile};
pub use state::{ProvidesDb, StandaloneState};

use crate::artifact::{ArtifactHeader, DataFile, PayloadHeader, PayloadSink};
use crate::{Error, Result};

/// Whether a payload needs the device restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootAction {
    /// Active immediately
    NoReboot,
    /// Takes effect after a restart
    Required,
}

/// Installer for one payload type
#[allow(unused_variables)]
pub trait UpdatePerformer: Send {
    /// Payload type handled
    fn payload_type(&self) -> &'static str;

    /// Headers of the payload about to be stored
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be handled
    fn initialize(&mut self, artifact: &ArtifactHeader, payload: &PayloadHeader) -> Result<()> {
        Ok(())
    }

    /// Called before the first data file
    ///
    /// # Errors
    ///
    /// Returns error if the target cannot be prepared
    fn prepare_store(&mut self) -> Result<()> {
        Ok(())
    }

    /// Consume one data file
    ///
    /// # Errors
    ///
    /// Returns error if storing fails
    fn store_update(&mut self, reader: &mut dyn Read, file: &DataFile) -> Result<()>;

    /// Called after the last data file
    ///
    /// # Errors
    ///
    /// Returns error if the stored data is incomplete
    fn finish_store(&mut self) -> Result<()> {
        Ok(())
    }

    /// Activate the stored update
    ///
    /// # Errors
    ///
    /// Returns error if activation fails
    fn install(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether a restart is needed
    fn needs_reboot(&self) -> RebootAction {
        RebootAction::NoReboot
    }

    /// Check the update survived the restart
    ///
    /// # Errors
    ///
    /// Returns error if the device did not boot into the update
    fn verify_reboot(&mut self) -> Result<()> {
        Ok(())
    }

    /// Make the update permanent
    ///
    /// # Errors
    ///
    /// Returns error if committing fails
    fn commit(&mut self) -> Result<()>;

    /// Whether [`UpdatePerformer::rollback`] can undo the update
    fn supports_rollback(&self) -> bool;

    /// Restore the previous state
    ///
    /// # Errors
    ///
    /// Returns error if restoring fails
    fn rollback(&mut self) -> Result<()>;

    /// Restart into the previous state
    ///
    /// # Errors
    ///
    /// Returns error if the restart cannot be arranged
    fn rollback_reboot(&mut self) -> Result<()> {
        Ok(())
    }

    /// Check the rollback took effect
    ///
    /// # Errors
    ///
    /// Returns error if the device is not back on the previous state
    fn verify_rollback_reboot(&mut self) -> Result<()> {
        Ok(())
    }

    /// The install failed for good
    ///
    /// # Errors
    ///
    /// Returns error if failure handling fails
    fn failure(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release resources held for the install
    ///
    /// # Errors
    ///
    /// Returns error if cleanup fails
    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Extra provides keys this installer clears
    fn clears_provides(&self) -> Vec<String> {
        Vec::new()
    }

    /// State needed to commit or roll back from another process
    ///
    /// # Errors
    ///
    /// Returns error if the state cannot be serialized
    fn save_state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    /// Counterpart of [`UpdatePerformer::save_state`]
    ///
    /// # Errors
    ///
    /// Returns error if the state is malformed
    fn restore_state(&mut self, state: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Builds a fresh performer
pub type PerformerFactory = Arc<dyn Fn() -> Box<dyn UpdatePerformer> + Send + Sync>;

/// Installers by payload type
#[derive(Clone, Default)]
pub struct Installers {
    factories: BTreeMap<String, PerformerFactory>,
}

impl std::fmt::Debug for Installers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installers")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Installers {
    /// No installers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-file installer plus, when partitions are configured, the
    /// delta-capable dual-rootfs installer
    #[must_use]
    pub fn standard(rootfs: Option<(std::path::PathBuf, std::path::PathBuf)>, env: Arc<dyn BootEnvironment>) -> Self {
        let mut installers = Self::new();
        installers.register(crate::artifact::TYPE_SINGLE_FILE, || Box::new(SingleFile::new()));

        if let Some((part_a, part_b)) = rootfs {
            installers.register(crate::artifact::TYPE_ROOTFS_IMAGE, move || {
                Box::new(DeltaRootfs::new(DualRootfs::new(
                    part_a.clone(),
                    part_b.clone(),
                    Arc::clone(&env),
                )))
            });
        } else {
            tracing::warn!("no rootfs partitions configured, rootfs-image payloads are unsupported");
        }
        installers
    }

    /// Register (or replace) the installer for `payload_type`
    pub fn register<F>(&mut self, payload_type: &str, factory: F)
    where
        F: Fn() -> Box<dyn UpdatePerformer> + Send + Sync + 'static,
    {
        self.factories.insert(payload_type.to_string(), Arc::new(factory));
    }

    /// Whether `payload_type` is supported
    #[must_use]
    pub fn supports(&self, payload_type: &str) -> bool {
        self.factories.contains_key(payload_type)
    }

    /// Fresh performer for `payload_type`
    ///
    /// # Errors
    ///
    /// Returns `Install` for an unsupported type
    pub fn create(&self, payload_type: &str) -> Result<Box<dyn UpdatePerformer>> {
        self.factories
            .get(payload_type)
            .map(|factory| factory())
            .ok_or_else(|| Error::Install(format!("no installer for payload type '{payload_type}'")))
    }
}

/// Routes artifact payloads to freshly created performers
struct InstallHandler<'a> {
    installers: &'a Installers,
    performers: Vec<Box<dyn UpdatePerformer>>,
}

impl<'a> InstallHandler<'a> {
    const fn new(installers: &'a Installers) -> Self {
        Self {
            installers,
            performers: Vec::new(),
        }
    }

    fn current(&mut self) -> Result<&mut Box<dyn UpdatePerformer>> {
        self.performers
            .last_mut()
            .ok_or_else(|| Error::Install("payload data before payload header".to_string()))
    }
}

impl PayloadSink for InstallHandler<'_> {
    fn initialize(&mut self, artifact: &ArtifactHeader, payload: &PayloadHeader) -> Result<()> {
        let mut performer = self.installers.create(&payload.payload_type)?;
        performer.initialize(artifact, payload)?;
        self.performers.push(performer);
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        self.current()?.prepare_store()
    }

    fn store(&mut self, reader: &mut dyn Read, file: &DataFile) -> Result<()> {
        self.current()?.store_update(reader, file)
    }

    fn finalize(&mut self) -> Result<()> {
        self.current()?.finish_store()
    }
}
