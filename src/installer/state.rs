//! Persistent install bookkeeping
//!
//! - `provides.json`: the installed artifact name and its provides
//! - `standalone-state.json`: an installed but not yet committed artifact

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artifact::{KEY_ARTIFACT_NAME, Provides, clears_key};
use crate::config::load_key_value_file;
use crate::{Error, Result};

/// Current layout of [`StandaloneState`]
pub const STANDALONE_STATE_VERSION: u32 = 1;

/// Name used when nothing is known about the running image
pub const UNKNOWN_ARTIFACT: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ProvidesRecord {
    artifact_name: String,
    #[serde(default)]
    provides: Provides,
}

/// Installed-artifact database
#[derive(Debug, Clone)]
pub struct ProvidesDb {
    path: PathBuf,
    artifact_info: PathBuf,
    provides_info: PathBuf,
}

impl ProvidesDb {
    /// Database at `<data_dir>/provides.json`, seeded from the given info files
    #[must_use]
    pub fn new(data_dir: &Path, artifact_info: PathBuf, provides_info: PathBuf) -> Self {
        Self {
            path: data_dir.join("provides.json"),
            artifact_info,
            provides_info,
        }
    }

    /// Installed artifact name
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be read or seeded
    pub fn artifact_name(&self) -> Result<String> {
        Ok(self.load()?.artifact_name)
    }

    /// Installed provides, including `artifact_name`
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be read or seeded
    pub fn provides(&self) -> Result<Provides> {
        let record = self.load()?;
        let mut provides = record.provides;
        provides.insert(KEY_ARTIFACT_NAME.to_string(), record.artifact_name);
        Ok(provides)
    }

    /// Record a committed artifact
    ///
    /// With an empty `clears` list every previous provide is dropped;
    /// otherwise only keys matching one of the globs are.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be written
    pub fn commit(&self, artifact_name: &str, provides: &Provides, clears: &[String]) -> Result<()> {
        let mut record = self.load()?;

        if clears.is_empty() {
            record.provides.clear();
        } else {
            record
                .provides
                .retain(|key, _| !clears.iter().any(|pattern| clears_key(pattern, key)));
        }

        for (key, value) in provides {
            if key != KEY_ARTIFACT_NAME {
                record.provides.insert(key.clone(), value.clone());
            }
        }
        record.artifact_name = artifact_name.to_string();

        tracing::info!(artifact = artifact_name, keys = record.provides.len(), "committed artifact provides");
        self.store(&record)
    }

    fn load(&self) -> Result<ProvidesRecord> {
        match std::fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                Error::Install(format!("corrupt provides database {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let record = self.seed();
                self.store(&record)?;
                Ok(record)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn seed(&self) -> ProvidesRecord {
        tracing::debug!("reinitializing provides database");

        let artifact_name = load_key_value_file(&self.artifact_info)
            .ok()
            .and_then(|mut values| values.remove(KEY_ARTIFACT_NAME))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| UNKNOWN_ARTIFACT.to_string());

        let mut provides = load_key_value_file(&self.provides_info).unwrap_or_default();
        if provides.remove(KEY_ARTIFACT_NAME).is_some() {
            tracing::warn!("provides_info contained artifact_name, ignoring it");
        }

        ProvidesRecord {
            artifact_name,
            provides,
        }
    }

    fn store(&self, record: &ProvidesRecord) -> Result<()> {
        write_json_atomic(&self.path, record)
    }
}

/// An installed artifact awaiting commit or rollback
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandaloneState {
    /// Layout version
    pub version: u32,

    /// Name of the installed artifact
    pub artifact_name: String,

    /// Merged artifact provides
    pub provides: Provides,

    /// Clears-provides globs of the artifact and its installers
    pub clears_provides: Vec<String>,

    /// Payload type per installer, in payload order
    pub payload_types: Vec<String>,

    /// Installer-private state, parallel to `payload_types`
    pub payload_states: Vec<serde_json::Value>,
}

impl StandaloneState {
    fn path(data_dir: &Path) -> PathBuf {
        data_dir.join("standalone-state.json")
    }

    /// Persist the state
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save(&self, data_dir: &Path) -> Result<()> {
        write_json_atomic(&Self::path(data_dir), self)
    }

    /// Load the pending install
    ///
    /// # Errors
    ///
    /// Returns `Install` when nothing is pending or the stored layout is
    /// incompatible
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = Self::path(data_dir);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Install("no update in progress".to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let state: Self = serde_json::from_slice(&raw)?;
        if state.version != STANDALONE_STATE_VERSION {
            return Err(Error::Install(format!(
                "incompatible install state version {} stored",
                state.version
            )));
        }
        Ok(state)
    }

    /// Whether an install is pending
    #[must_use]
    pub fn exists(data_dir: &Path) -> bool {
        Self::path(data_dir).exists()
    }

    /// Forget the pending install
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be removed
    pub fn remove(data_dir: &Path) -> Result<()> {
        match std::fs::remove_file(Self::path(data_dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
