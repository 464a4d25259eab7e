//! Bootloader environment access

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};

use crate::{Error, Result};

/// Partition number the bootloader boots
pub const BOOT_PART: &str = "mender_boot_part";
/// Same as [`BOOT_PART`], in hex
pub const BOOT_PART_HEX: &str = "mender_boot_part_hex";
/// `1` while a freshly installed slot is on trial
pub const UPGRADE_AVAILABLE: &str = "upgrade_available";
/// Boot attempts of the trial slot
pub const BOOT_COUNT: &str = "bootcount";

/// Read/write access to bootloader variables
pub trait BootEnvironment: Send + Sync {
    /// Read the named variables; unset ones are omitted
    ///
    /// # Errors
    ///
    /// Returns error if the environment cannot be read
    fn read(&self, names: &[&str]) -> Result<BTreeMap<String, String>>;

    /// Set variables atomically
    ///
    /// # Errors
    ///
    /// Returns error if the environment cannot be written
    fn write(&self, vars: &BTreeMap<String, String>) -> Result<()>;
}

/// U-Boot environment through `fw_printenv` / `fw_setenv`
#[derive(Debug, Clone)]
pub struct UBootEnv {
    printenv: PathBuf,
    setenv: PathBuf,
}

impl UBootEnv {
    /// Locate the tools on `PATH`
    ///
    /// # Errors
    ///
    /// Returns `Install` if either tool is missing
    pub fn locate() -> Result<Self> {
        let find = |name: &str| {
            which::which(name).map_err(|e| Error::Install(format!("{name} not found: {e}")))
        };
        Ok(Self {
            printenv: find("fw_printenv")?,
            setenv: find("fw_setenv")?,
        })
    }
}

impl BootEnvironment for UBootEnv {
    fn read(&self, names: &[&str]) -> Result<BTreeMap<String, String>> {
        let output = Command::new(&self.printenv).args(names).output()?;

        // fw_printenv exits non-zero when a variable is unset; parse what it printed
        let stdout = String::from_utf8_lossy(&output.stdout);
        let vars: BTreeMap<String, String> = stdout
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        if !output.status.success() && vars.is_empty() && !names.is_empty() {
            tracing::debug!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "fw_printenv returned no variables"
            );
        }
        Ok(vars)
    }

    fn write(&self, vars: &BTreeMap<String, String>) -> Result<()> {
        let mut child = Command::new(&self.setenv)
            .args(["-s", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            for (key, value) in vars {
                writeln!(stdin, "{key} {value}")?;
            }
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::Install(format!(
                "fw_setenv failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::debug!(?vars, "boot environment updated");
        Ok(())
    }
}

/// In-memory environment for tests and boards without a bootloader env
#[derive(Debug, Default)]
pub struct MemoryBootEnv {
    vars: Mutex<BTreeMap<String, String>>,
}

impl MemoryBootEnv {
    /// Start with the given variables
    #[must_use]
    pub fn with_vars(vars: &[(&str, &str)]) -> Self {
        Self {
            vars: Mutex::new(
                vars.iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            ),
        }
    }

    /// Current value of `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl BootEnvironment for MemoryBootEnv {
    fn read(&self, names: &[&str]) -> Result<BTreeMap<String, String>> {
        let vars = self.vars.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(names
            .iter()
            .filter_map(|name| vars.get(*name).map(|v| ((*name).to_string(), v.clone())))
            .collect())
    }

    fn write(&self, vars: &BTreeMap<String, String>) -> Result<()> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}
