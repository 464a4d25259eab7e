//! Small device-local files: key/value info files, device type, device id,
//! tags and the actions list

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::actions::CommandAction;
use crate::{Error, Result};

/// Parse `key=value` lines, ignoring blanks and `#` comments
#[must_use]
pub fn parse_key_value(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Read a `key=value` file
///
/// # Errors
///
/// Returns error if the file cannot be read
pub fn load_key_value_file(path: &Path) -> Result<BTreeMap<String, String>> {
    Ok(parse_key_value(&std::fs::read_to_string(path)?))
}

/// Device type from a `device_type=<type>` file
///
/// # Errors
///
/// Returns `Config` if the file is missing or has no `device_type` entry
pub fn load_device_type(path: &Path) -> Result<String> {
    let values = load_key_value_file(path)
        .map_err(|e| Error::Config(format!("failed to read device type file {}: {e}", path.display())))?;
    values
        .get("device_type")
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| Error::Config(format!("{} has no device_type entry", path.display())))
}

/// Device identifier override: the first line of the `device_id` file
///
/// Returns `None` when the file is absent.
///
/// # Errors
///
/// Returns `Config` if the file exists but is empty
pub fn load_device_id(path: &Path) -> Result<Option<String>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut lines = content.lines();
    let id = lines.next().unwrap_or_default().trim().to_string();
    if lines.next().is_some() {
        tracing::warn!(path = %path.display(), "device_id file has multiple lines; remaining lines will be ignored");
    }
    if id.is_empty() {
        return Err(Error::Config("device ID invalid or corrupted".to_string()));
    }
    Ok(Some(id))
}

/// Refuse config files writable by group or others
///
/// # Errors
///
/// Returns `Config` when the mode is too permissive
pub fn check_permissions(path: &Path) -> Result<()> {
    let mode = std::fs::metadata(path)?.permissions().mode();
    if mode & 0o022 != 0 {
        return Err(Error::Config(format!(
            "invalid permissions {:o} for config file {} (must not be group/world writable)",
            mode & 0o777,
            path.display()
        )));
    }
    Ok(())
}

/// Device tags, one per line; an absent file means no tags
///
/// # Errors
///
/// Returns `Config` on bad permissions, or error if reading fails
pub fn load_tags(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    check_permissions(path)?;

    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Command actions from a JSON array; an absent file means no actions
///
/// # Errors
///
/// Returns `Config` on bad permissions, malformed JSON or a timeout too
/// large to represent
pub fn load_actions(path: &Path) -> Result<Vec<CommandAction>> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "no configured actions were found");
        return Ok(Vec::new());
    }
    check_permissions(path)?;

    let content = std::fs::read_to_string(path)?;
    let actions: Vec<CommandAction> = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse actions from {}: {e}", path.display())))?;
    for action in &actions {
        action.timeout()?;
    }
    Ok(actions)
}
