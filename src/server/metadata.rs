//! Device metadata reported on authorization and update checks

use std::path::Path;

use regex::Regex;
use serde_json::Value;

use crate::config::{Config, load_device_id, load_tags};
use crate::delta;
use crate::installer::Device;
use crate::security::Metadata;
use crate::{Error, Result};

/// Device type key
pub const KEY_DEVICE_TYPE: &str = "rdfm.hardware.devtype";

/// Installed software version key
pub const KEY_SOFTWARE_VERSION: &str = "rdfm.software.version";

/// Device identifier key
pub const KEY_MAC_ADDRESS: &str = "rdfm.hardware.macaddr";

/// Device tags key
pub const KEY_TAGS: &str = "rdfm.software.tags";

/// Where network interfaces are listed
pub const SYS_CLASS_NET: &str = "/sys/class/net";

/// The three keys every request carries
#[must_use]
pub fn base_metadata(device_type: &str, version: &str, mac_address: &str) -> Metadata {
    Metadata::from([
        (KEY_DEVICE_TYPE.to_string(), Value::from(device_type)),
        (KEY_SOFTWARE_VERSION.to_string(), Value::from(version)),
        (KEY_MAC_ADDRESS.to_string(), Value::from(mac_address)),
    ])
}

/// MAC address of the first interface, by name, whose name matches `pattern`
///
/// # Errors
///
/// Returns `Config` for a bad pattern or when no interface qualifies
pub fn find_mac_address(net_dir: &Path, pattern: &str) -> Result<String> {
    let regex = Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| Error::Config(format!("invalid MAC interface pattern: {e}")))?;

    let mut names: Vec<String> = std::fs::read_dir(net_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| regex.is_match(name))
        .collect();
    names.sort();

    for name in names {
        let Ok(address) = std::fs::read_to_string(net_dir.join(&name).join("address")) else {
            continue;
        };
        let address = address.trim();
        if address.is_empty() || address == "00:00:00:00:00:00" {
            continue;
        }
        tracing::info!(interface = %name, mac = %address, "using interface MAC address as device identifier");
        return Ok(address.to_string());
    }
    Err(Error::Config(format!(
        "no network interface matching {pattern:?} has a MAC address"
    )))
}

/// Stable device identifier: the `device_id` file, or a MAC address saved there
///
/// # Errors
///
/// Returns error if neither source yields an identifier
pub fn device_identifier(config: &Config, net_dir: &Path) -> Result<String> {
    let path = config.paths.device_id();
    if let Some(id) = load_device_id(&path)? {
        return Ok(id);
    }
    let mac = find_mac_address(net_dir, &config.mac_address_interface_regex)?;
    if let Err(e) = std::fs::write(&path, &mac) {
        tracing::warn!(path = %path.display(), error = %e, "cannot save device identifier");
    }
    Ok(mac)
}

/// Full metadata of the Linux device
///
/// # Errors
///
/// Returns error if the installed artifact or the tags cannot be read
pub fn collect(config: &Config, device: &Device, device_id: &str) -> Result<Metadata> {
    let version = device.artifact_name()?;
    let mut metadata = base_metadata(device.device_type(), &version, device_id);

    for engine in delta::supported() {
        metadata.insert(delta::support_key(engine.name()), Value::from("true"));
    }

    let tags = load_tags(&config.paths.tags())?;
    if !tags.is_empty() {
        metadata.insert(KEY_TAGS.to_string(), Value::from(tags));
    }
    Ok(metadata)
}
