//! MCUmgr agent configuration (YAML)
//!
//! ```yaml
//! server: https://rdfm.example.com
//! key_dir: /var/lib/rdfm-mcumgr/keys
//! retries: 3
//! update_interval: 10m
//! devices:
//!   - name: sensor
//!     id: "00:11:22:33:44:55"
//!     dev_type: nrf52840dk
//!     key: sensor.pem
//!     transport: { type: serial, device: /dev/ttyACM0 }
//! groups:
//!   - name: pair
//!     id: "00:11:22:33:44:66"
//!     type: pair-board
//!     key: pair.pem
//!     members:
//!       - { name: left, device: left-core, transport: { type: udp, address: 192.0.2.10 } }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use super::transport::TransportConfig;
use crate::{Error, Result};

/// Default interval between update checks
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Whole agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct McumgrConfig {
    /// Management server URL
    pub server: String,

    /// Directory holding per-device RSA keys
    pub key_dir: PathBuf,

    /// Failed update attempts before a device gives up (0 = never)
    #[serde(default)]
    pub retries: u32,

    /// Update check interval unless overridden per entry
    #[serde(default = "default_interval", deserialize_with = "duration")]
    pub update_interval: Duration,

    /// Standalone devices
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Device groups updated together
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

/// One standalone device
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Display name
    pub name: String,
    /// Identity reported to the server (MAC address form)
    pub id: String,
    /// Device type artifacts must be compatible with
    pub dev_type: String,
    /// Key file name under `key_dir`
    pub key: String,
    /// Firmware confirms new images itself
    #[serde(default)]
    pub self_confirm: bool,
    /// Overrides the global interval
    #[serde(default, deserialize_with = "optional_duration")]
    pub update_interval: Option<Duration>,
    /// How to reach the device
    pub transport: TransportConfig,
}

/// A group of devices sharing one artifact
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    /// Display name
    pub name: String,
    /// Identity reported to the server
    pub id: String,
    /// Group device type
    #[serde(rename = "type")]
    pub group_type: String,
    /// Key file name under `key_dir`
    pub key: String,
    /// Overrides the global interval
    #[serde(default, deserialize_with = "optional_duration")]
    pub update_interval: Option<Duration>,
    /// Members, each needing an image in every group artifact
    pub members: Vec<MemberConfig>,
}

/// One group member
#[derive(Debug, Clone, Deserialize)]
pub struct MemberConfig {
    /// Target name matched against the artifact
    pub name: String,
    /// Device label for logs
    #[serde(default)]
    pub device: String,
    /// Firmware confirms new images itself
    #[serde(default)]
    pub self_confirm: bool,
    /// How to reach the member
    pub transport: TransportConfig,
}

const fn default_interval() -> Duration {
    DEFAULT_UPDATE_INTERVAL
}

fn duration<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    let raw = String::deserialize(d)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn optional_duration<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<Duration>, D::Error> {
    Option::<String>::deserialize(d)?
        .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
        .transpose()
}

impl McumgrConfig {
    /// Parse from YAML text
    ///
    /// # Errors
    ///
    /// Returns `Yaml` for malformed input, `Config` for invalid values
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file
    ///
    /// # Errors
    ///
    /// Returns error if the file is unreadable or invalid
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Key path for an entry
    #[must_use]
    pub fn key_path(&self, key: &str) -> PathBuf {
        self.key_dir.join(key)
    }

    fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            return Err(Error::Config("server URL is required".to_string()));
        }
        if self.devices.is_empty() && self.groups.is_empty() {
            return Err(Error::Config("no devices or groups configured".to_string()));
        }
        for group in &self.groups {
            if group.members.is_empty() {
                return Err(Error::Config(format!("group {} has no members", group.name)));
            }
            for (i, member) in group.members.iter().enumerate() {
                if group.members[..i].iter().any(|m| m.name == member.name) {
                    return Err(Error::Config(format!(
                        "group {} lists member {} twice",
                        group.name, member.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server: http://localhost:5000
key_dir: /tmp/keys
retries: 2
update_interval: 30s
devices:
  - name: sensor
    id: "00:11:22:33:44:55"
    dev_type: nrf52840dk
    key: sensor.pem
    self_confirm: true
    update_interval: 1m
    transport:
      type: serial
      device: /dev/ttyACM0
      baud: 115200
groups:
  - name: pair
    id: "00:11:22:33:44:66"
    type: pair-board
    key: pair.pem
    members:
      - name: left
        device: left-core
        transport: { type: udp, address: 192.0.2.10 }
      - name: right
        transport: { type: ble, device_index: 0, peer_name: right-core }
"#;

    #[test]
    fn test_parse_sample() {
        let config = McumgrConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.retries, 2);
        assert_eq!(config.update_interval, Duration::from_secs(30));
        assert_eq!(config.devices[0].update_interval, Some(Duration::from_secs(60)));
        assert!(config.devices[0].self_confirm);
        assert_eq!(config.groups[0].group_type, "pair-board");
        assert_eq!(config.groups[0].members.len(), 2);
        assert_eq!(config.key_path("pair.pem"), PathBuf::from("/tmp/keys/pair.pem"));
    }

    #[test]
    fn test_default_interval() {
        let config = McumgrConfig::parse(
            "server: http://x\nkey_dir: /k\ndevices:\n  - {name: a, id: b, dev_type: c, key: d, transport: {type: udp, address: e}}\n",
        )
        .unwrap();
        assert_eq!(config.update_interval, DEFAULT_UPDATE_INTERVAL);
        assert_eq!(config.retries, 0);
    }

    #[test]
    fn test_rejects_empty_and_duplicates() {
        assert!(McumgrConfig::parse("server: http://x\nkey_dir: /k\n").is_err());
        let dup = "server: http://x\nkey_dir: /k\ngroups:\n  - name: g\n    id: i\n    type: t\n    key: k\n    members:\n      - {name: a, transport: {type: udp, address: h}}\n      - {name: a, transport: {type: udp, address: h}}\n";
        assert!(McumgrConfig::parse(dup).unwrap_err().to_string().contains("twice"));
        assert!(McumgrConfig::parse("server: x\nkey_dir: /k\nupdate_interval: soon\n").is_err());
    }
}
