//! Agent configuration
//!
//! Resolution order: overlay config > main config > defaults. Paths can be
//! redirected with `RDFM_CONFIG`, `RDFM_OVERLAY_CONFIG` and `RDFM_DATA_DIR`.

pub mod file;
pub mod local;

use std::path::{Path, PathBuf};
use std::time::Duration;

pub use local::{
    check_permissions, load_actions, load_device_id, load_device_type, load_key_value_file,
    load_tags, parse_key_value,
};

use crate::Result;

/// Default main config path
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rdfm/rdfm.conf";

/// Default overlay config path
pub const DEFAULT_OVERLAY_PATH: &str = "/var/lib/rdfm/rdfm.conf";

/// Default persistent data directory
pub const DEFAULT_DATA_DIR: &str = "/var/lib/rdfm";

/// Default MAC interface pattern: `ethN`, PCI slot/path names and onboard names
pub const DEFAULT_MAC_INTERFACE_REGEX: &str = r"eth\d+|en(([Pp]\d+)*(s\d+)+(f\d+)*(n\d+|d\d+)*|([o]\d+))";

/// Where the agent reads and keeps its files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Main config file; its directory holds the other static files
    pub main_config: PathBuf,

    /// Overlay config file
    pub overlay_config: PathBuf,

    /// Persistent state directory
    pub data_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            main_config: PathBuf::from(DEFAULT_CONFIG_PATH),
            overlay_config: PathBuf::from(DEFAULT_OVERLAY_PATH),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

impl Paths {
    /// Defaults with environment overrides applied
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            main_config: std::env::var_os("RDFM_CONFIG").map_or(defaults.main_config, PathBuf::from),
            overlay_config: std::env::var_os("RDFM_OVERLAY_CONFIG")
                .map_or(defaults.overlay_config, PathBuf::from),
            data_dir: std::env::var_os("RDFM_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
        }
    }

    /// Everything rooted under one directory (used by tests and dev setups)
    #[must_use]
    pub fn rooted(root: &Path) -> Self {
        Self {
            main_config: root.join("etc").join("rdfm.conf"),
            overlay_config: root.join("data").join("rdfm.conf"),
            data_dir: root.join("data"),
        }
    }

    /// Directory of the main config file
    #[must_use]
    pub fn config_dir(&self) -> &Path {
        self.main_config.parent().unwrap_or_else(|| Path::new("/"))
    }

    /// `artifact_info` seed file
    #[must_use]
    pub fn artifact_info(&self) -> PathBuf {
        self.config_dir().join("artifact_info")
    }

    /// `provides_info` seed file
    #[must_use]
    pub fn provides_info(&self) -> PathBuf {
        self.config_dir().join("provides_info")
    }

    /// Actions definition file
    #[must_use]
    pub fn actions(&self) -> PathBuf {
        self.config_dir().join("actions.conf")
    }

    /// Tags file
    #[must_use]
    pub fn tags(&self) -> PathBuf {
        self.config_dir().join("tags.conf")
    }

    /// Device RSA key
    #[must_use]
    pub fn rsa_key(&self) -> PathBuf {
        self.data_dir.join("rsa.pem")
    }

    /// Download cache directory
    #[must_use]
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Device identifier override
    #[must_use]
    pub fn device_id(&self) -> PathBuf {
        self.data_dir.join("device_id")
    }

    /// Default device type file
    #[must_use]
    pub fn device_type(&self) -> PathBuf {
        self.data_dir.join("device_type")
    }
}

/// Resolved agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// File locations
    pub paths: Paths,

    /// Management server base URL (empty when unset)
    pub server_url: String,

    /// Additional CA certificate for the server
    pub server_certificate: Option<PathBuf>,

    /// Rootfs partitions for A/B updates
    pub rootfs_parts: Option<(PathBuf, PathBuf)>,

    /// File holding the device type
    pub device_type_file: PathBuf,

    /// Interval between update checks
    pub update_poll_interval: Duration,

    /// Interval between authorization retries
    pub retry_poll_interval: Duration,

    /// Cache downloads so they can resume after a restart
    pub http_cache_enabled: bool,

    /// Download resume attempts
    pub reconnect_retry_count: u32,

    /// Delay between download resume attempts
    pub reconnect_retry_time: Duration,

    /// Interfaces considered for the MAC address
    pub mac_address_interface_regex: String,

    /// Reverse shell support
    pub shell_enable: bool,

    /// Concurrent shell limit
    pub shell_concurrent_max_count: usize,

    /// Preferred shell binary
    pub shell_path: Option<String>,

    /// Action support
    pub action_enable: bool,

    /// Action queue capacity
    pub action_queue_size: u64,

    /// File transfer support
    pub file_system_enable: bool,

    /// Root for file transfer paths
    pub file_system_base_dir: PathBuf,

    /// Script that must succeed before an update is committed
    pub verification_script_path: Option<PathBuf>,
}

impl Config {
    /// Load using [`Paths::from_env`]
    ///
    /// # Errors
    ///
    /// Returns error if a config file is unreadable or malformed
    pub fn load() -> Result<Self> {
        Self::load_from(Paths::from_env())
    }

    /// Load from explicit paths
    ///
    /// # Errors
    ///
    /// Returns error if a config file is unreadable or malformed
    pub fn load_from(paths: Paths) -> Result<Self> {
        let main = file::load_config_file(&paths.main_config)?.unwrap_or_else(|| {
            tracing::warn!(path = %paths.main_config.display(), "main config missing, using defaults");
            file::ConfigFile::default()
        });
        let overlay = file::load_config_file(&paths.overlay_config)?.unwrap_or_default();
        Ok(Self::from_file(paths, main.merge(overlay)))
    }

    /// Apply a parsed file over the defaults
    #[must_use]
    pub fn from_file(paths: Paths, fc: file::ConfigFile) -> Self {
        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());

        let rootfs_parts = match (non_empty(fc.rootfs_part_a), non_empty(fc.rootfs_part_b)) {
            (Some(a), Some(b)) => Some((PathBuf::from(a), PathBuf::from(b))),
            _ => None,
        };

        Self {
            server_url: fc.server_url.unwrap_or_default().trim_end_matches('/').to_string(),
            server_certificate: non_empty(fc.server_certificate).map(PathBuf::from),
            rootfs_parts,
            device_type_file: non_empty(fc.device_type_file)
                .map_or_else(|| paths.device_type(), PathBuf::from),
            update_poll_interval: Duration::from_secs(fc.update_poll_interval_seconds.unwrap_or(15 * 60)),
            retry_poll_interval: Duration::from_secs(fc.retry_poll_interval_seconds.unwrap_or(60)),
            http_cache_enabled: fc.http_cache_enabled.unwrap_or(true),
            reconnect_retry_count: fc.reconnect_retry_count.unwrap_or(3),
            reconnect_retry_time: Duration::from_secs(fc.reconnect_retry_time.unwrap_or(60)),
            mac_address_interface_regex: non_empty(fc.mac_address_interface_regex)
                .unwrap_or_else(|| DEFAULT_MAC_INTERFACE_REGEX.to_string()),
            shell_enable: fc.shell_enable.unwrap_or(true),
            shell_concurrent_max_count: fc.shell_concurrent_max_count.unwrap_or(5),
            shell_path: non_empty(fc.shell_path),
            action_enable: fc.action_enable.unwrap_or(true),
            action_queue_size: fc.action_queue_size.unwrap_or(32),
            file_system_enable: fc.file_system_enable.unwrap_or(true),
            file_system_base_dir: PathBuf::from(
                non_empty(fc.file_system_base_dir).unwrap_or_else(|| "/".to_string()),
            ),
            verification_script_path: non_empty(fc.verification_script_path).map(PathBuf::from),
            paths,
        }
    }
}
