//! JSON configuration file loading
//!
//! Both the main config (`/etc/rdfm/rdfm.conf`) and the overlay
//! (`/var/lib/rdfm/rdfm.conf`) share one schema. Every field is optional;
//! the overlay is applied on top of the main file, which is applied on top of
//! defaults.

use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

/// On-disk configuration schema (PascalCase keys)
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigFile {
    /// Management server base URL
    #[serde(rename = "ServerURL")]
    pub server_url: Option<String>,

    /// PEM file with an additional CA certificate for the server
    pub server_certificate: Option<String>,

    /// First rootfs partition
    pub rootfs_part_a: Option<String>,

    /// Second rootfs partition
    pub rootfs_part_b: Option<String>,

    /// File holding `device_type=<type>`
    pub device_type_file: Option<String>,

    /// Seconds between update checks
    pub update_poll_interval_seconds: Option<u64>,

    /// Seconds between authorization retries
    pub retry_poll_interval_seconds: Option<u64>,

    /// Tee downloads into the cache directory
    pub http_cache_enabled: Option<bool>,

    /// Download resume attempts
    pub reconnect_retry_count: Option<u32>,

    /// Seconds between download resume attempts
    pub reconnect_retry_time: Option<u64>,

    /// Interfaces considered for the MAC address
    pub mac_address_interface_regex: Option<String>,

    /// Allow reverse shells
    pub shell_enable: Option<bool>,

    /// Concurrent reverse shell limit
    pub shell_concurrent_max_count: Option<usize>,

    /// Shell binary
    pub shell_path: Option<String>,

    /// Allow server-dispatched actions
    pub action_enable: Option<bool>,

    /// Capacity of the action request and result queues
    pub action_queue_size: Option<u64>,

    /// Allow file transfer requests
    pub file_system_enable: Option<bool>,

    /// Root for file transfer paths
    pub file_system_base_dir: Option<String>,

    /// Script run before committing an update
    pub verification_script_path: Option<String>,
}

impl ConfigFile {
    /// Apply `overlay` on top of `self`, overlay values winning
    #[must_use]
    pub fn merge(self, overlay: Self) -> Self {
        Self {
            server_url: overlay.server_url.or(self.server_url),
            server_certificate: overlay.server_certificate.or(self.server_certificate),
            rootfs_part_a: overlay.rootfs_part_a.or(self.rootfs_part_a),
            rootfs_part_b: overlay.rootfs_part_b.or(self.rootfs_part_b),
            device_type_file: overlay.device_type_file.or(self.device_type_file),
            update_poll_interval_seconds: overlay
                .update_poll_interval_seconds
                .or(self.update_poll_interval_seconds),
            retry_poll_interval_seconds: overlay
                .retry_poll_interval_seconds
                .or(self.retry_poll_interval_seconds),
            http_cache_enabled: overlay.http_cache_enabled.or(self.http_cache_enabled),
            reconnect_retry_count: overlay.reconnect_retry_count.or(self.reconnect_retry_count),
            reconnect_retry_time: overlay.reconnect_retry_time.or(self.reconnect_retry_time),
            mac_address_interface_regex: overlay
                .mac_address_interface_regex
                .or(self.mac_address_interface_regex),
            shell_enable: overlay.shell_enable.or(self.shell_enable),
            shell_concurrent_max_count: overlay
                .shell_concurrent_max_count
                .or(self.shell_concurrent_max_count),
            shell_path: overlay.shell_path.or(self.shell_path),
            action_enable: overlay.action_enable.or(self.action_enable),
            action_queue_size: overlay.action_queue_size.or(self.action_queue_size),
            file_system_enable: overlay.file_system_enable.or(self.file_system_enable),
            file_system_base_dir: overlay.file_system_base_dir.or(self.file_system_base_dir),
            verification_script_path: overlay
                .verification_script_path
                .or(self.verification_script_path),
        }
    }
}

/// Load a config file
///
/// A missing file yields `None`; an unreadable or malformed file is an error.
///
/// # Errors
///
/// Returns `Config` if the file exists but cannot be read or parsed
pub fn load_config_file(path: &Path) -> Result<Option<ConfigFile>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not present");
            return Ok(None);
        }
        Err(e) => {
            return Err(Error::Config(format!("failed to read {}: {e}", path.display())));
        }
    };

    let config = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(Some(config))
}
