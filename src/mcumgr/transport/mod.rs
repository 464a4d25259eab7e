//! MCUmgr transports
//!
//! Each transport owns a per-device lock; [`Transport::acquire_session`]
//! holds it for the lifetime of the returned session.

mod ble;
mod serial;
mod udp;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use ble::{BleTransport, controller_lock};
pub use serial::{SerialTransport, decode_frame, encode_frames};
pub use udp::UdpTransport;

use super::session::Transport;
use crate::Result;

/// How to reach one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Serial console (shell transport framing)
    Serial {
        /// TTY path, e.g. `/dev/ttyACM0`
        device: String,
        /// Line speed
        #[serde(default = "default_baud")]
        baud: u32,
        /// Largest SMP packet per request
        #[serde(default = "default_serial_mtu")]
        mtu: usize,
    },
    /// Bluetooth LE SMP service
    Ble {
        /// Host controller index (`hciN`)
        #[serde(default)]
        device_index: u32,
        /// Advertised peer name
        peer_name: String,
    },
    /// SMP over UDP
    Udp {
        /// `host[:port]`, port defaults to 1337
        address: String,
    },
}

const fn default_baud() -> u32 {
    115_200
}

const fn default_serial_mtu() -> usize {
    256
}

/// Build the transport a config entry describes
///
/// # Errors
///
/// Returns `Transport` if the config names a transport this build lacks
pub fn open(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    Ok(match config {
        TransportConfig::Serial { device, baud, mtu } => {
            Arc::new(SerialTransport::new(device.clone(), *baud, *mtu))
        }
        TransportConfig::Ble {
            device_index,
            peer_name,
        } => Arc::new(BleTransport::new(*device_index, peer_name.clone())?),
        TransportConfig::Udp { address } => Arc::new(UdpTransport::new(address)?),
    })
}
