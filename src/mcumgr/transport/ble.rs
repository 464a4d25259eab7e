//! SMP over Bluetooth LE
//!
//! A host controller serves one connection attempt at a time, so every
//! session on `hciN` also holds that controller's lock from
//! [`controller_lock`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::mcumgr::session::{Session, Transport};
use crate::{Error, Result};

/// Pause after a reset before the peripheral is reachable again
pub const RESET_SETTLE: Duration = Duration::from_secs(1);

/// Pause after a disconnect before the controller is reused
pub const CLOSE_SETTLE: Duration = Duration::from_secs(5);

static CONTROLLERS: OnceLock<std::sync::Mutex<HashMap<u32, Arc<Mutex<()>>>>> = OnceLock::new();

/// Shared lock for host controller `index`
#[must_use]
pub fn controller_lock(index: u32) -> Arc<Mutex<()>> {
    let registry = CONTROLLERS.get_or_init(Default::default);
    let mut map = registry.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(map.entry(index).or_default())
}

/// Device advertising the SMP service
#[derive(Debug)]
pub struct BleTransport {
    id: String,
    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    device_index: u32,
    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    peer_name: String,
    #[cfg_attr(not(feature = "ble"), allow(dead_code))]
    lock: Arc<Mutex<()>>,
}

impl BleTransport {
    /// Transport for `peer_name` on controller `hci<device_index>`
    ///
    /// # Errors
    ///
    /// Returns `Transport` if this build has no BLE support
    pub fn new(device_index: u32, peer_name: String) -> Result<Self> {
        if cfg!(not(feature = "ble")) {
            return Err(Error::Transport(format!(
                "cannot reach {peer_name}: built without the `ble` feature"
            )));
        }
        Ok(Self {
            id: format!("hci{device_index}/{peer_name}"),
            device_index,
            peer_name,
            lock: Arc::new(Mutex::new(())),
        })
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn acquire_session(&self) -> Result<Box<dyn Session>> {
        #[cfg(feature = "ble")]
        {
            bluez::open(self).await
        }
        #[cfg(not(feature = "ble"))]
        {
            Err(Error::Transport(format!("{}: BLE support not built", self.id)))
        }
    }
}

#[cfg(feature = "ble")]
mod bluez {
    use std::time::Duration;

    use async_trait::async_trait;
    use bluer::gatt::remote::Characteristic;
    use bluer::{AdapterEvent, Device, Uuid};
    use futures::{Stream, StreamExt};
    use tokio::sync::OwnedMutexGuard;

    use super::{BleTransport, CLOSE_SETTLE, RESET_SETTLE, controller_lock};
    use crate::mcumgr::session::{Link, Session, SmpSession};
    use crate::mcumgr::smp::missing_bytes;
    use crate::{Error, Result};

    const SMP_SERVICE: Uuid = Uuid::from_u128(0x8D53_DC1D_1DB7_4CD3_868B_8A52_7460_AA84);
    const SMP_CHARACTERISTIC: Uuid = Uuid::from_u128(0xDA2E_7828_FBCE_4E01_AE9E_2611_7499_7C48);
    const SCAN_TIMEOUT: Duration = Duration::from_secs(30);
    const BLE_MTU: usize = 240;

    type Notifications = std::pin::Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

    fn ble_err(e: bluer::Error) -> Error {
        Error::Transport(format!("bluetooth: {e}"))
    }

    pub(super) async fn open(transport: &BleTransport) -> Result<Box<dyn Session>> {
        let device_guard = std::sync::Arc::clone(&transport.lock).lock_owned().await;
        let controller_guard = controller_lock(transport.device_index).lock_owned().await;

        let session = bluer::Session::new().await.map_err(ble_err)?;
        let adapter = session
            .adapter(&format!("hci{}", transport.device_index))
            .map_err(ble_err)?;
        adapter.set_powered(true).await.map_err(ble_err)?;

        let device = tokio::time::timeout(SCAN_TIMEOUT, async {
            let mut events = adapter.discover_devices().await.map_err(ble_err)?;
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(addr) = event {
                    let device = adapter.device(addr).map_err(ble_err)?;
                    if device.name().await.ok().flatten().as_deref() == Some(transport.peer_name.as_str()) {
                        return Ok(device);
                    }
                }
            }
            Err(Error::Transport("discovery ended".to_string()))
        })
        .await
        .map_err(|_| Error::Transport(format!("peer {} not found", transport.peer_name)))??;

        if !device.is_connected().await.map_err(ble_err)? {
            device.connect().await.map_err(ble_err)?;
        }
        let characteristic = find_characteristic(&device).await?;
        let notifications: Notifications = Box::pin(characteristic.notify().await.map_err(ble_err)?);
        tracing::debug!(peer = %transport.peer_name, "BLE SMP characteristic ready");

        Ok(Box::new(SmpSession::new(BleLink {
            device,
            characteristic,
            notifications,
            _device_guard: device_guard,
            _controller_guard: controller_guard,
        })))
    }

    async fn find_characteristic(device: &Device) -> Result<Characteristic> {
        for service in device.services().await.map_err(ble_err)? {
            if service.uuid().await.map_err(ble_err)? != SMP_SERVICE {
                continue;
            }
            for characteristic in service.characteristics().await.map_err(ble_err)? {
                if characteristic.uuid().await.map_err(ble_err)? == SMP_CHARACTERISTIC {
                    return Ok(characteristic);
                }
            }
        }
        Err(Error::Transport("peer has no SMP characteristic".to_string()))
    }

    struct BleLink {
        device: Device,
        characteristic: Characteristic,
        notifications: Notifications,
        _device_guard: OwnedMutexGuard<()>,
        _controller_guard: OwnedMutexGuard<()>,
    }

    #[async_trait]
    impl Link for BleLink {
        fn mtu(&self) -> usize {
            BLE_MTU
        }

        async fn transceive(&mut self, packet: &[u8], seq: u8, timeout: Duration) -> Result<Vec<u8>> {
            self.characteristic.write(packet).await.map_err(ble_err)?;

            let deadline = tokio::time::Instant::now() + timeout;
            let mut response = Vec::new();
            loop {
                let chunk = tokio::time::timeout_at(deadline, self.notifications.next())
                    .await
                    .map_err(|_| Error::Transport("timed out waiting for BLE response".to_string()))?
                    .ok_or_else(|| Error::Transport("notification stream ended".to_string()))?;
                response.extend_from_slice(&chunk);
                if missing_bytes(&response) == Some(0) {
                    if response[6] == seq {
                        return Ok(response);
                    }
                    response.clear();
                }
            }
        }

        fn settle_after_reset(&self) -> Duration {
            RESET_SETTLE
        }

        async fn close(&mut self) -> Result<()> {
            self.device.disconnect().await.map_err(ble_err)?;
            tokio::time::sleep(CLOSE_SETTLE).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_lock_is_shared() {
        let a = controller_lock(7);
        let b = controller_lock(7);
        let c = controller_lock(8);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_controller_lock_serializes() {
        let lock = controller_lock(42);
        let guard = Arc::clone(&lock).lock_owned().await;
        assert!(controller_lock(42).try_lock().is_err());
        drop(guard);
        assert!(controller_lock(42).try_lock().is_ok());
    }
}
