//! One MCUboot device and the update steps shared by single and group flows

use std::sync::Arc;
use std::time::Duration;

use super::image::ImageEntry;
use super::session::{Session, Transport};
use crate::{Error, Result};

/// Waits around a device reboot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Sleep after reset before the first ping
    pub reboot_check_interval: Duration,
    /// Sleep between failed pings
    pub ping_interval: Duration,
    /// Give up waiting for the device after this long
    pub reboot_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            reboot_check_interval: Duration::from_secs(30),
            ping_interval: Duration::from_secs(1),
            reboot_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// A device behind a transport
#[derive(Clone)]
pub struct McuDevice {
    name: String,
    transport: Arc<dyn Transport>,
    self_confirm: bool,
}

impl std::fmt::Debug for McuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McuDevice")
            .field("name", &self.name)
            .field("transport", &self.transport.id())
            .field("self_confirm", &self.self_confirm)
            .finish()
    }
}

fn primary(images: &[ImageEntry]) -> Result<&ImageEntry> {
    images
        .iter()
        .find(|i| i.slot == 0)
        .ok_or_else(|| Error::Update("device reported no primary image".to_string()))
}

fn secondary(images: &[ImageEntry]) -> Option<&ImageEntry> {
    images.iter().find(|i| i.slot == 1)
}

impl McuDevice {
    /// Device `name` reachable through `transport`
    #[must_use]
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>, self_confirm: bool) -> Self {
        Self {
            name: name.into(),
            transport,
            self_confirm,
        }
    }

    /// Device name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the firmware confirms images itself
    #[must_use]
    pub const fn self_confirm(&self) -> bool {
        self.self_confirm
    }

    /// Open a session, run `op`, and always close the session
    async fn with_session<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s mut dyn Session) -> futures::future::BoxFuture<'s, Result<T>>,
    {
        let mut session = self.transport.acquire_session().await?;
        let result = op(session.as_mut()).await;
        if let Err(e) = session.close().await {
            tracing::warn!(device = %self.name, error = %e, "closing session failed");
        }
        result
    }

    /// Current image slots
    ///
    /// # Errors
    ///
    /// Returns the transport or command error
    pub async fn read_images(&self) -> Result<Vec<ImageEntry>> {
        self.with_session(|s| s.read_images()).await
    }

    /// The running image
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be read or has no primary
    pub async fn primary(&self) -> Result<ImageEntry> {
        let images = self.read_images().await?;
        primary(&images).cloned()
    }

    /// Make sure the running image is permanent
    ///
    /// # Errors
    ///
    /// Returns error if the device is unreachable or reports no image
    pub async fn init(&self) -> Result<ImageEntry> {
        let name = self.name.clone();
        self.with_session(move |s| {
            Box::pin(async move {
                let images = s.read_images().await?;
                let mut running = primary(&images)?.clone();
                if !running.confirmed {
                    tracing::info!(device = %name, version = %running.version, "confirming running image");
                    s.confirm_image(&running.hash).await?;
                    running.confirmed = true;
                }
                Ok(running)
            })
        })
        .await
    }

    /// Upload `image` to the secondary slot and return its hash
    ///
    /// # Errors
    ///
    /// Returns error if the upload fails or the device still runs the image
    pub async fn upload(&self, image: &[u8]) -> Result<Vec<u8>> {
        let image = image.to_vec();
        let name = self.name.clone();
        self.with_session(move |s| {
            Box::pin(async move {
                tracing::info!(device = %name, bytes = image.len(), "uploading image");
                s.write_image(&image).await?;
                let images = s.read_images().await?;
                let running = primary(&images)?;
                let uploaded = secondary(&images)
                    .ok_or_else(|| Error::Update("no image in secondary slot after upload".to_string()))?;
                if running.hash == uploaded.hash {
                    return Err(Error::Update(format!(
                        "{name}: uploaded image is already running ({})",
                        running.version
                    )));
                }
                Ok(uploaded.hash.clone())
            })
        })
        .await
    }

    /// Mark `hash` for a test boot
    ///
    /// # Errors
    ///
    /// Returns the command error
    pub async fn set_pending(&self, hash: &[u8]) -> Result<()> {
        let hash = hash.to_vec();
        self.with_session(move |s| Box::pin(async move { s.set_pending(&hash).await }))
            .await
    }

    /// Reboot the device
    ///
    /// # Errors
    ///
    /// Returns the command error
    pub async fn reset(&self) -> Result<()> {
        tracing::info!(device = %self.name, "resetting device");
        self.with_session(|s| s.reset()).await
    }

    /// Sleep, then ping until the device answers
    ///
    /// # Errors
    ///
    /// Returns `Update` if the device stays silent past the timeout
    pub async fn wait_for_reboot(&self, timing: &Timing) -> Result<()> {
        tokio::time::sleep(timing.reboot_check_interval).await;
        let deadline = tokio::time::Instant::now() + timing.reboot_timeout;
        loop {
            match self.with_session(|s| s.ping()).await {
                Ok(()) => return Ok(()),
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    return Err(Error::Update(format!("{} did not come back after reset: {e}", self.name)));
                }
                Err(e) => tracing::debug!(device = %self.name, error = %e, "device not up yet"),
            }
            tokio::time::sleep(timing.ping_interval).await;
        }
    }

    /// Check that the device booted the new image instead of `old_primary`
    ///
    /// # Errors
    ///
    /// Returns `Update` naming the device if it rejected the image
    pub async fn verify_update(&self, old_primary: &[u8], timing: &Timing) -> Result<ImageEntry> {
        let deadline = tokio::time::Instant::now() + timing.reboot_timeout;
        loop {
            let images = self.read_images().await?;
            let running = primary(&images)?.clone();
            if running.hash == old_primary {
                return Err(self.rejected("still running the previous image"));
            }

            if self.self_confirm {
                if running.confirmed {
                    return Ok(running);
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(self.rejected("new image was never confirmed"));
                }
                tokio::time::sleep(timing.ping_interval).await;
                continue;
            }

            return match secondary(&images) {
                Some(previous) if previous.hash == old_primary => Ok(running),
                _ => Err(self.rejected("previous image is not in the secondary slot")),
            };
        }
    }

    /// Make `hash` permanent
    ///
    /// # Errors
    ///
    /// Returns the command error
    pub async fn confirm(&self, hash: &[u8]) -> Result<()> {
        let hash = hash.to_vec();
        self.with_session(move |s| Box::pin(async move { s.confirm_image(&hash).await }))
            .await
    }

    /// Drop whatever the secondary slot holds
    ///
    /// # Errors
    ///
    /// Returns the command error
    pub async fn erase_secondary(&self) -> Result<()> {
        self.with_session(|s| s.erase_image()).await
    }

    /// Return to the `snapshot` image after a failed group update
    ///
    /// A device still running `snapshot` only loses a test boot it may have
    /// queued. A device that switched is sent back by confirming its
    /// secondary slot and resetting, but only when that slot holds
    /// `snapshot`: an unrelated image there is never made permanent.
    ///
    /// # Errors
    ///
    /// Returns `Update` if the secondary slot holds something else
    pub async fn rollback_to(&self, snapshot: &[u8]) -> Result<()> {
        let images = self.read_images().await?;
        if primary(&images)?.hash == snapshot {
            if secondary(&images).is_some_and(|s| s.pending) {
                tracing::warn!(device = %self.name, "dropping queued test boot");
                self.erase_secondary().await?;
            }
            return Ok(());
        }
        match secondary(&images) {
            Some(previous) if previous.hash == snapshot => {
                tracing::warn!(device = %self.name, version = %previous.version, "rolling back");
                self.confirm(&previous.hash).await?;
                self.reset().await
            }
            _ => Err(Error::Update(format!("{}: Unknown image in secondary slot", self.name))),
        }
    }

    fn rejected(&self, reason: &str) -> Error {
        Error::Update(format!("{} rejected the update: {reason}", self.name))
    }
}
