//! Update of one standalone device

use super::artifact::ZephyrArtifact;
use super::device::{McuDevice, Timing};
use super::image::parse_image_header;
use crate::{Error, Result};

/// Check that an image carries the version its artifact declares
///
/// # Errors
///
/// Returns `Artifact` for a bad image, `Update` for a version mismatch
pub fn check_version(image: &[u8], declared: &str) -> Result<()> {
    let actual = parse_image_header(image)?;
    if actual.matches(declared) {
        Ok(())
    } else {
        Err(Error::Update(format!(
            "artifact version {declared} does not match image version {actual}"
        )))
    }
}

/// Install `artifact` on `device` and confirm it once it boots
///
/// A device that rejects the image has already reverted by itself;
/// nothing is rolled back here.
///
/// # Errors
///
/// Returns the first failing step; a rejection names the device
pub async fn update_device(device: &McuDevice, artifact: &ZephyrArtifact, timing: &Timing) -> Result<()> {
    check_version(&artifact.image, &artifact.version)?;

    let old = device.primary().await?;
    tracing::info!(
        device = device.name(),
        from = %old.version,
        to = %artifact.version,
        "starting update"
    );

    let new_hash = device.upload(&artifact.image).await?;
    device.set_pending(&new_hash).await?;
    device.reset().await?;
    device.wait_for_reboot(timing).await?;

    let running = device.verify_update(&old.hash, timing).await?;
    if !device.self_confirm() {
        device.confirm(&running.hash).await?;
    }
    tracing::info!(device = device.name(), version = %running.version, "update confirmed");
    Ok(())
}
