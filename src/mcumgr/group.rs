//! Update of a device group
//!
//! Members move through each phase together: nobody resets before every
//! upload landed, nobody is confirmed before every member booted the new
//! image. Once any member may have a test boot queued, every failure sends
//! the whole group back to the images it ran before.

use std::future::Future;

use tokio::sync::mpsc;
use tracing::Instrument;

use super::artifact::GroupArtifact;
use super::device::{McuDevice, Timing};
use super::single::check_version;
use crate::{Error, Result};

/// Collect `n` results, returning the last error seen
///
/// # Errors
///
/// Returns the last failing result, or `Update` if a sender vanished
/// before reporting
pub async fn wait_all(mut results: mpsc::Receiver<Result<()>>, n: usize) -> Result<()> {
    let mut last = Ok(());
    for _ in 0..n {
        match results.recv().await {
            Some(Ok(())) => {}
            Some(Err(e)) => last = Err(e),
            None => return Err(Error::Update("group member stopped without reporting".to_string())),
        }
    }
    last
}

/// Run `step` on every member in its own task and wait for all of them
async fn phase<F, Fut>(members: &[McuDevice], label: &'static str, step: F) -> Result<()>
where
    F: Fn(usize, McuDevice) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(members.len().max(1));
    for (i, member) in members.iter().enumerate() {
        let tx = tx.clone();
        let span = tracing::info_span!("member", member = member.name(), phase = label);
        let task = step(i, member.clone());
        tokio::spawn(
            async move {
                let result = task.await;
                if let Err(e) = &result {
                    tracing::error!(error = %e, "phase failed");
                }
                let _ = tx.send(result).await;
            }
            .instrument(span),
        );
    }
    drop(tx);
    wait_all(rx, members.len()).await
}

/// Version every member currently runs
///
/// # Errors
///
/// Returns `Update` if members disagree
pub async fn group_version(members: &[McuDevice]) -> Result<String> {
    let mut version: Option<String> = None;
    for member in members {
        let running = member.init().await?;
        match &version {
            None => version = Some(running.version),
            Some(v) if *v == running.version => {}
            Some(v) => {
                return Err(Error::Update(format!(
                    "member {} runs {} while the group runs {v}",
                    member.name(),
                    running.version
                )));
            }
        }
    }
    version.ok_or_else(|| Error::Update("group has no members".to_string()))
}

/// Install `artifact` on every member, all or nothing
///
/// # Errors
///
/// Returns a validation error before anything is written, or the error of
/// the member that failed or rejected the update
pub async fn update_group(members: &[McuDevice], artifact: &GroupArtifact, timing: &Timing) -> Result<()> {
    let mut images = Vec::with_capacity(members.len());
    for member in members {
        let image = artifact.image_for(member.name())?;
        check_version(image, &artifact.version)
            .map_err(|e| Error::Update(format!("member {}: {e}", member.name())))?;
        images.push(image.to_vec());
    }

    let mut snapshot = Vec::with_capacity(members.len());
    for member in members {
        snapshot.push(member.primary().await?.hash);
    }
    tracing::info!(artifact = %artifact.name, version = %artifact.version, members = members.len(), "starting group update");

    let (hash_tx, mut hash_rx) = mpsc::channel(members.len().max(1));
    phase(members, "upload", |i, member| {
        let image = images[i].clone();
        let hash_tx = hash_tx.clone();
        async move {
            let hash = member.upload(&image).await?;
            let _ = hash_tx.send((i, hash)).await;
            Ok(())
        }
    })
    .await?;
    drop(hash_tx);
    let mut uploaded = vec![Vec::new(); members.len()];
    while let Some((i, hash)) = hash_rx.recv().await {
        uploaded[i] = hash;
    }

    if let Err((error, rebooting)) = switch_over(members, &uploaded, &snapshot, timing).await {
        tracing::error!(error = %error, "group update failed, rolling back members");
        roll_back(members, &snapshot, timing, rebooting).await;
        return Err(error);
    }

    tracing::info!(artifact = %artifact.name, "group update confirmed");
    Ok(())
}

/// Queue the test boots, reset, verify and confirm every member
///
/// On failure also reports whether members may still be rebooting.
async fn switch_over(
    members: &[McuDevice],
    uploaded: &[Vec<u8>],
    snapshot: &[Vec<u8>],
    timing: &Timing,
) -> std::result::Result<(), (Error, bool)> {
    phase(members, "set-pending", |i, member| {
        let hash = uploaded[i].clone();
        async move { member.set_pending(&hash).await }
    })
    .await
    .map_err(|e| (e, false))?;

    phase(members, "reset", |_, member| async move { member.reset().await })
        .await
        .map_err(|e| (e, true))?;

    phase(members, "verify", |i, member| {
        let old = snapshot[i].clone();
        let timing = *timing;
        async move {
            member.wait_for_reboot(&timing).await?;
            member.verify_update(&old, &timing).await.map(drop)
        }
    })
    .await
    .map_err(|e| (e, false))?;

    phase(members, "confirm", |_, member| async move {
        let running = member.primary().await?;
        if running.confirmed {
            Ok(())
        } else {
            member.confirm(&running.hash).await
        }
    })
    .await
    .map_err(|e| (e, false))
}

async fn roll_back(members: &[McuDevice], snapshot: &[Vec<u8>], timing: &Timing, rebooting: bool) {
    let rolled_back = phase(members, "rollback", |i, member| {
        let old = snapshot[i].clone();
        let timing = *timing;
        async move {
            if rebooting {
                member.wait_for_reboot(&timing).await?;
            }
            member.rollback_to(&old).await
        }
    })
    .await;
    if let Err(e) = rolled_back {
        tracing::error!(error = %e, "group rollback incomplete");
    }
}
