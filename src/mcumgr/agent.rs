//! Update loops for every configured device and group
//!
//! Each entry authenticates on its own and polls the server on its own
//! interval. Entries run side by side; one failing entry never stops the
//! others.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::artifact::{GroupArtifact, ZephyrArtifact};
use super::config::McumgrConfig;
use super::device::{McuDevice, Timing};
use super::group::{group_version, update_group};
use super::single::update_device;
use super::transport;
use crate::security::{DeviceKey, MCUMGR_KEY_BITS};
use crate::server::{ServerClient, base_metadata};
use crate::{Error, Result};

/// What an entry updates
#[derive(Debug, Clone)]
pub enum UpdateTarget {
    /// A standalone device
    Single(McuDevice),
    /// Devices sharing one group artifact
    Group(Vec<McuDevice>),
}

impl UpdateTarget {
    /// Confirm the running images and return the version they share
    ///
    /// # Errors
    ///
    /// Returns error if a device is unreachable or group members disagree
    pub async fn init(&self) -> Result<String> {
        match self {
            Self::Single(device) => Ok(device.init().await?.version),
            Self::Group(members) => group_version(members).await,
        }
    }

    /// Install an artifact fetched from the server
    ///
    /// # Errors
    ///
    /// Returns the artifact, compatibility or update error
    pub async fn install(&self, artifact: &[u8], device_type: &str, timing: &Timing) -> Result<String> {
        match self {
            Self::Single(device) => {
                let artifact = ZephyrArtifact::read(artifact, device_type)?;
                tracing::info!(artifact = %artifact.name, version = %artifact.version, "installing image");
                update_device(device, &artifact, timing).await?;
                Ok(artifact.version)
            }
            Self::Group(members) => {
                let artifact = GroupArtifact::read(artifact, device_type)?;
                tracing::info!(artifact = %artifact.name, version = %artifact.version, "installing group image");
                update_group(members, &artifact, timing).await?;
                Ok(artifact.version)
            }
        }
    }
}

/// One configured device or group with its server identity
#[derive(Debug)]
pub struct UpdateUnit {
    name: String,
    id: String,
    device_type: String,
    target: UpdateTarget,
    server: ServerClient,
    interval: Duration,
}

impl UpdateUnit {
    /// Unit reporting as `id` with `device_type`
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        device_type: impl Into<String>,
        target: UpdateTarget,
        server: ServerClient,
        interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            device_type: device_type.into(),
            target,
            server,
            interval,
        }
    }

    /// Unit name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check for an update and install it; returns the version now running
    ///
    /// # Errors
    ///
    /// Returns the first error of the check, download or install
    pub async fn attempt(&self, version: &str, timing: &Timing) -> Result<String> {
        let metadata = base_metadata(&self.device_type, version, &self.id);
        tracing::debug!("checking for updates");
        let Some(update) = self.server.update_check(&metadata).await? else {
            return Ok(version.to_string());
        };

        tracing::info!(package = update.id, "fetching update");
        let artifact = self.server.fetch_artifact(&update).await?;
        let version = self.target.install(&artifact, &self.device_type, timing).await?;
        tracing::info!(new_version = %version, "update successful");
        Ok(version)
    }

    /// Initialize, then poll until cancelled or out of retries
    ///
    /// # Errors
    ///
    /// Returns the init error, or `Update` once `retries` attempts in a row
    /// have failed
    pub async fn run(&self, retries: u32, timing: &Timing, cancel: &CancellationToken) -> Result<()> {
        let mut version = self.target.init().await?;
        tracing::info!(%version, "configuration successful");

        retry_loop(retries, self.interval, cancel, &mut version, |current: &String| {
            let current = current.clone();
            async move { self.attempt(&current, timing).await }
        })
        .await
    }
}

/// Run `attempt` every `interval`, storing each success in `state`;
/// `retries` failures in a row end the loop, zero retries forever
///
/// # Errors
///
/// Returns `Update` when the retry limit is reached
pub async fn retry_loop<T, F, Fut>(
    retries: u32,
    interval: Duration,
    cancel: &CancellationToken,
    state: &mut T,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut(&T) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failures = 0u32;
    loop {
        match attempt(state).await {
            Ok(value) => {
                failures = 0;
                *state = value;
            }
            Err(e) => {
                failures += 1;
                if retries != 0 && failures >= retries {
                    tracing::error!(attempts = failures, error = %e, "retry limit reached");
                    return Err(Error::Update(format!("giving up after {failures} failed attempt(s): {e}")));
                }
                tracing::warn!(attempt = failures, max = retries, error = %e, "update attempt failed");
            }
        }

        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("exiting");
                return Ok(());
            }
            () = tokio::time::sleep(interval) => {}
        }
    }
}

/// The MCUmgr agent
#[derive(Debug)]
pub struct McumgrAgent {
    config: McumgrConfig,
    timing: Timing,
}

impl McumgrAgent {
    /// Agent for `config` with default reboot timing
    #[must_use]
    pub fn new(config: McumgrConfig) -> Self {
        Self {
            config,
            timing: Timing::default(),
        }
    }

    /// Override the reboot waits
    #[must_use]
    pub const fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    fn client(&self, key: &str) -> Result<ServerClient> {
        let key = DeviceKey::load_or_create(&self.config.key_path(key), MCUMGR_KEY_BITS)?;
        ServerClient::new(&self.config.server, Arc::new(key), None)
    }

    /// Build a unit for every device and group in the config
    ///
    /// # Errors
    ///
    /// Returns error if a key or transport cannot be set up
    pub fn units(&self) -> Result<Vec<UpdateUnit>> {
        let mut units = Vec::with_capacity(self.config.devices.len() + self.config.groups.len());

        for device in &self.config.devices {
            let transport = transport::open(&device.transport)?;
            units.push(UpdateUnit::new(
                &device.name,
                &device.id,
                &device.dev_type,
                UpdateTarget::Single(McuDevice::new(&device.name, transport, device.self_confirm)),
                self.client(&device.key)?,
                device.update_interval.unwrap_or(self.config.update_interval),
            ));
        }

        for group in &self.config.groups {
            let members = group
                .members
                .iter()
                .map(|m| Ok(McuDevice::new(&m.name, transport::open(&m.transport)?, m.self_confirm)))
                .collect::<Result<Vec<_>>>()?;
            units.push(UpdateUnit::new(
                &group.name,
                &group.id,
                &group.group_type,
                UpdateTarget::Group(members),
                self.client(&group.key)?,
                group.update_interval.unwrap_or(self.config.update_interval),
            ));
        }
        Ok(units)
    }

    /// Run every unit until `cancel` fires
    ///
    /// Units that fail to initialize or exhaust their retries are logged
    /// and dropped; the rest keep running.
    ///
    /// # Errors
    ///
    /// Returns error if the units cannot be built
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        tracing::info!(server = %self.config.server, "starting MCUmgr agent");
        let units = self.units()?;
        let retries = self.config.retries;
        let timing = self.timing;

        let loops = units.iter().map(|unit| {
            let span = match unit.target {
                UpdateTarget::Single(_) => tracing::info_span!("device", name = %unit.name),
                UpdateTarget::Group(_) => tracing::info_span!("group", name = %unit.name),
            };
            async move {
                if let Err(e) = unit.run(retries, &timing, cancel).await {
                    tracing::error!(error = %e, "device stopped");
                }
            }
            .instrument(span)
        });
        futures::future::join_all(loops).await;

        tracing::info!("MCUmgr agent stopped");
        Ok(())
    }
}
