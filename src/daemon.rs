//! Daemon - the long-running Linux device agent
//!
//! Polls for updates and keeps the management connection up. Requests
//! coming over the connection are handled by the [`Dispatcher`]; action
//! results flow back through the runner's result store.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::actions::{ActionRunner, BuiltInAction};
use crate::connection::fs::FileAccess;
use crate::connection::shell::{ShellRunner, find_shell};
use crate::connection::{DeviceConnection, DeviceMessage, Dispatcher};
use crate::installer::{BootEnvironment, Device, InstallOutcome, Installers, MemoryBootEnv, UBootEnv};
use crate::security::{DeviceKey, LINUX_KEY_BITS, Metadata};
use crate::server::metadata::{self, SYS_CLASS_NET};
use crate::server::{DEVICE_WS_PATH, DownloadSettings, ServerClient, install_update};
use crate::{Config, Error, Result};

/// Built-in action that starts an update check right away
pub const CHECK_UPDATE_ACTION: &str = "check-update";

/// Build the installer view of this device
///
/// The U-Boot environment is only needed when rootfs partitions are
/// configured.
///
/// # Errors
///
/// Returns error if the boot environment tools or the device type are
/// missing
pub fn build_device(config: &Config) -> Result<Device> {
    let env: Arc<dyn BootEnvironment> = if config.rootfs_parts.is_some() {
        Arc::new(UBootEnv::locate()?)
    } else {
        Arc::new(MemoryBootEnv::default())
    };
    let installers = Installers::standard(config.rootfs_parts.clone(), env);
    Device::from_config(config, installers)
}

/// Read the extra server certificate, if one is configured
///
/// # Errors
///
/// Returns `Config` if the file cannot be read
pub fn load_certificate(config: &Config) -> Result<Option<Vec<u8>>> {
    config
        .server_certificate
        .as_deref()
        .map(|path| {
            std::fs::read(path)
                .map_err(|e| Error::Config(format!("cannot read server certificate {}: {e}", path.display())))
        })
        .transpose()
}

/// The Linux device agent
pub struct Daemon {
    config: Config,
    device: Arc<Device>,
    server: Arc<ServerClient>,
    device_id: String,
    update_trigger: Arc<Notify>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("server", &self.server.base_url().as_str())
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Set up the device, its key and the server client
    ///
    /// # Errors
    ///
    /// Returns error if any of them cannot be set up
    pub fn new(config: Config) -> Result<Self> {
        let device = build_device(&config)?;
        let key = DeviceKey::load_or_create(&config.paths.rsa_key(), LINUX_KEY_BITS)?;
        let server = ServerClient::new(&config.server_url, Arc::new(key), load_certificate(&config)?)?;
        let device_id = metadata::device_identifier(&config, Path::new(SYS_CLASS_NET))?;
        tracing::info!(%device_id, device_type = device.device_type(), "device identity loaded");
        Ok(Self::from_parts(config, device, server, device_id))
    }

    /// Daemon over already built parts
    #[must_use]
    pub fn from_parts(config: Config, device: Device, server: ServerClient, device_id: String) -> Self {
        Self {
            config,
            device: Arc::new(device),
            server: Arc::new(server),
            device_id,
            update_trigger: Arc::new(Notify::new()),
        }
    }

    /// Wake the update poller
    pub fn trigger_update_check(&self) {
        self.update_trigger.notify_one();
    }

    /// Current device metadata
    ///
    /// # Errors
    ///
    /// Returns error if the installed state or tags cannot be read
    pub fn metadata(&self) -> Result<Metadata> {
        metadata::collect(&self.config, &self.device, &self.device_id)
    }

    fn download_settings(&self) -> DownloadSettings {
        DownloadSettings {
            retry_count: self.config.reconnect_retry_count,
            retry_time: self.config.reconnect_retry_time,
            cache_dir: self.config.http_cache_enabled.then(|| self.config.paths.cache_dir()),
            certificate: self.server.certificate().map(<[u8]>::to_vec),
        }
    }

    /// Authorization header, waiting until the server accepts the device
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires, or a non-authorization error
    pub async fn authorized_token(&self, metadata: &Metadata, cancel: &CancellationToken) -> Result<String> {
        loop {
            match self.server.token(metadata).await {
                Err(Error::Unauthorized) => {
                    tracing::info!(
                        retry_in = ?self.config.retry_poll_interval,
                        "device not accepted yet"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(self.config.retry_poll_interval) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// Ask the server for an update and install it if there is one
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` while the device is not accepted, or the
    /// check, download or install error
    pub async fn check_for_update(&self) -> Result<Option<InstallOutcome>> {
        if self.device.update_pending() {
            tracing::info!("an installed update awaits commit, skipping update check");
            return Ok(None);
        }

        let metadata = self.metadata()?;
        let Some(info) = self.server.update_check(&metadata).await? else {
            return Ok(None);
        };

        let device = Arc::clone(&self.device);
        let settings = self.download_settings();
        let outcome = tokio::task::spawn_blocking(move || install_update(&device, &info, settings))
            .await
            .map_err(|e| Error::Install(format!("install task failed: {e}")))??;
        Ok(Some(outcome))
    }

    /// Poll for updates until cancelled
    ///
    /// The [`CHECK_UPDATE_ACTION`] action cuts the wait short.
    pub async fn poll_updates(&self, cancel: &CancellationToken) {
        tracing::info!(interval = ?self.config.update_poll_interval, "starting update poller");
        loop {
            let delay = match self.check_for_update().await {
                Ok(Some(outcome)) => {
                    tracing::info!(
                        artifact = %outcome.artifact_name,
                        committed = outcome.committed,
                        reboot_required = outcome.reboot_required,
                        "update installed"
                    );
                    if !outcome.committed {
                        tracing::info!("reboot into the new image and run `rdfm commit` to keep it");
                    }
                    self.config.update_poll_interval
                }
                Ok(None) => self.config.update_poll_interval,
                Err(Error::Unauthorized) => {
                    tracing::warn!("device not authorized, retrying update check");
                    self.config.retry_poll_interval
                }
                Err(e) => {
                    tracing::error!(error = %e, "update check failed");
                    self.config.update_poll_interval
                }
            };

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
                () = self.update_trigger.notified() => tracing::info!("update check requested"),
            }
        }
        tracing::info!("update poller exited");
    }

    fn action_runner(&self) -> Result<Option<Arc<ActionRunner>>> {
        if !self.config.action_enable {
            return Ok(None);
        }
        let commands = crate::config::load_actions(&self.config.paths.actions()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "no configured actions");
            Vec::new()
        });
        let queue_size = usize::try_from(self.config.action_queue_size)
            .map_err(|_| Error::Config("ActionQueueSize is too large".to_string()))?;
        let runner = ActionRunner::new(&self.config.paths.data_dir, queue_size, commands)?;

        let trigger = Arc::clone(&self.update_trigger);
        runner.register_builtin(BuiltInAction {
            id: CHECK_UPDATE_ACTION.to_string(),
            name: "Check update".to_string(),
            description: "Check for an update now".to_string(),
            callback: Arc::new(move || {
                trigger.notify_one();
                Ok("update check scheduled".to_string())
            }),
        });
        Ok(Some(Arc::new(runner)))
    }

    fn shell_runner(&self) -> Option<ShellRunner> {
        if !self.config.shell_enable {
            return None;
        }
        match find_shell(self.config.shell_path.as_deref()) {
            Ok(shell) => Some(ShellRunner::new(shell, self.config.shell_concurrent_max_count)),
            Err(e) => {
                tracing::warn!(error = %e, "reverse shell disabled");
                None
            }
        }
    }

    /// Run until `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns error if the metadata or the action stores cannot be set up
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(server = %self.server.base_url(), "daemon running");

        let metadata = Arc::new(self.metadata()?);
        let runner = self.action_runner()?;
        let shell = self.shell_runner();
        let files = self
            .config
            .file_system_enable
            .then(|| FileAccess::new(&self.config.file_system_base_dir));

        let greeting = DeviceMessage::capabilities(shell.is_some(), files.is_some(), runner.is_some());
        let url = self.server.ws_url(DEVICE_WS_PATH)?;
        let (connection, inbound) =
            DeviceConnection::new(url, self.server.certificate().map(<[u8]>::to_vec), greeting);
        let connection = Arc::new(connection);

        let mut dispatcher = Dispatcher::new(Arc::clone(&connection), Arc::clone(&self.server), Arc::clone(&metadata));
        if let Some(runner) = &runner {
            dispatcher = dispatcher.with_actions(Arc::clone(runner));
        }
        if let Some(files) = files {
            dispatcher = dispatcher.with_files(files);
        }
        if let Some(shell) = shell {
            dispatcher = dispatcher.with_shell(shell);
        }
        let dispatcher = Arc::new(dispatcher);

        let this = &self;
        let token = || {
            let metadata = Arc::clone(&metadata);
            let cancel = cancel.clone();
            async move { this.authorized_token(&metadata, &cancel).await }
        };
        let actions = async {
            if let Some(runner) = &runner {
                runner.run(connection.as_ref(), &cancel).await;
            }
        };

        tokio::join!(
            connection.maintain(token, &cancel),
            dispatcher.run(inbound, &cancel),
            self.poll_updates(&cancel),
            actions,
        );

        tracing::info!("daemon stopped");
        Ok(())
    }
}

/// Cancel `cancel` on Ctrl-C or SIGTERM
pub async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown requested");
    cancel.cancel();
}
