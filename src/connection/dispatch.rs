//! Request handling for the management connection

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::fs::{self, FileAccess};
use super::messages::{DeviceMessage, ExecStatus};
use super::shell::{self, ShellRunner};
use super::DeviceConnection;
use crate::actions::{ActionResult, ActionRunner, ResultSink};
use crate::security::Metadata;
use crate::server::ServerClient;

#[async_trait]
impl ResultSink for DeviceConnection {
    async fn deliver(&self, result: &ActionResult, cancel: &CancellationToken) -> bool {
        if self.ensure_ready(cancel).await.is_err() {
            return false;
        }
        match self.send(&DeviceMessage::from(result)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(exec_id = %result.exec_id, error = %e, "result not sent");
                false
            }
        }
    }
}

/// Routes server requests to actions, file transfer and shells
///
/// Features left unset answer with the "cannot handle" alert.
pub struct Dispatcher {
    connection: Arc<DeviceConnection>,
    server: Arc<ServerClient>,
    metadata: Arc<Metadata>,
    actions: Option<Arc<ActionRunner>>,
    files: Option<FileAccess>,
    shell: Option<ShellRunner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("actions", &self.actions.is_some())
            .field("files", &self.files)
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Dispatcher replying over `connection`, with every feature off
    #[must_use]
    pub fn new(connection: Arc<DeviceConnection>, server: Arc<ServerClient>, metadata: Arc<Metadata>) -> Self {
        Self {
            connection,
            server,
            metadata,
            actions: None,
            files: None,
            shell: None,
        }
    }

    /// Accept action requests
    #[must_use]
    pub fn with_actions(mut self, runner: Arc<ActionRunner>) -> Self {
        self.actions = Some(runner);
        self
    }

    /// Accept file transfer requests
    #[must_use]
    pub fn with_files(mut self, access: FileAccess) -> Self {
        self.files = Some(access);
        self
    }

    /// Accept shell requests
    #[must_use]
    pub fn with_shell(mut self, runner: ShellRunner) -> Self {
        self.shell = Some(runner);
        self
    }

    /// Capability report matching the enabled features
    #[must_use]
    pub fn capabilities(&self) -> DeviceMessage {
        DeviceMessage::capabilities(self.shell.is_some(), self.files.is_some(), self.actions.is_some())
    }

    /// Parse one frame; `None` drops it, `Some(Err)` carries the reply to an
    /// unknown request
    fn parse(frame: &str) -> Option<Result<DeviceMessage, DeviceMessage>> {
        let value: serde_json::Value = match serde_json::from_str(frame) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                return None;
            }
        };
        let method = value
            .get("method")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        match serde_json::from_value(value) {
            Ok(message) => Some(Ok(message)),
            Err(e) => {
                tracing::warn!(%method, error = %e, "unknown request");
                Some(Err(DeviceMessage::cannot_handle()))
            }
        }
    }

    /// Reply owed for `frame`, if any
    pub async fn respond_to_frame(&self, frame: &str, cancel: &CancellationToken) -> Option<DeviceMessage> {
        match Self::parse(frame)? {
            Ok(message) => self.respond(message, cancel).await,
            Err(reply) => Some(reply),
        }
    }

    /// Handle a request and produce its reply
    ///
    /// Shell requests start a session in the background and have no reply.
    pub async fn respond(&self, message: DeviceMessage, cancel: &CancellationToken) -> Option<DeviceMessage> {
        match message {
            DeviceMessage::Alert { alert } => {
                tracing::info!(?alert, "server alert");
                None
            }
            DeviceMessage::ActionExec {
                execution_id,
                action_id,
            } if self.actions.is_some() => {
                let runner = self.actions.as_ref()?;
                let status = if runner.execute(&execution_id, &action_id) {
                    ExecStatus::Ok
                } else {
                    ExecStatus::Full
                };
                Some(DeviceMessage::ActionExecControl { execution_id, status })
            }
            DeviceMessage::ActionListQuery if self.actions.is_some() => {
                let actions = self.actions.as_ref().map(|r| r.list()).unwrap_or_default();
                Some(DeviceMessage::ActionListUpdate { actions })
            }
            DeviceMessage::FsFileProbe { id, file } if self.files.is_some() => {
                let access = self.files.as_ref()?;
                Some(fs::probe(access, id, &file).await)
            }
            DeviceMessage::FsFileDownload {
                id,
                file,
                upload_urls,
                part_size,
            } if self.files.is_some() => {
                let access = self.files.as_ref()?;
                Some(fs::upload(access, self.server.http(), id, &file, &upload_urls, part_size).await)
            }
            DeviceMessage::ShellAttach { mac_addr, uuid } if self.shell.is_some() => {
                self.spawn_shell(mac_addr, uuid, cancel);
                None
            }
            other => {
                tracing::warn!(method = other.method(), "request not handled");
                Some(DeviceMessage::cannot_handle())
            }
        }
    }

    fn spawn_shell(&self, mac_addr: String, uuid: String, cancel: &CancellationToken) {
        let Some(runner) = self.shell.clone() else {
            return;
        };
        let server = Arc::clone(&self.server);
        let metadata = Arc::clone(&self.metadata);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let session = async {
                let token = server.token(&metadata).await?;
                let url = server.ws_url(&shell::attach_path(&mac_addr, &uuid))?;
                runner.attach(&url, &token, server.certificate(), &cancel).await
            };
            if let Err(e) = session.await {
                tracing::warn!(%uuid, error = %e, "shell session failed");
            }
        });
    }

    /// Handle inbound frames until the channel closes or `cancel` fires
    ///
    /// File uploads run in their own task so a large transfer does not hold
    /// up other requests.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<String>, cancel: &CancellationToken) {
        tracing::info!("starting request handler");
        loop {
            let frame = tokio::select! {
                () = cancel.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let message = match Self::parse(&frame) {
                None => continue,
                Some(Err(reply)) => {
                    self.reply(&reply, cancel).await;
                    continue;
                }
                Some(Ok(message)) => message,
            };

            if matches!(message, DeviceMessage::FsFileDownload { .. }) {
                let this = Arc::clone(&self);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Some(reply) = this.respond(message, &cancel).await {
                        this.reply(&reply, &cancel).await;
                    }
                });
            } else if let Some(reply) = self.respond(message, cancel).await {
                self.reply(&reply, cancel).await;
            }
        }
        tracing::info!("request handler exited");
    }

    async fn reply(&self, message: &DeviceMessage, cancel: &CancellationToken) {
        if let Err(e) = self.connection.send_retry(message, cancel).await
            && !e.is_cancelled()
        {
            tracing::warn!(method = message.method(), error = %e, "reply dropped");
        }
    }
}
