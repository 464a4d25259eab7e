//! Reverse shell sessions
//!
//! Each `shell_attach` opens its own WebSocket and bridges binary frames to
//! a shell child: frames go to its stdin, stdout and stderr come back as
//! frames. The number of live sessions is capped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{Error, Result};

/// Shells tried after the configured one
pub const FALLBACK_SHELLS: [&str; 2] = ["bash", "sh"];

/// Path of the shell attach endpoint
#[must_use]
pub fn attach_path(mac_addr: &str, uuid: &str) -> String {
    format!("/api/v1/devices/{mac_addr}/shell/attach/{uuid}")
}

/// First available of `preferred`, `bash` and `sh`
///
/// # Errors
///
/// Returns `Config` if none of them can be found
pub fn find_shell(preferred: Option<&str>) -> Result<PathBuf> {
    preferred
        .into_iter()
        .chain(FALLBACK_SHELLS)
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| Error::Config("no shell available on the device".to_string()))
}

/// Spawns shell sessions up to a limit
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: PathBuf,
    sessions: Arc<Semaphore>,
}

impl ShellRunner {
    /// Runner for `shell` allowing `max_sessions` at once
    #[must_use]
    pub fn new(shell: PathBuf, max_sessions: usize) -> Self {
        Self {
            shell,
            sessions: Arc::new(Semaphore::new(max_sessions)),
        }
    }

    /// Shell binary
    #[must_use]
    pub fn shell(&self) -> &Path {
        &self.shell
    }

    /// Claim a session slot, `None` when all are taken
    #[must_use]
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.sessions.clone().try_acquire_owned().ok()
    }

    /// Connect to `url` and run a shell over it until either side ends
    ///
    /// # Errors
    ///
    /// Returns `Connection` when the session limit is reached, or the
    /// connect or bridge error
    pub async fn attach(
        &self,
        url: &Url,
        token: &str,
        certificate: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _permit = self
            .try_reserve()
            .ok_or_else(|| Error::Connection("too many shell sessions".to_string()))?;
        let stream = super::connect(url, token, certificate).await?;
        bridge(&self.shell, stream, cancel).await
    }
}

async fn pump(mut pipe: impl AsyncRead + Unpin, out: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; 4096];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if out.send(buf[..n].to_vec()).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Run `shell` with its pipes bridged to `ws`
///
/// # Errors
///
/// Returns error if the shell cannot be started or the socket fails
pub async fn bridge<S>(shell: &Path, ws: S, cancel: &CancellationToken) -> Result<()>
where
    S: Stream<Item = std::result::Result<Message, tungstenite::Error>>
        + Sink<Message, Error = tungstenite::Error>
        + Unpin,
{
    let mut child = Command::new(shell)
        .env("TERM", "dumb")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    tracing::info!(shell = %shell.display(), pid = child.id(), "shell session started");

    let mut stdin = child.stdin.take();
    let (out_tx, mut out_rx) = mpsc::channel(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, out_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, out_tx.clone()));
    }
    drop(out_tx);

    let (mut sink, mut stream) = ws.split();
    let result = loop {
        tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            output = out_rx.recv() => match output {
                Some(data) => {
                    if let Err(e) = sink.send(Message::Binary(data)).await {
                        break Err(e.into());
                    }
                }
                None => break Ok(()),
            },
            frame = stream.next() => {
                let input = match frame {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Err(e.into()),
                };
                let written = match stdin.as_mut() {
                    Some(pipe) => pipe.write_all(&input).await.is_ok(),
                    None => false,
                };
                if !written {
                    stdin = None;
                }
            }
        }
    };

    drop(stdin);
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "shell already exited");
    }
    let status = child.wait().await;
    tracing::info!(?status, "shell session finished");
    let _ = sink.close().await;
    result
}
