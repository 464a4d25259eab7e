//! Action kinds and their execution

use std::fmt;
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Grace period for output descriptors after the child is gone
pub const COMMAND_WAIT_DELAY: Duration = Duration::from_secs(5);

/// Exit status reported when the action never produced one
const NO_EXIT_STATUS: i32 = -1;

/// Callback behind a built-in action
pub type BuiltInCallback = Arc<dyn Fn() -> std::result::Result<String, String> + Send + Sync>;

/// Action described by the actions configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAction {
    /// Unique action id
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// What the action does
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Program and arguments
    #[serde(rename = "command")]
    pub argv: Vec<String>,

    /// Timeout in seconds; zero or less disables it
    #[serde(default, rename = "timeout")]
    pub timeout_seconds: f32,
}

/// Action implemented inside the agent
#[derive(Clone)]
pub struct BuiltInAction {
    /// Unique action id
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// What the action does
    pub description: String,

    /// Invoked on execution; `Err` maps to status 1
    pub callback: BuiltInCallback,
}

impl fmt::Debug for BuiltInAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltInAction")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// A runnable action
#[derive(Debug, Clone)]
pub enum Action {
    /// External command
    Command(CommandAction),
    /// In-process callback
    BuiltIn(BuiltInAction),
}

impl Action {
    /// Action id
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Command(a) => &a.id,
            Self::BuiltIn(a) => &a.id,
        }
    }

    /// Action name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Command(a) => &a.name,
            Self::BuiltIn(a) => &a.name,
        }
    }

    /// Action description
    #[must_use]
    pub fn description(&self) -> &str {
        match self {
            Self::Command(a) => &a.description,
            Self::BuiltIn(a) => &a.description,
        }
    }

    /// Run the action and return its exit status and raw output
    pub async fn execute(&self, cancel: &CancellationToken) -> (i32, Vec<u8>) {
        match self {
            Self::Command(a) => a.execute(cancel).await,
            Self::BuiltIn(a) => match (a.callback)() {
                Ok(out) => (0, out.into_bytes()),
                Err(out) => (1, out.into_bytes()),
            },
        }
    }
}

impl CommandAction {
    /// Configured timeout, `None` when disabled
    ///
    /// # Errors
    ///
    /// Returns `Config` if the value does not fit a duration
    pub fn timeout(&self) -> Result<Option<Duration>> {
        if self.timeout_seconds.is_nan() || self.timeout_seconds <= 0.0 {
            return Ok(None);
        }
        Duration::try_from_secs_f32(self.timeout_seconds)
            .map(Some)
            .map_err(|e| Error::Config(format!("action {}: invalid timeout {}: {e}", self.id, self.timeout_seconds)))
    }

    /// Spawn the command with stdout and stderr captured into one stream
    ///
    /// The child is killed on timeout or cancel. After it exits, output is
    /// collected for at most [`COMMAND_WAIT_DELAY`] in case a grandchild
    /// still holds the pipe open.
    pub async fn execute(&self, cancel: &CancellationToken) -> (i32, Vec<u8>) {
        let Some((program, args)) = self.argv.split_first() else {
            return (NO_EXIT_STATUS, b"action has an empty command".to_vec());
        };

        let timeout = match self.timeout() {
            Ok(timeout) => timeout,
            Err(e) => return (NO_EXIT_STATUS, e.to_string().into_bytes()),
        };

        tracing::debug!(action = %self.id, argv = ?self.argv, "executing action command");

        let (reader, writer) = match std::io::pipe() {
            Ok(pipe) => pipe,
            Err(e) => return (NO_EXIT_STATUS, format!("failed to create pipe: {e}").into_bytes()),
        };
        let reader = match pipe::Receiver::from_owned_fd(OwnedFd::from(reader)) {
            Ok(reader) => reader,
            Err(e) => return (NO_EXIT_STATUS, format!("failed to create pipe: {e}").into_bytes()),
        };
        let stderr = match writer.try_clone() {
            Ok(w) => w,
            Err(e) => return (NO_EXIT_STATUS, format!("failed to create pipe: {e}").into_bytes()),
        };

        // The command owns the write ends; dropping it right after spawn
        // leaves the child as the only writer
        let spawned = {
            let mut cmd = Command::new(program);
            cmd.args(args)
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(stderr)
                .kill_on_drop(true);
            cmd.spawn()
        };
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(action = %self.id, error = %e, "failed to spawn action");
                return (NO_EXIT_STATUS, format!("failed to spawn {program}: {e}").into_bytes());
            }
        };

        let output = Arc::new(Mutex::new(Vec::new()));
        let mut collector = tokio::spawn(collect_output(reader, output.clone()));

        let deadline = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            () = deadline => {
                tracing::warn!(action = %self.id, "action timed out, killing");
                None
            }
            () = cancel.cancelled() => None,
        };
        let status = match exited {
            Some(status) => status.ok(),
            None => {
                let _ = child.kill().await;
                child.wait().await.ok()
            }
        };

        if tokio::time::timeout(COMMAND_WAIT_DELAY, &mut collector).await.is_err() {
            tracing::warn!(action = %self.id, "action output still open after exit, giving up on it");
            collector.abort();
            let _ = collector.await;
        }

        let code = status.and_then(|s| s.code()).unwrap_or(NO_EXIT_STATUS);
        let bytes = output
            .lock()
            .map(|o| o.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone());

        (code, bytes)
    }
}

async fn collect_output(mut reader: pipe::Receiver, output: Arc<Mutex<Vec<u8>>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if let Ok(mut out) = output.lock() {
                    out.extend_from_slice(&buf[..n]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(argv: &[&str], timeout_seconds: f32) -> CommandAction {
        CommandAction {
            id: "test".into(),
            name: "Test".into(),
            description: String::new(),
            argv: argv.iter().map(ToString::to_string).collect(),
            timeout_seconds,
        }
    }

    #[tokio::test]
    async fn test_combined_output_and_status() {
        let action = command(&["sh", "-c", "echo out; echo err 1>&2; exit 3"], 0.0);
        let (code, out) = action.execute(&CancellationToken::new()).await;
        assert_eq!(code, 3);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let action = command(&["sleep", "30"], 0.2);
        let started = std::time::Instant::now();
        let (code, _) = action.execute(&CancellationToken::new()).await;
        assert_eq!(code, NO_EXIT_STATUS);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let action = command(&["/nonexistent/program"], 0.0);
        let (code, out) = action.execute(&CancellationToken::new()).await;
        assert_eq!(code, NO_EXIT_STATUS);
        assert!(!out.is_empty());
    }

    #[tokio::test]
    async fn test_builtin_error_maps_to_status_one() {
        let action = Action::BuiltIn(BuiltInAction {
            id: "fail".into(),
            name: "Fail".into(),
            description: String::new(),
            callback: Arc::new(|| Err("nope".to_string())),
        });
        let (code, out) = action.execute(&CancellationToken::new()).await;
        assert_eq!(code, 1);
        assert_eq!(out, b"nope");
    }

    #[test]
    fn test_config_parsing() {
        let json = r#"{"id":"echo","name":"Echo","command":["echo","hi"],"timeout":1.5}"#;
        let action: CommandAction = serde_json::from_str(json).unwrap();
        assert_eq!(action.argv, vec!["echo", "hi"]);
        assert_eq!(action.timeout().unwrap(), Some(Duration::from_millis(1500)));
        assert!(action.description.is_empty());
    }

    #[test]
    fn test_timeout_out_of_range() {
        assert_eq!(command(&["true"], 0.0).timeout().unwrap(), None);
        assert_eq!(command(&["true"], -4.0).timeout().unwrap(), None);
        assert!(matches!(command(&["true"], f32::INFINITY).timeout(), Err(Error::Config(_))));
        assert!(matches!(command(&["true"], f32::MAX).timeout(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_out_of_range_timeout_is_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let script = format!("touch {}", marker.display());
        let action = command(&["sh", "-c", &script], f32::INFINITY);

        let (code, out) = action.execute(&CancellationToken::new()).await;
        assert_eq!(code, NO_EXIT_STATUS);
        assert!(String::from_utf8(out).unwrap().contains("invalid timeout"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_output_held_open_by_grandchild() {
        // the background sleep keeps the pipe open after the shell exits
        let action = command(&["sh", "-c", "echo started; sleep 8 &"], 0.0);
        let started = std::time::Instant::now();
        let (code, out) = action.execute(&CancellationToken::new()).await;
        assert_eq!(code, 0);
        assert_eq!(out, b"started\n");
        assert!(started.elapsed() < Duration::from_secs(8));
    }
}
