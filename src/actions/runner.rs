//! Command and responder loops over the request/result stores

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Action, ActionRequest, ActionResult, BuiltInAction, CommandAction};
use crate::error::StoreError;
use crate::store::FileStore;
use crate::{Error, Result};

/// Pause between attempts to hand a result to the sink
const RESULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Pause after an unexpected store error, so a broken disk does not spin
const STORE_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Status reported for an action id that is not configured
const UNKNOWN_ACTION_STATUS: i32 = -1;

/// Receiver of finished action results
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Deliver a result; return `true` once it has been accepted
    ///
    /// The same result may be offered again after a restart, so accepting
    /// it must be idempotent.
    async fn deliver(&self, result: &ActionResult, cancel: &CancellationToken) -> bool;
}

/// Action entry as reported to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSummary {
    /// Action id
    pub action_id: String,

    /// Action name
    pub action_name: String,

    /// Description
    pub description: String,

    /// Command argv; empty for built-in actions
    pub command: Vec<String>,

    /// Timeout in seconds
    pub timeout: f32,
}

#[derive(Debug, Default)]
struct ActionTable {
    commands: Vec<CommandAction>,
    builtins: Vec<BuiltInAction>,
    by_id: Arc<HashMap<String, Action>>,
}

impl ActionTable {
    fn reindex(&mut self) {
        let mut by_id = HashMap::new();
        for cmd in &self.commands {
            by_id.insert(cmd.id.clone(), Action::Command(cmd.clone()));
        }
        for builtin in &self.builtins {
            by_id.insert(builtin.id.clone(), Action::BuiltIn(builtin.clone()));
        }
        self.by_id = Arc::new(by_id);
    }
}

/// Executes queued actions and reports their results
#[derive(Debug)]
pub struct ActionRunner {
    table: RwLock<ActionTable>,
    requests: FileStore,
    results: FileStore,
    retry_delay: Duration,
}

impl ActionRunner {
    /// Open the `req` and `res` stores under `data_dir`
    ///
    /// # Errors
    ///
    /// Returns error if either store cannot be opened
    pub fn new(data_dir: &Path, queue_size: usize, commands: Vec<CommandAction>) -> Result<Self> {
        let requests = FileStore::new(data_dir.join("req"), queue_size)?;
        let results = FileStore::new(data_dir.join("res"), queue_size)?;

        let mut table = ActionTable {
            commands,
            ..ActionTable::default()
        };
        table.reindex();

        Ok(Self {
            table: RwLock::new(table),
            requests,
            results,
            retry_delay: RESULT_RETRY_DELAY,
        })
    }

    /// Override the pause between delivery attempts
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Request store
    #[must_use]
    pub const fn requests(&self) -> &FileStore {
        &self.requests
    }

    /// Result store
    #[must_use]
    pub const fn results(&self) -> &FileStore {
        &self.results
    }

    /// Replace the configured command actions, keeping built-ins
    pub fn rebuild(&self, commands: Vec<CommandAction>) {
        let mut table = self.table.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        table.commands = commands;
        table.reindex();
        tracing::debug!(actions = table.by_id.len(), "action table rebuilt");
    }

    /// Register an action implemented in-process
    pub fn register_builtin(&self, action: BuiltInAction) {
        let mut table = self.table.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        table.builtins.retain(|b| b.id != action.id);
        table.builtins.push(action);
        table.reindex();
    }

    fn snapshot(&self) -> Arc<HashMap<String, Action>> {
        self.table
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .by_id
            .clone()
    }

    /// Every known action, sorted by id
    #[must_use]
    pub fn list(&self) -> Vec<ActionSummary> {
        let snapshot = self.snapshot();
        let mut list: Vec<ActionSummary> = snapshot
            .values()
            .map(|action| {
                let (command, timeout) = match action {
                    Action::Command(c) => (c.argv.clone(), c.timeout_seconds),
                    Action::BuiltIn(_) => (Vec::new(), 0.0),
                };
                ActionSummary {
                    action_id: action.id().to_string(),
                    action_name: action.name().to_string(),
                    description: action.description().to_string(),
                    command,
                    timeout,
                }
            })
            .collect();
        list.sort_by(|a, b| a.action_id.cmp(&b.action_id));
        list
    }

    /// Queue an execution; `false` means the request queue is full
    pub fn execute(&self, exec_id: &str, action_id: &str) -> bool {
        let request = ActionRequest {
            exec_id: exec_id.to_string(),
            action_id: action_id.to_string(),
        };

        let queued = request
            .to_bytes()
            .and_then(|bytes| self.requests.try_enqueue(&bytes));

        match queued {
            Ok(()) => {
                tracing::info!(exec_id, action_id, "action queued");
                true
            }
            Err(Error::Store(StoreError::Full)) => {
                tracing::warn!(exec_id, action_id, "action queue full");
                false
            }
            Err(e) => {
                tracing::warn!(exec_id, action_id, error = %e, "failed to queue action");
                false
            }
        }
    }

    /// Run one request through its action
    async fn run_request(&self, request: &ActionRequest, cancel: &CancellationToken) -> ActionResult {
        let Some(action) = self.snapshot().get(&request.action_id).cloned() else {
            tracing::warn!(
                exec_id = %request.exec_id,
                action_id = %request.action_id,
                "requested action does not exist"
            );
            return ActionResult {
                exec_id: request.exec_id.clone(),
                status_code: UNKNOWN_ACTION_STATUS,
                output: None,
            };
        };

        tracing::info!(exec_id = %request.exec_id, action = %action.name(), "running action");
        let (status_code, output) = action.execute(cancel).await;
        tracing::info!(exec_id = %request.exec_id, status_code, "action finished");

        ActionResult {
            exec_id: request.exec_id.clone(),
            status_code,
            output: Some(BASE64.encode(output)),
        }
    }

    /// Dequeue requests, execute them and queue their results, until cancelled
    pub async fn run_commands(&self, cancel: &CancellationToken) {
        tracing::info!("starting action command loop");

        loop {
            let raw = match self.requests.dequeue(cancel).await {
                Ok(raw) => raw,
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to dequeue action");
                    tokio::time::sleep(STORE_ERROR_DELAY).await;
                    continue;
                }
            };

            let request = match ActionRequest::from_bytes(&raw) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(error = %e, "discarding undecodable action request");
                    continue;
                }
            };

            let result = self.run_request(&request, cancel).await;
            let bytes = match result.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(exec_id = %result.exec_id, error = %e, "failed to encode result");
                    continue;
                }
            };

            match self.results.enqueue(&bytes, cancel).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    tracing::warn!(exec_id = %result.exec_id, error = %e, "failed to queue result");
                }
            }
        }

        tracing::info!("action command loop exited");
    }

    /// Hand queued results to `sink`, popping each only once accepted
    pub async fn run_responder(&self, sink: &dyn ResultSink, cancel: &CancellationToken) {
        tracing::info!("starting action result sender");

        'outer: loop {
            match self.results.wait_non_empty(cancel).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to wait for result");
                    continue;
                }
            }

            let raw = match self.results.peek() {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    tracing::warn!("result store woke up without an item");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read result");
                    tokio::time::sleep(STORE_ERROR_DELAY).await;
                    continue;
                }
            };

            match ActionResult::from_bytes(&raw) {
                Ok(result) => {
                    while !sink.deliver(&result, cancel).await {
                        tokio::select! {
                            () = cancel.cancelled() => break 'outer,
                            () = tokio::time::sleep(self.retry_delay) => {}
                        }
                    }
                    tracing::debug!(exec_id = %result.exec_id, "result delivered");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable action result");
                }
            }

            if let Err(e) = self.results.pop() {
                tracing::warn!(error = %e, "failed to pop delivered result");
            }
        }

        tracing::info!("action result sender exited");
    }

    /// Run the command and responder loops together until cancelled
    pub async fn run(&self, sink: &dyn ResultSink, cancel: &CancellationToken) {
        tokio::join!(self.run_commands(cancel), self.run_responder(sink, cancel));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Collect(tokio::sync::Mutex<Vec<ActionResult>>);

    #[async_trait]
    impl ResultSink for Collect {
        async fn deliver(&self, result: &ActionResult, _cancel: &CancellationToken) -> bool {
            self.0.lock().await.push(result.clone());
            true
        }
    }

    fn echo_action() -> CommandAction {
        CommandAction {
            id: "echo".into(),
            name: "Echo".into(),
            description: "Say hello".into(),
            argv: vec!["echo".into(), "hello".into()],
            timeout_seconds: 5.0,
        }
    }

    #[test]
    fn test_list_includes_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ActionRunner::new(dir.path(), 4, vec![echo_action()]).unwrap();
        runner.register_builtin(BuiltInAction {
            id: "check-update".into(),
            name: "Check update".into(),
            description: String::new(),
            callback: Arc::new(|| Ok(String::new())),
        });

        let ids: Vec<String> = runner.list().into_iter().map(|a| a.action_id).collect();
        assert_eq!(ids, vec!["check-update", "echo"]);

        runner.rebuild(Vec::new());
        let ids: Vec<String> = runner.list().into_iter().map(|a| a.action_id).collect();
        assert_eq!(ids, vec!["check-update"]);
    }

    #[test]
    fn test_execute_reports_back_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ActionRunner::new(dir.path(), 1, vec![echo_action()]).unwrap();
        assert!(runner.execute("e1", "echo"));
        assert!(!runner.execute("e2", "echo"));
    }

    #[tokio::test]
    async fn test_unknown_action_yields_absent_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ActionRunner::new(dir.path(), 4, Vec::new()).unwrap();
        let request = ActionRequest {
            exec_id: "e1".into(),
            action_id: "missing".into(),
        };
        let result = runner.run_request(&request, &CancellationToken::new()).await;
        assert_eq!(result.status_code, UNKNOWN_ACTION_STATUS);
        assert_eq!(result.output, None);
    }

    #[tokio::test]
    async fn test_executes_and_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ActionRunner::new(dir.path(), 4, vec![echo_action()]).unwrap());
        let sink = Arc::new(Collect(tokio::sync::Mutex::new(Vec::new())));
        let cancel = CancellationToken::new();

        assert!(runner.execute("e1", "echo"));

        let task = {
            let (runner, sink, cancel) = (runner.clone(), sink.clone(), cancel.clone());
            tokio::spawn(async move { runner.run(sink.as_ref(), &cancel).await })
        };

        let polls = AtomicUsize::new(0);
        while sink.0.lock().await.is_empty() && polls.fetch_add(1, Ordering::Relaxed) < 200 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        let delivered = sink.0.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].exec_id, "e1");
        assert_eq!(delivered[0].status_code, 0);
        let output = BASE64.decode(delivered[0].output.as_ref().unwrap()).unwrap();
        assert_eq!(output, b"hello\n");
    }
}
