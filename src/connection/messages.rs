//! Management messages
//!
//! Every frame is a JSON object whose `method` names the variant.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::actions::{ActionResult, ActionSummary};

/// Capability: reverse shell
pub const CAP_SHELL: &str = "shell_connect";

/// Capability: file transfer
pub const CAP_FILE_TRANSFER: &str = "file_transfer";

/// Capability: action execution
pub const CAP_EXEC: &str = "exec_cmds";

/// Whether an action request was queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    /// Queued for execution
    Ok,
    /// Request queue is full
    Full,
}

/// Status of a file-transfer reply
pub const FS_OK: i32 = 0;

/// Status of a failed file-transfer request
pub const FS_FAILED: i32 = 1;

/// A management message in either direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// Free-form notice
    Alert {
        /// Notice fields
        alert: serde_json::Map<String, serde_json::Value>,
    },
    /// What the device can do
    CapabilityReport {
        /// Capability name to enabled
        capabilities: BTreeMap<String, bool>,
    },
    /// Open a reverse shell
    ShellAttach {
        /// Device identifier the shell belongs to
        mac_addr: String,
        /// Shell session id
        uuid: String,
    },
    /// Run an action
    ActionExec {
        /// Execution id echoed in the result
        execution_id: String,
        /// Action to run
        action_id: String,
    },
    /// Result of an action run
    ActionExecResult {
        /// Execution id from the request
        execution_id: String,
        /// Exit status
        status_code: i32,
        /// Base64 of the combined output
        output: String,
    },
    /// Whether an action request was accepted
    ActionExecControl {
        /// Execution id from the request
        execution_id: String,
        /// Queue outcome
        status: ExecStatus,
    },
    /// Ask for the action list
    ActionListQuery,
    /// The action list
    ActionListUpdate {
        /// Every runnable action
        actions: Vec<ActionSummary>,
    },
    /// Upload a file in parts to presigned URLs
    FsFileDownload {
        /// Request id
        id: String,
        /// File to send
        file: String,
        /// One URL per part
        upload_urls: Vec<String>,
        /// Part size in bytes
        part_size: u64,
    },
    /// Outcome of a file upload
    FsFileDownloadReply {
        /// Request id
        id: String,
        /// [`FS_OK`] or [`FS_FAILED`]
        status: i32,
        /// `ETag` of every uploaded part
        etags: Vec<String>,
    },
    /// Ask for a file's size
    FsFileProbe {
        /// Request id
        id: String,
        /// File to inspect
        file: String,
    },
    /// File size
    FsFileProbeReply {
        /// Request id
        id: String,
        /// [`FS_OK`] or [`FS_FAILED`]
        status: i32,
        /// Size in bytes
        size: u64,
    },
}

impl DeviceMessage {
    /// Reply to anything the device does not understand
    #[must_use]
    pub fn cannot_handle() -> Self {
        let mut alert = serde_json::Map::new();
        alert.insert("error".to_string(), "Device cannot handle request".into());
        Self::Alert { alert }
    }

    /// Capability report for the enabled features
    #[must_use]
    pub fn capabilities(shell: bool, file_transfer: bool, exec: bool) -> Self {
        Self::CapabilityReport {
            capabilities: BTreeMap::from([
                (CAP_SHELL.to_string(), shell),
                (CAP_FILE_TRANSFER.to_string(), file_transfer),
                (CAP_EXEC.to_string(), exec),
            ]),
        }
    }

    /// Method name of this message
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Alert { .. } => "alert",
            Self::CapabilityReport { .. } => "capability_report",
            Self::ShellAttach { .. } => "shell_attach",
            Self::ActionExec { .. } => "action_exec",
            Self::ActionExecResult { .. } => "action_exec_result",
            Self::ActionExecControl { .. } => "action_exec_control",
            Self::ActionListQuery => "action_list_query",
            Self::ActionListUpdate { .. } => "action_list_update",
            Self::FsFileDownload { .. } => "fs_file_download",
            Self::FsFileDownloadReply { .. } => "fs_file_download_reply",
            Self::FsFileProbe { .. } => "fs_file_probe",
            Self::FsFileProbeReply { .. } => "fs_file_probe_reply",
        }
    }
}

impl From<&ActionResult> for DeviceMessage {
    fn from(result: &ActionResult) -> Self {
        Self::ActionExecResult {
            execution_id: result.exec_id.clone(),
            status_code: result.status_code,
            output: result.output.clone().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_by_method() {
        let msg: DeviceMessage =
            serde_json::from_str(r#"{"method": "action_exec", "execution_id": "e1", "action_id": "ls"}"#).unwrap();
        assert_eq!(
            msg,
            DeviceMessage::ActionExec {
                execution_id: "e1".into(),
                action_id: "ls".into()
            }
        );

        let query: DeviceMessage = serde_json::from_str(r#"{"method": "action_list_query"}"#).unwrap();
        assert_eq!(query, DeviceMessage::ActionListQuery);
        assert!(serde_json::from_str::<DeviceMessage>(r#"{"method": "reboot"}"#).is_err());
    }

    #[test]
    fn test_outbound_shapes() {
        let control = serde_json::to_value(DeviceMessage::ActionExecControl {
            execution_id: "e1".into(),
            status: ExecStatus::Full,
        })
        .unwrap();
        assert_eq!(
            control,
            serde_json::json!({"method": "action_exec_control", "execution_id": "e1", "status": "full"})
        );

        let alert = serde_json::to_value(DeviceMessage::cannot_handle()).unwrap();
        assert_eq!(alert["method"], "alert");
        assert_eq!(alert["alert"]["error"], "Device cannot handle request");

        let caps = serde_json::to_value(DeviceMessage::capabilities(true, false, true)).unwrap();
        assert_eq!(caps["capabilities"]["shell_connect"], true);
        assert_eq!(caps["capabilities"]["file_transfer"], false);
        assert_eq!(caps["capabilities"]["exec_cmds"], true);
    }

    #[test]
    fn test_result_without_output() {
        let result = ActionResult {
            exec_id: "e".into(),
            status_code: -1,
            output: None,
        };
        let value = serde_json::to_value(DeviceMessage::from(&result)).unwrap();
        assert_eq!(value["output"], "");
        assert_eq!(value["status_code"], -1);
    }
}
