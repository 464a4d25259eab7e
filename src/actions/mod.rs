//! Server-dispatched actions
//!
//! Requests and results travel through two durable [`FileStore`]s so that
//! a result is only dropped after the server acknowledged it.
//!
//! [`FileStore`]: crate::store::FileStore

mod action;
mod runner;

use serde::{Deserialize, Serialize};

pub use action::{Action, BuiltInAction, BuiltInCallback, CommandAction, COMMAND_WAIT_DELAY};
pub use runner::{ActionRunner, ActionSummary, ResultSink};

use crate::Result;

/// An action execution queued for the command loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Server-assigned execution id
    pub exec_id: String,

    /// Id of the action to run
    pub action_id: String,
}

/// Outcome of one action execution, waiting to be reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Execution id from the originating request
    pub exec_id: String,

    /// Exit status of the action
    pub status_code: i32,

    /// Base64 of the combined output; `None` when nothing was produced
    pub output: Option<String>,
}

impl ActionRequest {
    /// Encode for the request store
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }

    /// Decode an item from the request store
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid request
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Ok(serde_cbor::from_slice(raw)?)
    }
}

impl ActionResult {
    /// Encode for the result store
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }

    /// Decode an item from the result store
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a valid result
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Ok(serde_cbor::from_slice(raw)?)
    }
}
