//! Messages exchanged between the executor and a sandbox worker

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ScriptError;
use crate::mailbox::SharedMailbox;

/// Names of the host capabilities, split by calling convention
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityNames {
    pub sync: Vec<String>,
    pub asynchronous: Vec<String>,
}

/// Host to sandbox. Delivered in-process, so the mailbox travels by handle.
pub enum HostMessage {
    Init {
        mailbox: Arc<SharedMailbox>,
        props: Map<String, Value>,
        capabilities: CapabilityNames,
    },
    /// `code: None` runs the module already cached under `filename`
    Execute {
        seq: u64,
        code: Option<String>,
        filename: String,
        run: bool,
    },
    AsyncCallResult {
        correlation_id: u64,
        result: Result<Value, ScriptError>,
    },
}

/// Sandbox to host. Serialized to JSON bytes on the worker side; anything
/// the host fails to decode forces a restart.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    ExecutionResult {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ScriptError>,
    },
    CallRequest {
        method: String,
        params: Value,
        /// Present for the asynchronous convention only
        #[serde(
            rename = "correlationId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        correlation_id: Option<u64>,
    },
}

impl WorkerMessage {
    pub fn encode(&self) -> Vec<u8> {
        // enum of plain data, serialization cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// What the worker thread reports to the executor
#[derive(Debug)]
pub enum WorkerEvent {
    Message(Vec<u8>),
    /// Uncaught failure; the worker must be replaced
    Crashed(ScriptError),
}

/// Response written into the mailbox for a synchronous call
pub type SyncReply = (Option<ScriptError>, Value);

pub fn encode_sync_reply(result: Result<Value, ScriptError>) -> Vec<u8> {
    let reply: SyncReply = match result {
        Ok(value) => (None, value),
        Err(e) => (Some(e), Value::Null),
    };
    serde_json::to_vec(&reply).unwrap_or_default()
}

pub fn decode_sync_reply(bytes: &[u8]) -> Result<Value, ScriptError> {
    let (error, result): SyncReply = serde_json::from_slice(bytes)
        .map_err(|e| ScriptError::new(format!("Malformed host response: {e}")))?;
    match error {
        Some(e) => Err(e),
        None => Ok(result),
    }
}
