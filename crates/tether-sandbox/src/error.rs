use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error thrown inside the sandbox: by module code, an entry function or a
/// failed host call. Crosses the worker boundary as JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ScriptError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} ({location})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Why an `execute` call did not complete successfully
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Compile error: {0}")]
    Compile(ScriptError),

    #[error("Runtime error: {0}")]
    Runtime(ScriptError),

    /// The worker died; it has been replaced before the next execution
    #[error("Sandbox crashed: {0}")]
    Crashed(ScriptError),

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("Executor shut down")]
    Shutdown,
}

impl ExecutionError {
    /// The sandbox-side error, when there is one
    pub fn script_error(&self) -> Option<&ScriptError> {
        match self {
            Self::Compile(e) | Self::Runtime(e) | Self::Crashed(e) => Some(e),
            Self::Timeout(_) | Self::Unavailable(_) | Self::Shutdown => None,
        }
    }
}

/// Invalid executor configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("Host capability `{0}` is registered twice")]
    DuplicateName(String),

    #[error("No script engine configured")]
    MissingEngine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    #[error("Payload of {len} bytes exceeds mailbox capacity of {capacity}")]
    TooLarge { len: usize, capacity: usize },

    /// The sandbox generation owning the mailbox was replaced
    #[error("Mailbox invalidated")]
    Invalidated,
}
