use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumIter};

use crate::codec::CodecError;
use crate::envelope::{ErrorShape, RequestId};

/// Framework error codes shared by procedures and the runtimes
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    BadRequest,
    InternalServerError,
    NotFound,
    MethodNotSupported,
    Timeout,
    ClientClosedRequest,
}

impl ErrorCode {
    /// JSON-RPC 2.0 compatible numeric code
    pub fn json_rpc_code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::BadRequest => -32600,
            Self::InternalServerError => -32603,
            Self::NotFound => -32004,
            Self::MethodNotSupported => -32005,
            Self::Timeout => -32008,
            Self::ClientClosedRequest => -32099,
        }
    }
}

/// Error raised by a procedure or by the server runtime itself.
///
/// Both are normalized into the same [`ErrorShape`] on the wire.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    pub cause: Option<String>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalServerError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn duplicate_id(id: &RequestId) -> Self {
        Self::bad_request(format!("Duplicate id {id}"))
    }

    /// Attach request diagnostics and produce the wire shape
    pub fn into_shape(self, path: Option<&str>, input: Option<&Value>) -> ErrorShape {
        ErrorShape {
            code: self.code,
            message: self.message,
            path: path.map(str::to_owned),
            input: input.cloned(),
            cause: self.cause,
        }
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string()).with_cause(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request(format!("Invalid input: {err}"))
    }
}

/// Error types for transports
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is not connected")]
    Disconnected,

    #[error("Transport has been closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport does not support {0}")]
    Unsupported(&'static str),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Errors surfaced to callers of the client runtime and links
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The server answered with an error response
    #[error("{}: {}", .0.code, .0.message)]
    Remote(ErrorShape),

    /// A query or mutation was interrupted by the transport closing
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// The client runtime was shut down
    #[error("Client is closed")]
    Closed,

    #[error("Request id {0} is already pending")]
    DuplicateId(RequestId),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ClientError {
    /// Error code of a remote failure
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Remote(shape) => Some(shape.code),
            _ => None,
        }
    }
}
