//! Transport-agnostic RPC runtime
//!
//! Requests are `query`, `mutation` or `subscription` envelopes addressed to
//! a procedure path. [`client::RpcClient`] issues them over any
//! [`transport::Transport`], [`server::attach`] serves a
//! [`server::Registry`] on the other end.

pub mod client;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod link;
pub mod server;
pub mod transport;

pub use client::{RpcClient, Subscription};
pub use envelope::{Message, ProcedureKind, RequestId};
pub use error::{ClientError, ErrorCode, RpcError, TransportError};
pub use server::{Registry, attach};
pub use transport::{Transport, TransportEvent};
