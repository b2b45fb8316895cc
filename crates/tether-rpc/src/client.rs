//! Client RPC runtime
//!
//! Buffers outgoing envelopes, coalesces them into batches, routes responses
//! back to their pending requests and resumes subscriptions after the
//! transport reconnects.

pub mod observer;
pub mod reconnect;
pub mod runtime;

pub use observer::{Cancel, ChannelObserver, ObserverEvent, ResponseObserver, Subscription};
pub use reconnect::{ReconnectConfig, ReconnectManager};
pub use runtime::{Operation, RequestHandle, RpcClient};
