//! Transport bindings
//!
//! Persistent channels (in-memory pair and Unix socket) attach the client and
//! server runtimes directly to a [`Transport`](crate::transport::Transport).
//! The shared-bus binding multiplexes many parties over one message bus.

pub mod bus;
pub mod channel;
#[cfg(unix)]
pub mod socket;

pub use bus::{Address, BusEndpoint, BusEvent, BusLink, BusServer, LocalBus, MessageBus};
pub use channel::ChannelTransport;
#[cfg(unix)]
pub use socket::{SocketServer, SocketTransport};
