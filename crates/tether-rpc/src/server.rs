//! Server RPC runtime
//!
//! Decodes incoming envelopes, invokes procedures from a [`Registry`] and
//! keeps the table of live subscriptions.

pub mod dispatch;
pub mod registry;
pub mod stream;

use std::sync::Arc;

use tokio::task::JoinHandle;

pub use dispatch::{Dispatcher, Responder, Scope, TransportResponder};
pub use registry::{
    ProcedureFuture, ProcedureOutput, ProcedureRegistry, Registry, RegistryBuilder, RegistryError,
};
pub use stream::{Emitter, EventStream, StreamClosed, StreamItem};

use crate::envelope::Notification;
use crate::error::TransportError;
use crate::transport::{Transport, TransportEvent};

/// Serve `registry` over a persistent transport.
///
/// Messages are handled one at a time in arrival order, so a slow
/// subscription handler delays everything queued behind it on this
/// transport (see [`Dispatcher::handle`]). When the transport closes every
/// live subscription is dropped without further responses.
/// Abort the returned handle to detach.
pub fn attach<C>(
    registry: Arc<dyn ProcedureRegistry<C>>,
    transport: Arc<dyn Transport>,
    ctx: C,
) -> JoinHandle<()>
where
    C: Clone + Send + Sync + 'static,
{
    const SCOPE: Scope = 0;

    let mut events = transport.subscribe();
    let responder: Arc<dyn Responder> = Arc::new(TransportResponder::new(transport));

    tokio::spawn(async move {
        let dispatcher = Dispatcher::new(registry);

        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message(message) => {
                    dispatcher.handle_message(SCOPE, message, &ctx, &responder).await;
                }
                TransportEvent::Closed => {
                    log::debug!(
                        "Transport closed, dropping {} subscription(s)",
                        dispatcher.active_subscriptions()
                    );
                    dispatcher.abort_scope(SCOPE);
                }
                TransportEvent::Opened => log::debug!("Transport opened"),
            }
        }
    })
}

/// Ask the client on `transport` to resume its subscriptions
pub fn notify_reconnect(transport: &dyn Transport) -> Result<(), TransportError> {
    let message = serde_json::to_value(Notification::reconnect())
        .map_err(|e| TransportError::Codec(e.to_string()))?;
    transport.send(message)
}
