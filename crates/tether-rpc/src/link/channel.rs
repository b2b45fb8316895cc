use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::envelope::Message;
use crate::error::TransportError;
use crate::transport::{EventHub, ReconnectFuture, Transport, TransportEvent};

struct Wire {
    connected: AtomicBool,
    hubs: [EventHub; 2],
}

impl Wire {
    fn broadcast(&self, event: &TransportEvent) {
        for hub in &self.hubs {
            hub.publish(event.clone());
        }
    }
}

/// One end of an in-memory persistent channel.
///
/// Both ends share a single connection state: once opened the channel stays
/// connected until either end closes it, and either end may reopen it.
pub struct ChannelTransport {
    wire: Arc<Wire>,
    side: usize,
}

impl ChannelTransport {
    /// Create two connected ends
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let wire = Arc::new(Wire {
            connected: AtomicBool::new(true),
            hubs: [EventHub::new(), EventHub::new()],
        });
        let left = Arc::new(Self {
            wire: wire.clone(),
            side: 0,
        });
        let right = Arc::new(Self { wire, side: 1 });
        (left, right)
    }

    /// Open the channel again after a close; no-op when already open
    pub fn reopen(&self) {
        if !self.wire.connected.swap(true, Ordering::SeqCst) {
            log::debug!("Channel reopened");
            self.wire.broadcast(&TransportEvent::Opened);
        }
    }

    fn peer_hub(&self) -> &EventHub {
        &self.wire.hubs[1 - self.side]
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.peer_hub().publish(TransportEvent::Message(message));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.wire.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.wire.connected.swap(false, Ordering::SeqCst) {
            log::debug!("Channel closed");
            self.wire.broadcast(&TransportEvent::Closed);
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.wire.hubs[self.side].subscribe()
    }

    fn reconnect(&self) -> ReconnectFuture<'_> {
        Box::pin(async move {
            self.reopen();
            Ok(())
        })
    }
}
