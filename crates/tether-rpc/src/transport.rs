//! Transport capability
//!
//! A transport moves [`Message`] values between two peers and publishes three
//! notifications: opened, message received, closed. Runtimes never talk to a
//! socket or channel directly, they only see this trait.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::envelope::Message;
use crate::error::TransportError;

/// Notification published by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    Message(Message),
    Closed,
}

pub type ReconnectFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// Bidirectional channel carrying serialized envelopes
pub trait Transport: Send + Sync + 'static {
    /// Queue a message for delivery to the peer
    fn send(&self, message: Message) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Close the transport; a `Closed` notification follows
    fn close(&self);

    /// Register for notifications. Every subscriber receives every event
    /// published after the call.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;

    /// Re-establish a dropped connection. On success an `Opened` notification
    /// is published.
    fn reconnect(&self) -> ReconnectFuture<'_> {
        Box::pin(async { Err(TransportError::Unsupported("reconnect")) })
    }
}

/// Fan-out of transport notifications to any number of subscribers
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, dropping the ones that went away
    pub fn publish(&self, event: TransportEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_hub_fans_out_and_prunes() {
        let hub = EventHub::new();
        let mut first = hub.subscribe();
        let second = hub.subscribe();
        drop(second);

        hub.publish(TransportEvent::Message(json!({"id": 1})));
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(
            first.recv().await,
            Some(TransportEvent::Message(json!({"id": 1})))
        );
    }
}
