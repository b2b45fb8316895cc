use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::RpcError;

/// One event produced by a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Next(Value),
    Error(RpcError),
    Complete,
}

/// Returned by [`Emitter`] once the subscription has been cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Subscription stream is closed")]
pub struct StreamClosed;

/// Producing half of an [`EventStream`]
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: mpsc::Sender<StreamItem>,
}

impl Emitter {
    /// Emit one data event. Fails once the consumer is gone, which is how a
    /// producer learns that the subscription was stopped.
    pub async fn next(&self, value: Value) -> Result<(), StreamClosed> {
        self.tx
            .send(StreamItem::Next(value))
            .await
            .map_err(|_| StreamClosed)
    }

    /// Terminate the stream with an error
    pub async fn error(self, error: RpcError) {
        let _ = self.tx.send(StreamItem::Error(error)).await;
    }

    /// Terminate the stream normally
    pub async fn complete(self) {
        let _ = self.tx.send(StreamItem::Complete).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the consumer has dropped the stream
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// Stream-like producer returned by subscription procedures.
///
/// Dropping it cancels the producer: every further emit fails with
/// [`StreamClosed`].
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamItem>,
}

impl EventStream {
    pub fn channel(buffer: usize) -> (Emitter, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Emitter { tx }, Self { rx })
    }

    /// Stream emitting `items` then completing
    pub fn from_values(items: impl IntoIterator<Item = Value>) -> Self {
        let items: Vec<Value> = items.into_iter().collect();
        let (tx, rx) = mpsc::channel(items.len() + 1);
        for item in items {
            let _ = tx.try_send(StreamItem::Next(item));
        }
        let _ = tx.try_send(StreamItem::Complete);
        Self { rx }
    }

    /// Next event. Once every emitter is dropped the stream reports
    /// [`StreamItem::Complete`].
    pub async fn next(&mut self) -> StreamItem {
        self.rx.recv().await.unwrap_or(StreamItem::Complete)
    }
}
