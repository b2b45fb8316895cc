use serde_json::Value;
use tokio::sync::mpsc;

use crate::envelope::{ResponseBody, ResponseEnvelope, ResultPayload};
use crate::error::ClientError;

/// Receives the outcome of one request.
///
/// `next` is called for every response routed to the request. A request ends
/// with exactly one of `complete` or `error`.
pub trait ResponseObserver: Send + 'static {
    fn next(&mut self, response: ResponseEnvelope);

    fn error(&mut self, error: ClientError);

    fn complete(&mut self);
}

/// Event delivered through a [`ChannelObserver`]
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    Next(ResponseEnvelope),
    Error(ClientError),
    Complete,
}

/// Observer forwarding every callback into an unbounded channel
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ObserverEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ObserverEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ObserverEvent) {
        // the receiving side may already be gone
        let _ = self.tx.send(event);
    }
}

impl ResponseObserver for ChannelObserver {
    fn next(&mut self, response: ResponseEnvelope) {
        self.forward(ObserverEvent::Next(response));
    }

    fn error(&mut self, error: ClientError) {
        self.forward(ObserverEvent::Error(error));
    }

    fn complete(&mut self) {
        self.forward(ObserverEvent::Complete);
    }
}

/// Something that can stop an outstanding request
pub trait Cancel: Send + Sync {
    fn cancel(&self);
}

/// Wait for the single `data` response of a query or mutation
pub(crate) async fn first_data(
    events: &mut mpsc::UnboundedReceiver<ObserverEvent>,
) -> Result<Value, ClientError> {
    while let Some(event) = events.recv().await {
        match event {
            ObserverEvent::Next(response) => match response.body {
                ResponseBody::Result(ResultPayload::Data { data }) => return Ok(data),
                ResponseBody::Error(shape) => return Err(ClientError::Remote(shape)),
                ResponseBody::Result(other) => {
                    return Err(ClientError::UnexpectedResponse(format!("{other:?}")));
                }
            },
            ObserverEvent::Error(error) => return Err(error),
            ObserverEvent::Complete => break,
        }
    }
    Err(ClientError::Closed)
}

/// A live subscription.
///
/// Yields data values until the server stops the stream, an error arrives,
/// or the subscription is cancelled. Dropping it cancels it.
pub struct Subscription {
    canceller: Box<dyn Cancel>,
    events: mpsc::UnboundedReceiver<ObserverEvent>,
    finished: bool,
}

impl Subscription {
    pub(crate) fn new(
        canceller: Box<dyn Cancel>,
        events: mpsc::UnboundedReceiver<ObserverEvent>,
    ) -> Self {
        Self {
            canceller,
            events,
            finished: false,
        }
    }

    /// Next data value; `None` once the subscription is over
    pub async fn next(&mut self) -> Option<Result<Value, ClientError>> {
        if self.finished {
            return None;
        }

        while let Some(event) = self.events.recv().await {
            match event {
                ObserverEvent::Next(response) => {
                    if let Some(data) = response.into_data() {
                        return Some(Ok(data));
                    }
                }
                ObserverEvent::Error(error) => {
                    self.finished = true;
                    return Some(Err(error));
                }
                ObserverEvent::Complete => break,
            }
        }

        self.finished = true;
        None
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Stop the subscription
    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.canceller.cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingCancel(Arc<AtomicU32>);

    impl Cancel for CountingCancel {
        fn cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_first_data_skips_nothing() {
        let (mut observer, mut rx) = ChannelObserver::new();
        observer.next(ResponseEnvelope::data(1.into(), json!(42)));

        assert_eq!(first_data(&mut rx).await.expect("Expected data"), json!(42));
    }

    #[tokio::test]
    async fn test_first_data_complete_without_data() {
        let (mut observer, mut rx) = ChannelObserver::new();
        observer.complete();

        assert!(matches!(first_data(&mut rx).await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_subscription_yields_data_then_ends() {
        let cancels = Arc::new(AtomicU32::new(0));
        let (mut observer, rx) = ChannelObserver::new();
        let mut subscription = Subscription::new(Box::new(CountingCancel(cancels.clone())), rx);

        observer.next(ResponseEnvelope::started(1.into()));
        observer.next(ResponseEnvelope::data(1.into(), json!("a")));
        observer.next(ResponseEnvelope::stopped(1.into()));
        observer.complete();

        assert_eq!(subscription.next().await.map(Result::ok), Some(Some(json!("a"))));
        assert!(subscription.next().await.is_none());
        assert!(subscription.is_finished());

        drop(subscription);
        assert_eq!(cancels.load(Ordering::SeqCst), 0, "finished subscriptions are not cancelled");
    }

    #[tokio::test]
    async fn test_subscription_cancels_on_drop() {
        let cancels = Arc::new(AtomicU32::new(0));
        let (_observer, rx) = ChannelObserver::new();
        let subscription = Subscription::new(Box::new(CountingCancel(cancels.clone())), rx);

        drop(subscription);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }
}
