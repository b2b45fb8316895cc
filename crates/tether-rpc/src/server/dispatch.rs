use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt as _;
use serde_json::Value;
use tokio::task::AbortHandle;

use super::registry::{ProcedureOutput, ProcedureRegistry};
use super::stream::{EventStream, StreamItem};
use crate::envelope::{
    Message, ProcedureKind, RequestEnvelope, RequestId, ResponseEnvelope, batch_members,
};
use crate::error::RpcError;
use crate::transport::Transport;

/// Partition of the subscription table. Ids only have to be unique within
/// one scope, e.g. one connection or one bus party.
pub type Scope = u64;

/// Where responses for one incoming message go
pub trait Responder: Send + Sync + 'static {
    fn respond(&self, response: ResponseEnvelope);

    fn is_connected(&self) -> bool;
}

/// Replies straight onto a persistent transport
pub struct TransportResponder {
    transport: Arc<dyn Transport>,
}

impl TransportResponder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl Responder for TransportResponder {
    fn respond(&self, response: ResponseEnvelope) {
        let message = match serde_json::to_value(&response) {
            Ok(message) => message,
            Err(e) => {
                log::error!("Failed to serialize response: {e}");
                return;
            }
        };
        if let Err(e) = self.transport.send(message) {
            log::debug!("Dropping response for id {:?}: {e}", response.id);
        }
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}

struct ActiveSubscription {
    serial: u64,
    abort: AbortHandle,
}

type SubscriptionTable = Arc<Mutex<HashMap<(Scope, RequestId), ActiveSubscription>>>;

fn lock_table(
    table: &SubscriptionTable,
) -> MutexGuard<'_, HashMap<(Scope, RequestId), ActiveSubscription>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Envelope dispatch shared by the persistent-channel and shared-bus servers
pub struct Dispatcher<C> {
    registry: Arc<dyn ProcedureRegistry<C>>,
    subscriptions: SubscriptionTable,
    next_serial: AtomicU64,
}

impl<C> Dispatcher<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(registry: Arc<dyn ProcedureRegistry<C>>) -> Self {
        Self {
            registry,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_serial: AtomicU64::new(0),
        }
    }

    /// Handle one message body: a single envelope or a batch
    pub async fn handle_message(
        &self,
        scope: Scope,
        message: Message,
        ctx: &C,
        responder: &Arc<dyn Responder>,
    ) {
        for member in batch_members(message) {
            match serde_json::from_value::<RequestEnvelope>(member) {
                Ok(envelope) => self.handle(scope, envelope, ctx.clone(), responder).await,
                Err(e) => {
                    log::warn!("Malformed envelope: {e}");
                    let shape = RpcError::parse_error(format!("Malformed envelope: {e}"))
                        .into_shape(None, None);
                    responder.respond(ResponseEnvelope::error(None, shape));
                }
            }
        }
    }

    /// Handle one decoded envelope.
    ///
    /// Queries and mutations run on their own task; subscription setup and
    /// stop complete before this returns, so a stop following its
    /// subscription in the same batch always finds it.
    ///
    /// The cost is head-of-line blocking: while a subscription handler is
    /// still producing its stream, later envelopes of the same connection
    /// wait, stops for other ids included. Handlers should return their
    /// stream promptly and do slow work inside the producer task.
    pub async fn handle(
        &self,
        scope: Scope,
        envelope: RequestEnvelope,
        ctx: C,
        responder: &Arc<dyn Responder>,
    ) {
        let RequestEnvelope {
            id, method, path, input, ..
        } = envelope;

        let Some(id) = id else {
            let shape = RpcError::bad_request("`id` is required")
                .into_shape(path.as_deref(), input.as_ref());
            responder.respond(ResponseEnvelope::error(None, shape));
            return;
        };

        let kind = match method.kind() {
            Some(kind) => kind,
            None => {
                self.stop(scope, &id, responder);
                return;
            }
        };

        let Some(path) = path else {
            let shape = RpcError::bad_request("`path` is required").into_shape(None, input.as_ref());
            responder.respond(ResponseEnvelope::error(Some(id), shape));
            return;
        };
        let input = input.unwrap_or(Value::Null);

        match kind {
            ProcedureKind::Query | ProcedureKind::Mutation => {
                let registry = self.registry.clone();
                let responder = responder.clone();
                tokio::spawn(async move {
                    let result = invoke_guarded(&*registry, &path, input.clone(), ctx, kind).await;
                    let response = match result {
                        Ok(ProcedureOutput::Value(data)) => ResponseEnvelope::data(id, data),
                        Ok(ProcedureOutput::Stream(_)) => {
                            let err = RpcError::internal(format!("{method} {path} returned a stream"));
                            ResponseEnvelope::error(Some(id), err.into_shape(Some(&path), Some(&input)))
                        }
                        Err(err) => {
                            log::debug!("{method} {path} failed: {err}");
                            ResponseEnvelope::error(Some(id), err.into_shape(Some(&path), Some(&input)))
                        }
                    };
                    responder.respond(response);
                });
            }
            ProcedureKind::Subscription => {
                self.subscribe(scope, id, path, input, ctx, responder).await;
            }
        }
    }

    async fn subscribe(
        &self,
        scope: Scope,
        id: RequestId,
        path: String,
        input: Value,
        ctx: C,
        responder: &Arc<dyn Responder>,
    ) {
        let output = invoke_guarded(
            &*self.registry,
            &path,
            input.clone(),
            ctx,
            ProcedureKind::Subscription,
        )
        .await;

        let stream = match output {
            Ok(ProcedureOutput::Stream(stream)) => stream,
            Ok(ProcedureOutput::Value(_)) => {
                let err = RpcError::internal(format!("Subscription {path} did not return a stream"));
                let shape = err.into_shape(Some(&path), Some(&input));
                responder.respond(ResponseEnvelope::error(Some(id), shape));
                return;
            }
            Err(err) => {
                let shape = err.into_shape(Some(&path), Some(&input));
                responder.respond(ResponseEnvelope::error(Some(id), shape));
                return;
            }
        };

        if !responder.is_connected() {
            log::debug!("Transport went away while subscription {id} was starting");
            return;
        }

        let key = (scope, id.clone());
        let mut table = lock_table(&self.subscriptions);

        if let Some(previous) = table.remove(&key) {
            log::warn!("Duplicate subscription id {id}, stopping the previous one");
            previous.abort.abort();
            responder.respond(ResponseEnvelope::stopped(id.clone()));
            let shape = RpcError::duplicate_id(&id).into_shape(Some(&path), Some(&input));
            responder.respond(ResponseEnvelope::error(Some(id), shape));
            return;
        }

        log::debug!("Subscription {id} started on {path}");
        responder.respond(ResponseEnvelope::started(id.clone()));

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let forward = Forward {
            key: key.clone(),
            serial,
            path,
            input,
            table: self.subscriptions.clone(),
            responder: responder.clone(),
        };
        let task = tokio::spawn(forward.run(stream));
        table.insert(
            key,
            ActiveSubscription {
                serial,
                abort: task.abort_handle(),
            },
        );
    }

    fn stop(&self, scope: Scope, id: &RequestId, responder: &Arc<dyn Responder>) {
        let mut table = lock_table(&self.subscriptions);
        if let Some(subscription) = table.remove(&(scope, id.clone())) {
            log::debug!("Subscription {id} stopped by client");
            subscription.abort.abort();
            responder.respond(ResponseEnvelope::stopped(id.clone()));
        }
    }

    /// Cancel every subscription in `scope` without emitting anything
    pub fn abort_scope(&self, scope: Scope) {
        let mut table = lock_table(&self.subscriptions);
        table.retain(|(s, _), subscription| {
            if *s == scope {
                subscription.abort.abort();
                false
            } else {
                true
            }
        });
    }

    pub fn abort_all(&self) {
        let mut table = lock_table(&self.subscriptions);
        for (_, subscription) in table.drain() {
            subscription.abort.abort();
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        lock_table(&self.subscriptions).len()
    }
}

impl<C> Drop for Dispatcher<C> {
    fn drop(&mut self) {
        let mut table = lock_table(&self.subscriptions);
        for (_, subscription) in table.drain() {
            subscription.abort.abort();
        }
    }
}

/// Invoke a procedure, reporting a panicking handler as an internal error
async fn invoke_guarded<C: 'static>(
    registry: &dyn ProcedureRegistry<C>,
    path: &str,
    input: Value,
    ctx: C,
    kind: ProcedureKind,
) -> Result<ProcedureOutput, RpcError> {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| {
        registry.invoke(path, input, ctx, kind)
    })) {
        Ok(future) => future,
        Err(payload) => return Err(panicked(path, &*payload)),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panicked(path, &*payload)),
    }
}

fn panicked(path: &str, payload: &(dyn Any + Send)) -> RpcError {
    let cause = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    };
    log::error!("Procedure {path} panicked: {cause}");
    RpcError::internal(format!("Procedure {path} panicked")).with_cause(cause)
}

/// Task forwarding one subscription's stream into responses
struct Forward {
    key: (Scope, RequestId),
    serial: u64,
    path: String,
    input: Value,
    table: SubscriptionTable,
    responder: Arc<dyn Responder>,
}

impl Forward {
    async fn run(self, mut stream: EventStream) {
        let id = self.key.1.clone();
        loop {
            let item = stream.next().await;

            // responses go out under the table lock so a concurrent stop
            // can never be followed by data for the same id
            let mut table = lock_table(&self.table);
            let live = table
                .get(&self.key)
                .is_some_and(|subscription| subscription.serial == self.serial);
            if !live {
                return;
            }

            match item {
                StreamItem::Next(data) => {
                    self.responder.respond(ResponseEnvelope::data(id.clone(), data));
                }
                StreamItem::Error(err) => {
                    table.remove(&self.key);
                    let shape = err.into_shape(Some(&self.path), Some(&self.input));
                    self.responder.respond(ResponseEnvelope::error(Some(id), shape));
                    return;
                }
                StreamItem::Complete => {
                    table.remove(&self.key);
                    log::debug!("Subscription {id} completed");
                    self.responder.respond(ResponseEnvelope::stopped(id));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::registry::Registry;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Recorder {
        responses: Mutex<Vec<ResponseEnvelope>>,
        disconnected: AtomicBool,
    }

    impl Recorder {
        fn take(&self) -> Vec<Value> {
            let mut responses = self.responses.lock().expect("lock");
            responses
                .drain(..)
                .map(|r| serde_json::to_value(r).expect("json"))
                .collect()
        }
    }

    impl Responder for Recorder {
        fn respond(&self, response: ResponseEnvelope) {
            self.responses.lock().expect("lock").push(response);
        }

        fn is_connected(&self) -> bool {
            !self.disconnected.load(Ordering::SeqCst)
        }
    }

    fn buggy_query() -> Result<Value, RpcError> {
        panic!("query handler bug")
    }

    fn buggy_subscription() -> Result<ProcedureOutput, RpcError> {
        panic!("subscription handler bug")
    }

    fn dispatcher() -> Dispatcher<()> {
        let registry = Registry::builder()
            .query("echo", |input, ()| async move { Ok(input) })
            .query("boom", |_, ()| async { Err(anyhow::anyhow!("exploded").into()) })
            .subscription("never", |_, ()| async {
                let (emitter, stream) = EventStream::channel(1);
                tokio::spawn(async move { emitter.closed().await });
                Ok(stream.into())
            })
            .subscription("two", |_, ()| async {
                Ok(EventStream::from_values([json!(1), json!(2)]).into())
            })
            .subscription("not_a_stream", |_, ()| async { Ok(json!(5).into()) })
            .query("panics", |_, ()| async { buggy_query() })
            .subscription("panics_too", |_, ()| async { buggy_subscription() })
            .subscription("slow_start", |_, ()| async {
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                Ok(EventStream::from_values([json!("late")]).into())
            })
            .build()
            .expect("registry");
        Dispatcher::new(Arc::new(registry))
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_echo_query() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let responder: Arc<dyn Responder> = recorder.clone();

        let message = json!({"id": 1, "method": "query", "path": "echo", "input": "hi"});
        dispatcher.handle_message(0, message, &(), &responder).await;
        settle().await;

        assert_eq!(
            recorder.take(),
            vec![json!({"id": 1, "result": {"type": "data", "data": "hi"}})]
        );
    }

    #[tokio::test]
    async fn test_bad_member_does_not_abort_batch() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let responder: Arc<dyn Responder> = recorder.clone();

        let message = json!([
            {"id": 1, "method": "bogus"},
            {"id": 2, "method": "query", "path": "echo", "input": 2}
        ]);
        dispatcher.handle_message(0, message, &(), &responder).await;
        settle().await;

        let responses = recorder.take();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[0]["error"]["code"], "PARSE_ERROR");
        assert_eq!(responses[1]["result"]["data"], 2);
    }

    #[tokio::test]
    async fn test_missing_id_is_bad_request() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let responder: Arc<dyn Responder> = recorder.clone();

        let message = json!({"method": "query", "path": "echo"});
        dispatcher.handle_message(0, message, &(), &responder).await;

        let responses = recorder.take();
        assert_eq!(responses[0]["error"]["code"], "BAD_REQUEST");
        assert_eq!(responses[0]["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_procedure_error_keeps_diagnostics() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let responder: Arc<dyn Responder> = recorder.clone();

        let message = json!({"id": 3, "method": "query", "path": "boom", "input": {"a": 1}});
        dispatcher.handle_message(0, message, &(), &responder).await;
        settle().await;

        let responses = recorder.take();
        let error = &responses[0]["error"];
        assert_eq!(error["code"], "INTERNAL_SERVER_ERROR");
        assert_eq!(error["path"], "boom");
        assert_eq!(error["input"], json!({"a": 1}));
        assert_eq!(error["cause"], "exploded");
    }

    #[tokio::test]
    async fn test_panicking_query_still_answers() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let responder: Arc<dyn Responder> = recorder.clone();

        let message = json!({"id": 4, "method": "query", "path": "panics", "input": [1]});
        dispatcher.handle_message(0, message, &(), &responder).await;
        settle().await;

        let responses = recorder.take();
        assert_eq!(responses.len(), 1, "exactly one response per query");
        assert_eq!(responses[0]["id"], 4);
        let error = &responses[0]["error"];
        assert_eq!(error["code"], "INTERNAL_SERVER_ERROR");
        assert_eq!(error["path"], "panics");
        assert_eq!(error["input"], json!([1]));
        assert_eq!(error["cause"], "query handler bug");
    }

    #[tokio::test]
    async fn test_panicking_subscription_keeps_dispatcher_alive() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let responder: Arc<dyn Responder> = recorder.clone();

        let message = json!([
            {"id": "p", "method": "subscription", "path": "panics_too"},
            {"id": 5, "method": "query", "path": "echo", "input": "after"}
        ]);
        dispatcher.handle_message(0, message, &(), &responder).await;
        settle().await;

        let responses = recorder.take();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], "p");
        assert_eq!(responses[0]["error"]["code"], "INTERNAL_SERVER_ERROR");
        assert_eq!(responses[0]["error"]["cause"], "subscription handler bug");
        assert_eq!(responses[1], json!({"id": 5, "result": {"type": "data", "data": "after"}}));
        assert_eq!(dispatcher.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_then_stop() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let responder: Arc<dyn Responder> = recorder.clone();

        let message = json!([
            {"id": "s", "method": "subscription", "path": "two"},
            {"id": "s", "method": "subscription.stop"}
        ]);
        dispatcher.handle_message(0, message, &(), &responder).await;
        settle().await;

        assert_eq!(
            recorder.take(),
            vec![
                json!({"id": "s", "result": {"type": "started"}}),
                json!({"id": "s", "result": {"type": "stopped"}}),
            ]
        );
        assert_eq!(dispatcher.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscription_setup_holds_back_later_envelopes() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let responder: Arc<dyn Responder> = recorder.clone();

        let message = json!([
            {"id": "slow", "method": "subscription", "path": "slow_start"},
            {"id": "slow", "method": "subscription.stop"},
            {"id": 6, "method": "query", "path": "echo", "input": "queued"}
        ]);
        dispatcher.handle_message(0, message, &(), &responder).await;
        settle().await;

        assert_eq!(
            recorder.take(),
            vec![
                json!({"id": "slow", "result": {"type": "started"}}),
                json!({"id": "slow", "result": {"type": "stopped"}}),
                json!({"id": 6, "result": {"type": "data", "data": "queued"}}),
            ]
        );
        assert_eq!(dispatcher.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_completed_stream_stops() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let responder: Arc<dyn Responder> = recorder.clone();

        let message = json!({"id": 9, "method": "subscription", "path": "two"});
        dispatcher.handle_message(0, message, &(), &responder).await;
        settle().await;

        let responses = recorder.take();
        let types: Vec<&str> = responses
            .iter()
            .filter_map(|r| r["result"]["type"].as_str())
            .collect();
        assert_eq!(types, ["started", "data", "data", "stopped"]);
        assert_eq!(dispatcher.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_subscription_id() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let responder: Arc<dyn Responder> = recorder.clone();

        let subscribe = json!({"id": 1, "method": "subscription", "path": "never"});
        dispatcher.handle_message(0, subscribe.clone(), &(), &responder).await;
        dispatcher.handle_message(0, subscribe, &(), &responder).await;

        let responses = recorder.take();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["result"]["type"], "started");
        assert_eq!(responses[1]["result"]["type"], "stopped");
        assert_eq!(responses[2]["error"]["code"], "BAD_REQUEST");
        assert_eq!(dispatcher.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let responder: Arc<dyn Responder> = recorder.clone();

        let subscribe = json!({"id": 1, "method": "subscription", "path": "never"});
        dispatcher.handle_message(1, subscribe.clone(), &(), &responder).await;
        dispatcher.handle_message(2, subscribe, &(), &responder).await;
        assert_eq!(dispatcher.active_subscriptions(), 2);

        dispatcher.abort_scope(1);
        assert_eq!(dispatcher.active_subscriptions(), 1);
        assert_eq!(recorder.take().len(), 2, "abort emits nothing");
    }

    #[tokio::test]
    async fn test_non_stream_subscription_is_internal_error() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let responder: Arc<dyn Responder> = recorder.clone();

        let message = json!({"id": 4, "method": "subscription", "path": "not_a_stream"});
        dispatcher.handle_message(0, message, &(), &responder).await;

        let responses = recorder.take();
        assert_eq!(responses[0]["error"]["code"], "INTERNAL_SERVER_ERROR");
        assert_eq!(dispatcher.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_disconnected_subscription_never_starts() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        recorder.disconnected.store(true, Ordering::SeqCst);
        let responder: Arc<dyn Responder> = recorder.clone();

        let message = json!({"id": 4, "method": "subscription", "path": "never"});
        dispatcher.handle_message(0, message, &(), &responder).await;

        assert!(recorder.take().is_empty());
        assert_eq!(dispatcher.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_unknown_stop_is_silent() {
        let dispatcher = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let responder: Arc<dyn Responder> = recorder.clone();

        let message = json!({"id": 77, "method": "subscription.stop"});
        dispatcher.handle_message(0, message, &(), &responder).await;
        assert!(recorder.take().is_empty());
    }
}
