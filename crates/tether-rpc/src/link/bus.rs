//! Shared-bus binding
//!
//! Many unrelated parties share one message bus. Every envelope travels
//! wrapped as `{"tether": envelope}`; anything else on the bus is ignored.
//! Clients register one listener per operation and match responses strictly
//! by id, servers answer through a delivery function that receives the
//! triggering event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::observer::{
    Cancel, ChannelObserver, ResponseObserver, Subscription, first_data,
};
use crate::client::runtime::Operation;
use crate::envelope::{
    ProcedureKind, RequestEnvelope, RequestId, ResponseBody, ResponseEnvelope, ResultPayload,
};
use crate::error::{ClientError, TransportError};
use crate::server::{Dispatcher, ProcedureRegistry, Responder};

/// Field every bus envelope is wrapped under
pub const MARKER: &str = "tether";

/// The only protocol version tag accepted besides an absent one
pub const PROTOCOL_VERSION: &str = "2.0";

pub type PartyId = u64;

pub type ListenerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    Broadcast,
    Party(PartyId),
}

/// One message observed on the bus
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    pub origin: PartyId,
    pub target: Address,
    pub data: Value,
}

pub type Listener = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// A message bus as seen by one party.
///
/// `add_listener` returns a token and `remove_listener` takes that token, so
/// removal never depends on closure identity.
pub trait MessageBus: Send + Sync + 'static {
    fn party(&self) -> PartyId;

    fn post(&self, to: Address, data: Value);

    fn add_listener(&self, listener: Listener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

#[derive(Default)]
struct BusState {
    listeners: HashMap<ListenerId, (PartyId, Listener)>,
    next_listener: ListenerId,
    next_party: PartyId,
}

/// In-process bus delivering messages synchronously to listeners
#[derive(Default)]
pub struct LocalBus {
    state: Mutex<BusState>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the bus as a new party
    pub fn endpoint(self: &Arc<Self>) -> Arc<BusEndpoint> {
        let mut state = self.state();
        state.next_party += 1;
        Arc::new(BusEndpoint {
            bus: self.clone(),
            party: state.next_party,
        })
    }

    fn deliver(&self, event: &BusEvent) {
        let listeners: Vec<Listener> = self
            .state()
            .listeners
            .values()
            .filter(|(party, _)| match event.target {
                Address::Broadcast => *party != event.origin,
                Address::Party(target) => *party == target,
            })
            .map(|(_, listener)| listener.clone())
            .collect();

        // listeners may add or remove listeners themselves
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }
}

/// One party's handle on a [`LocalBus`]
pub struct BusEndpoint {
    bus: Arc<LocalBus>,
    party: PartyId,
}

impl MessageBus for BusEndpoint {
    fn party(&self) -> PartyId {
        self.party
    }

    fn post(&self, to: Address, data: Value) {
        self.bus.deliver(&BusEvent {
            origin: self.party,
            target: to,
            data,
        });
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        let mut state = self.bus.state();
        state.next_listener += 1;
        let id = state.next_listener;
        state.listeners.insert(id, (self.party, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.bus.state().listeners.remove(&id);
    }
}

/// Inner envelope of a bus message, if it passes the marker, id-type and
/// version checks
fn unwrap_envelope(data: &Value) -> Option<&Map<String, Value>> {
    let inner = data.get(MARKER)?.as_object()?;

    match inner.get("id") {
        Some(Value::Number(_) | Value::String(_)) => {}
        _ => return None,
    }

    match inner.get("jsonrpc") {
        None | Some(Value::Null) => {}
        Some(Value::String(version)) if version == PROTOCOL_VERSION => {}
        Some(_) => return None,
    }

    Some(inner)
}

fn wrap(envelope: Value) -> Value {
    let mut message = Map::new();
    message.insert(MARKER.to_owned(), envelope);
    Value::Object(message)
}

/// Delivers one server response; the second argument is the event that
/// carried the request
pub type Deliver = Arc<dyn Fn(Value, &BusEvent) + Send + Sync>;

struct BusResponder {
    deliver: Deliver,
    event: BusEvent,
    jsonrpc: Option<String>,
}

impl Responder for BusResponder {
    fn respond(&self, mut response: ResponseEnvelope) {
        response.jsonrpc = self.jsonrpc.clone();
        match serde_json::to_value(&response) {
            Ok(envelope) => (self.deliver)(wrap(envelope), &self.event),
            Err(e) => log::error!("Failed to serialize bus response: {e}"),
        }
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// Server side of the shared-bus binding
pub struct BusServer {
    bus: Arc<dyn MessageBus>,
    listener: ListenerId,
    task: JoinHandle<()>,
}

impl BusServer {
    /// Serve `registry` to every party on `bus`. Subscription ids are scoped
    /// per originating party.
    pub fn start<C>(
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn ProcedureRegistry<C>>,
        ctx: C,
        deliver: Deliver,
    ) -> Self
    where
        C: Clone + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<BusEvent>();
        let listener = bus.add_listener(Arc::new(move |event: &BusEvent| {
            if unwrap_envelope(&event.data).is_some() {
                let _ = tx.send(event.clone());
            }
        }));

        let task = tokio::spawn(async move {
            let dispatcher = Dispatcher::new(registry);
            while let Some(event) = rx.recv().await {
                let Some(envelope) = Self::decode_request(&event) else {
                    continue;
                };
                let scope = event.origin;
                let responder: Arc<dyn Responder> = Arc::new(BusResponder {
                    deliver: deliver.clone(),
                    jsonrpc: envelope.jsonrpc.clone(),
                    event,
                });
                dispatcher.handle(scope, envelope, ctx.clone(), &responder).await;
            }
        });

        Self {
            bus,
            listener,
            task,
        }
    }

    /// Delivery function answering the party that sent the request
    pub fn reply_to_origin(bus: Arc<dyn MessageBus>) -> Deliver {
        Arc::new(move |message: Value, event: &BusEvent| {
            bus.post(Address::Party(event.origin), message);
        })
    }

    fn decode_request(event: &BusEvent) -> Option<RequestEnvelope> {
        let inner = unwrap_envelope(&event.data)?;
        let envelope: RequestEnvelope =
            match serde_json::from_value(Value::Object(inner.clone())) {
                Ok(envelope) => envelope,
                Err(e) => {
                    log::trace!("Ignoring bus message from party {}: {e}", event.origin);
                    return None;
                }
            };
        if envelope.method.kind().is_some() && envelope.path.is_none() {
            return None;
        }
        Some(envelope)
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        self.bus.remove_listener(self.listener);
        self.task.abort();
    }
}

struct CallState {
    observer: Box<dyn ResponseObserver>,
    finished: bool,
    listener: Option<ListenerId>,
}

/// One outstanding operation on a [`BusLink`]
pub struct BusCall {
    bus: Arc<dyn MessageBus>,
    target: Address,
    id: RequestId,
    kind: ProcedureKind,
    state: Arc<Mutex<CallState>>,
}

impl BusCall {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        lock_call(&self.state).finished
    }
}

impl Cancel for BusCall {
    fn cancel(&self) {
        let (running, listener) = {
            let mut state = lock_call(&self.state);
            let running = !state.finished;
            state.finished = true;
            if running {
                state.observer.complete();
            }
            (running, state.listener.take())
        };

        if running && self.kind == ProcedureKind::Subscription {
            match serde_json::to_value(RequestEnvelope::stop(self.id.clone())) {
                Ok(stop) => self.bus.post(self.target, wrap(stop)),
                Err(e) => log::error!("Failed to serialize stop envelope: {e}"),
            }
        }
        if let Some(listener) = listener {
            self.bus.remove_listener(listener);
        }
    }
}

fn lock_call(state: &Mutex<CallState>) -> MutexGuard<'_, CallState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client side of the shared-bus binding
pub struct BusLink {
    bus: Arc<dyn MessageBus>,
    target: Address,
    next_id: AtomicI64,
}

impl BusLink {
    /// Link sending requests to `target`
    pub fn new(bus: Arc<dyn MessageBus>, target: Address) -> Self {
        Self {
            bus,
            target,
            next_id: AtomicI64::new(1),
        }
    }

    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Post `op` and route every matching response to `observer` until the
    /// call finishes or is cancelled
    pub fn request<O>(&self, op: Operation, observer: O) -> Result<BusCall, ClientError>
    where
        O: ResponseObserver,
    {
        let envelope = RequestEnvelope::new(op.id.clone(), op.kind, op.path, op.input);
        let request = serde_json::to_value(&envelope)
            .map_err(|e| TransportError::Codec(e.to_string()))?;

        let state = Arc::new(Mutex::new(CallState {
            observer: Box::new(observer),
            finished: false,
            listener: None,
        }));

        let listener = self.bus.add_listener(Self::listener(
            Arc::downgrade(&self.bus),
            op.id.clone(),
            op.kind,
            state.clone(),
        ));
        lock_call(&state).listener = Some(listener);

        log::debug!("Bus request {}: {} {:?}", op.id, op.kind, envelope.path);
        self.bus.post(self.target, wrap(request));

        Ok(BusCall {
            bus: self.bus.clone(),
            target: self.target,
            id: op.id,
            kind: op.kind,
            state,
        })
    }

    fn listener(
        bus: std::sync::Weak<dyn MessageBus>,
        id: RequestId,
        kind: ProcedureKind,
        state: Arc<Mutex<CallState>>,
    ) -> Listener {
        Arc::new(move |event: &BusEvent| {
            let Some(inner) = unwrap_envelope(&event.data) else {
                return;
            };
            let matches = inner
                .get("id")
                .and_then(|raw| serde_json::from_value::<RequestId>(raw.clone()).ok())
                .is_some_and(|incoming| incoming == id);
            if !matches {
                return;
            }
            let Ok(response) = serde_json::from_value::<ResponseEnvelope>(Value::Object(inner.clone()))
            else {
                return;
            };

            let finished_listener = {
                let mut call = lock_call(&state);
                if call.finished {
                    return;
                }

                let terminal = match &response.body {
                    ResponseBody::Error(shape) => {
                        let error = ClientError::Remote(shape.clone());
                        call.finished = true;
                        call.observer.error(error);
                        None
                    }
                    ResponseBody::Result(ResultPayload::Stopped) => Some(response),
                    ResponseBody::Result(ResultPayload::Data { .. })
                        if kind != ProcedureKind::Subscription =>
                    {
                        Some(response)
                    }
                    ResponseBody::Result(_) => {
                        call.observer.next(response);
                        return;
                    }
                };

                if let Some(response) = terminal {
                    call.finished = true;
                    call.observer.next(response);
                    call.observer.complete();
                }
                call.listener.take()
            };

            if let (Some(listener), Some(bus)) = (finished_listener, bus.upgrade()) {
                bus.remove_listener(listener);
            }
        })
    }

    pub async fn query(&self, path: &str, input: Value) -> Result<Value, ClientError> {
        self.call(ProcedureKind::Query, path, input).await
    }

    pub async fn mutation(&self, path: &str, input: Value) -> Result<Value, ClientError> {
        self.call(ProcedureKind::Mutation, path, input).await
    }

    async fn call(&self, kind: ProcedureKind, path: &str, input: Value) -> Result<Value, ClientError> {
        let (observer, mut events) = ChannelObserver::new();
        let call = self.request(Operation::new(self.next_id(), kind, path, input), observer)?;
        let result = first_data(&mut events).await;
        call.cancel();
        result
    }

    pub fn subscribe(&self, path: &str, input: Value) -> Result<Subscription, ClientError> {
        let (observer, events) = ChannelObserver::new();
        let op = Operation::new(self.next_id(), ProcedureKind::Subscription, path, input);
        let call = self.request(op, observer)?;
        Ok(Subscription::new(Box::new(call), events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{EventStream, Registry};
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> Arc<Registry<()>> {
        let registry = Registry::builder()
            .query("echo", |input, ()| async move { Ok(input) })
            .subscription("ticks", |_, ()| async {
                let (emitter, stream) = EventStream::channel(4);
                tokio::spawn(async move {
                    let mut n = 0;
                    while emitter.next(json!(n)).await.is_ok() {
                        n += 1;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                });
                Ok(stream.into())
            })
            .build()
            .expect("registry");
        Arc::new(registry)
    }

    fn serve(bus: &Arc<LocalBus>) -> (BusServer, PartyId) {
        let endpoint: Arc<dyn MessageBus> = bus.endpoint();
        let party = endpoint.party();
        let deliver = BusServer::reply_to_origin(endpoint.clone());
        (BusServer::start(endpoint, registry(), (), deliver), party)
    }

    #[test]
    fn test_unwrap_envelope_filters() {
        assert!(unwrap_envelope(&json!({"other": {"id": 1}})).is_none());
        assert!(unwrap_envelope(&json!({"tether": {"id": true}})).is_none());
        assert!(unwrap_envelope(&json!({"tether": {"id": 1, "jsonrpc": "1.0"}})).is_none());
        assert!(unwrap_envelope(&json!({"tether": {"id": 1, "jsonrpc": "2.0"}})).is_some());
        assert!(unwrap_envelope(&json!({"tether": {"id": "a"}})).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_clients_multiplex() {
        let bus = LocalBus::new();
        let (_server, server_party) = serve(&bus);

        let first = BusLink::new(bus.endpoint(), Address::Party(server_party));
        let second = BusLink::new(bus.endpoint(), Address::Party(server_party));

        // both links start their ids at 1
        let (a, b) = tokio::join!(
            first.query("echo", json!("first")),
            second.query("echo", json!("second"))
        );
        assert_eq!(a.expect("first"), json!("first"));
        assert_eq!(b.expect("second"), json!("second"));
        assert_eq!(bus.listener_count(), 1, "finished calls remove their listener");
    }

    #[tokio::test]
    async fn test_subscription_cancel_sends_stop() {
        let bus = LocalBus::new();
        let (_server, _) = serve(&bus);

        let observer_bus = bus.endpoint();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            observer_bus.add_listener(Arc::new(move |event: &BusEvent| {
                seen.lock().expect("lock").push(event.data.clone());
            }));
        }

        let link = BusLink::new(bus.endpoint(), Address::Broadcast);
        let mut subscription = link.subscribe("ticks", json!(null)).expect("subscribe");
        assert_eq!(subscription.next().await.map(Result::ok), Some(Some(json!(0))));
        subscription.cancel();

        let stop = json!({"tether": {"id": 1, "method": "subscription.stop"}});
        assert!(seen.lock().expect("lock").contains(&stop));
        // the server keeps its listener, the spy keeps its own
        assert_eq!(bus.listener_count(), 2);
    }

    #[tokio::test]
    async fn test_version_tag_is_echoed() {
        let bus = LocalBus::new();
        let (_server, server_party) = serve(&bus);

        let client = bus.endpoint();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.add_listener(Arc::new(move |event: &BusEvent| {
            let _ = tx.send(event.data.clone());
        }));

        client.post(
            Address::Party(server_party),
            json!({"tether": {"id": 5, "jsonrpc": "2.0", "method": "query", "path": "echo", "input": 1}}),
        );
        client.post(
            Address::Party(server_party),
            json!({"tether": {"id": 6, "jsonrpc": "3.0", "method": "query", "path": "echo", "input": 1}}),
        );

        assert_eq!(
            rx.recv().await,
            Some(json!({"tether": {"id": 5, "jsonrpc": "2.0", "result": {"type": "data", "data": 1}}}))
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "wrong version is ignored");
    }
}
