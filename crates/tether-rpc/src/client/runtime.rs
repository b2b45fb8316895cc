use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use super::observer::{Cancel, ChannelObserver, ResponseObserver, Subscription, first_data};
use super::reconnect::ReconnectConfig;
use crate::envelope::{
    ClientIncoming, Message, Notification, ProcedureKind, RequestEnvelope, RequestId, ResponseBody,
    ResponseEnvelope, ResultPayload, batch_members,
};
use crate::error::ClientError;
use crate::transport::{Transport, TransportEvent};

/// One call issued through the client runtime
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: RequestId,
    pub kind: ProcedureKind,
    pub path: String,
    pub input: Value,
}

impl Operation {
    pub fn new(
        id: impl Into<RequestId>,
        kind: ProcedureKind,
        path: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            path: path.into(),
            input,
        }
    }

    fn envelope(&self) -> RequestEnvelope {
        RequestEnvelope::new(self.id.clone(), self.kind, self.path.clone(), self.input.clone())
    }
}

type SharedObserver = Arc<Mutex<dyn ResponseObserver>>;

struct PendingRequest {
    op: Operation,
    observer: SharedObserver,
}

#[derive(Default)]
struct ClientState {
    outgoing: Vec<RequestEnvelope>,
    pending: HashMap<RequestId, PendingRequest>,
    closed: bool,
    dispatch_scheduled: bool,
    reconnect_task: Option<JoinHandle<()>>,
}

impl ClientState {
    fn is_buffered(&self, id: &RequestId) -> bool {
        self.outgoing.iter().any(|env| env.id.as_ref() == Some(id))
    }

    /// Drop every buffered envelope carrying `id`
    fn strip_buffered(&mut self, id: &RequestId) {
        self.outgoing.retain(|env| env.id.as_ref() != Some(id));
    }

    /// Re-queue a subscription unless its envelope is still waiting to be sent
    fn resume(&mut self, id: &RequestId) -> bool {
        if self.is_buffered(id) {
            return false;
        }
        match self.pending.get(id) {
            Some(pending) => {
                self.outgoing.push(pending.op.envelope());
                true
            }
            None => false,
        }
    }
}

/// Callback invocation collected under the state lock and run after it is released
enum Delivery {
    Next(SharedObserver, ResponseEnvelope),
    Error(SharedObserver, ClientError),
    Complete(SharedObserver),
}

impl Delivery {
    fn run(self) {
        match self {
            Self::Next(observer, response) => lock_observer(&observer).next(response),
            Self::Error(observer, error) => lock_observer(&observer).error(error),
            Self::Complete(observer) => lock_observer(&observer).complete(),
        }
    }
}

fn lock_observer(observer: &SharedObserver) -> MutexGuard<'_, dyn ResponseObserver> {
    observer.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ClientShared {
    transport: Arc<dyn Transport>,
    state: Mutex<ClientState>,
    next_id: AtomicI64,
    reconnect: Option<ReconnectConfig>,
    /// Wakes the driver to flush `outgoing`
    dispatch: Arc<Notify>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ClientShared {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send buffered envelopes once the current turn has finished.
    ///
    /// The flush runs on the driver task, which shares the caller's thread,
    /// so it cannot start before the caller yields.
    fn schedule_dispatch(&self) {
        {
            let mut state = self.state();
            if state.dispatch_scheduled || state.outgoing.is_empty() {
                return;
            }
            if !self.transport.is_connected() {
                // flushed by the next `Opened` notification
                return;
            }
            state.dispatch_scheduled = true;
        }
        self.dispatch.notify_one();
    }

    fn flush(&self) {
        let batch = {
            let mut state = self.state();
            state.dispatch_scheduled = false;
            if state.outgoing.is_empty() || !self.transport.is_connected() {
                return;
            }
            std::mem::take(&mut state.outgoing)
        };

        let message = match encode_batch(&batch) {
            Ok(message) => message,
            Err(e) => {
                log::error!("Failed to serialize {} outgoing envelope(s): {e}", batch.len());
                return;
            }
        };

        log::trace!("Sending {} envelope(s)", batch.len());
        if let Err(e) = self.transport.send(message) {
            log::warn!("Send failed, keeping {} envelope(s) buffered: {e}", batch.len());
            let mut state = self.state();
            let newer = std::mem::replace(&mut state.outgoing, batch);
            state.outgoing.extend(newer);
        }
    }

    fn cancel(&self, id: &RequestId) {
        let observer = {
            let mut state = self.state();
            let Some(pending) = state.pending.remove(id) else {
                return;
            };
            state.strip_buffered(id);

            if pending.op.kind == ProcedureKind::Subscription && self.transport.is_connected() {
                log::debug!("Stopping subscription {id}");
                state.outgoing.push(RequestEnvelope::stop(id.clone()));
            }
            pending.observer
        };

        Delivery::Complete(observer).run();
        self.schedule_dispatch();
    }

    fn on_message(self: &Arc<Self>, message: Message) {
        let mut deliveries = Vec::new();
        let mut resumed = false;

        {
            let mut state = self.state();
            for member in batch_members(message) {
                match serde_json::from_value::<ClientIncoming>(member) {
                    Ok(ClientIncoming::Notification(notification)) => {
                        resumed |= Self::handle_notification(&mut state, &notification);
                    }
                    Ok(ClientIncoming::Response(response)) => {
                        Self::handle_response(&mut state, response, &mut deliveries);
                    }
                    Err(e) => log::warn!("Discarding undecodable message: {e}"),
                }
            }
        }

        for delivery in deliveries {
            delivery.run();
        }
        if resumed {
            self.schedule_dispatch();
        }
    }

    fn handle_notification(state: &mut ClientState, notification: &Notification) -> bool {
        if notification.method != Notification::RECONNECT {
            log::debug!("Ignoring notification {:?}", notification.method);
            return false;
        }

        let subscriptions: Vec<RequestId> = state
            .pending
            .iter()
            .filter(|(_, pending)| pending.op.kind == ProcedureKind::Subscription)
            .map(|(id, _)| id.clone())
            .collect();

        log::info!("Server requested reconnect, resuming {} subscription(s)", subscriptions.len());
        let mut resumed = false;
        for id in &subscriptions {
            resumed |= state.resume(id);
        }
        resumed
    }

    fn handle_response(
        state: &mut ClientState,
        response: ResponseEnvelope,
        deliveries: &mut Vec<Delivery>,
    ) {
        let Some(id) = response.id.clone() else {
            log::warn!("Discarding response without id: {:?}", response.body);
            return;
        };
        let Some(kind) = state.pending.get(&id).map(|pending| pending.op.kind) else {
            log::debug!("Discarding response for unknown id {id}");
            return;
        };

        let finished = match &response.body {
            ResponseBody::Error(shape) => {
                if let Some(pending) = state.pending.remove(&id) {
                    deliveries.push(Delivery::Error(
                        pending.observer,
                        ClientError::Remote(shape.clone()),
                    ));
                }
                return;
            }
            ResponseBody::Result(ResultPayload::Stopped) => true,
            ResponseBody::Result(ResultPayload::Data { .. }) => kind != ProcedureKind::Subscription,
            ResponseBody::Result(ResultPayload::Started) => false,
        };

        if finished {
            if let Some(pending) = state.pending.remove(&id) {
                deliveries.push(Delivery::Next(pending.observer.clone(), response));
                deliveries.push(Delivery::Complete(pending.observer));
            }
        } else if let Some(pending) = state.pending.get(&id) {
            deliveries.push(Delivery::Next(pending.observer.clone(), response));
        }
    }

    fn on_opened(self: &Arc<Self>) {
        log::debug!("Transport opened");
        self.schedule_dispatch();
    }

    fn on_closed(self: &Arc<Self>) {
        let mut deliveries = Vec::new();
        let reconnect = {
            let mut state = self.state();

            if state.closed {
                for (_, pending) in state.pending.drain() {
                    deliveries.push(Delivery::Complete(pending.observer));
                }
                false
            } else {
                let interrupted: Vec<RequestId> = state
                    .pending
                    .iter()
                    .filter(|(_, pending)| pending.op.kind != ProcedureKind::Subscription)
                    .map(|(id, _)| id.clone())
                    .collect();

                for id in &interrupted {
                    state.strip_buffered(id);
                    if let Some(pending) = state.pending.remove(id) {
                        deliveries.push(Delivery::Error(
                            pending.observer,
                            ClientError::TransportClosed("Connection closed prematurely".into()),
                        ));
                    }
                }

                let subscriptions: Vec<RequestId> = state.pending.keys().cloned().collect();
                for id in &subscriptions {
                    state.resume(id);
                }

                log::info!(
                    "Transport closed: {} request(s) failed, {} subscription(s) will resume",
                    interrupted.len(),
                    subscriptions.len()
                );
                self.reconnect.as_ref().is_some_and(|config| config.enabled)
                    && state.reconnect_task.as_ref().is_none_or(JoinHandle::is_finished)
            }
        };

        for delivery in deliveries {
            delivery.run();
        }

        if reconnect {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let Some(config) = self.reconnect.clone() else {
            return;
        };
        let transport = self.transport.clone();
        let task = spawn_local_to_client(async move {
            let manager = config.create_manager();
            if let Err(e) = manager.reconnect_loop(|| transport.reconnect()).await {
                log::error!("Giving up on reconnect: {e:#}");
            }
        });
        self.state().reconnect_task = Some(task);
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        let driver = self.driver.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(driver) = driver.take() {
            driver.abort();
        }
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = state.reconnect_task.take() {
            task.abort();
        }
    }
}

fn encode_batch(batch: &[RequestEnvelope]) -> serde_json::Result<Message> {
    match batch {
        [single] => serde_json::to_value(single),
        many => serde_json::to_value(many),
    }
}

/// Spawn a client task on the caller's thread: plain `spawn` on a
/// current-thread runtime, `spawn_local` into the caller's `LocalSet` otherwise
fn spawn_local_to_client<F>(task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if Handle::current().runtime_flavor() == RuntimeFlavor::CurrentThread {
        tokio::spawn(task)
    } else {
        tokio::task::spawn_local(task)
    }
}

async fn drive(
    shared: Weak<ClientShared>,
    dispatch: Arc<Notify>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                match event {
                    TransportEvent::Opened => shared.on_opened(),
                    TransportEvent::Message(message) => shared.on_message(message),
                    TransportEvent::Closed => shared.on_closed(),
                }
            }
            () = dispatch.notified() => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.flush();
            }
        }
    }
}

/// Handle returned by [`RpcClient::request`]
pub struct RequestHandle {
    shared: Weak<ClientShared>,
    id: RequestId,
}

impl RequestHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

impl Cancel for RequestHandle {
    /// Remove the pending request, stopping it on the server if it is a
    /// subscription
    fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.cancel(&self.id);
        }
    }
}

/// Client RPC runtime bound to one transport.
///
/// Requests issued in the same turn are coalesced into one send. The runtime
/// is single-threaded: create it on a current-thread tokio runtime, or inside
/// a [`LocalSet`](tokio::task::LocalSet) on a multi-thread one, and issue
/// requests from that thread.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<ClientShared>,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::start(transport, None)
    }

    /// Create a client that drives `transport.reconnect()` with backoff
    /// whenever the transport closes unexpectedly
    pub fn with_reconnect(transport: Arc<dyn Transport>, config: ReconnectConfig) -> Self {
        Self::start(transport, Some(config))
    }

    fn start(transport: Arc<dyn Transport>, reconnect: Option<ReconnectConfig>) -> Self {
        let events = transport.subscribe();
        let dispatch = Arc::new(Notify::new());
        let shared = Arc::new(ClientShared {
            transport,
            state: Mutex::new(ClientState::default()),
            next_id: AtomicI64::new(1),
            reconnect,
            dispatch: dispatch.clone(),
            driver: Mutex::new(None),
        });

        let driver = spawn_local_to_client(drive(Arc::downgrade(&shared), dispatch, events));
        *shared.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(driver);

        Self { shared }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    /// Next auto-generated request id
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Issue `op`, routing every response for its id to `observer`
    pub fn request<O>(&self, op: Operation, observer: O) -> Result<RequestHandle, ClientError>
    where
        O: ResponseObserver,
    {
        let id = op.id.clone();
        {
            let mut state = self.shared.state();
            if state.closed {
                return Err(ClientError::Closed);
            }
            if state.pending.contains_key(&id) {
                log::warn!("Rejecting request with pending id {id}");
                return Err(ClientError::DuplicateId(id));
            }

            log::debug!("Request {id}: {} {}", op.kind, op.path);
            state.outgoing.push(op.envelope());
            let observer: SharedObserver = Arc::new(Mutex::new(observer));
            state.pending.insert(id.clone(), PendingRequest { op, observer });
        }

        self.shared.schedule_dispatch();

        Ok(RequestHandle {
            shared: Arc::downgrade(&self.shared),
            id,
        })
    }

    /// Cancel the pending request `id`
    pub fn cancel(&self, id: &RequestId) {
        self.shared.cancel(id);
    }

    pub async fn query(&self, path: &str, input: Value) -> Result<Value, ClientError> {
        self.call(ProcedureKind::Query, path, input).await
    }

    pub async fn mutation(&self, path: &str, input: Value) -> Result<Value, ClientError> {
        self.call(ProcedureKind::Mutation, path, input).await
    }

    async fn call(&self, kind: ProcedureKind, path: &str, input: Value) -> Result<Value, ClientError> {
        let (observer, mut events) = ChannelObserver::new();
        let op = Operation::new(self.next_id(), kind, path, input);
        let handle = self.request(op, observer)?;

        let result = first_data(&mut events).await;
        if result.is_err() {
            // no-op when the entry is already gone
            handle.cancel();
        }
        result
    }

    pub fn subscribe(&self, path: &str, input: Value) -> Result<Subscription, ClientError> {
        let (observer, events) = ChannelObserver::new();
        let op = Operation::new(self.next_id(), ProcedureKind::Subscription, path, input);
        let handle = self.request(op, observer)?;
        Ok(Subscription::new(Box::new(handle), events))
    }

    /// Number of requests still awaiting completion
    pub fn pending_count(&self) -> usize {
        self.shared.state().pending.len()
    }

    /// Shut the runtime down.
    ///
    /// Active subscriptions are completed, later requests fail with
    /// [`ClientError::Closed`] and any reconnect attempt is abandoned.
    pub fn close(&self) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.shared.state();
            if state.closed {
                return;
            }
            state.closed = true;

            let subscriptions: Vec<RequestId> = state
                .pending
                .iter()
                .filter(|(_, pending)| pending.op.kind == ProcedureKind::Subscription)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &subscriptions {
                state.strip_buffered(id);
                if let Some(pending) = state.pending.remove(id) {
                    deliveries.push(Delivery::Complete(pending.observer));
                }
            }

            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
        }
        log::info!("Client closed");

        for delivery in deliveries {
            delivery.run();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }
}
