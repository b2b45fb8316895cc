//! The call context handed to sandboxed entry functions

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::error::{MailboxError, ScriptError};
use crate::mailbox::SharedMailbox;
use crate::protocol::{CapabilityNames, WorkerEvent, WorkerMessage, decode_sync_reply};

struct ContextInner {
    props: Map<String, Value>,
    sync_names: HashSet<String>,
    async_names: HashSet<String>,
    mailbox: Arc<SharedMailbox>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    next_correlation: Cell<u64>,
    pending: RefCell<HashMap<u64, oneshot::Sender<Result<Value, ScriptError>>>>,
}

/// Read-only properties plus proxies for the host capabilities.
///
/// Cheap to clone; all clones share the same pending async calls.
#[derive(Clone)]
pub struct CallContext {
    inner: Rc<ContextInner>,
}

impl CallContext {
    pub(crate) fn new(
        props: Map<String, Value>,
        capabilities: CapabilityNames,
        mailbox: Arc<SharedMailbox>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                props,
                sync_names: capabilities.sync.into_iter().collect(),
                async_names: capabilities.asynchronous.into_iter().collect(),
                mailbox,
                events,
                next_correlation: Cell::new(1),
                pending: RefCell::default(),
            }),
        }
    }

    pub fn props(&self) -> &Map<String, Value> {
        &self.inner.props
    }

    pub fn prop(&self, name: &str) -> Option<&Value> {
        self.inner.props.get(name)
    }

    pub fn has_sync(&self, name: &str) -> bool {
        self.inner.sync_names.contains(name)
    }

    pub fn has_async(&self, name: &str) -> bool {
        self.inner.async_names.contains(name)
    }

    pub fn console(&self) -> Console {
        Console {
            context: self.clone(),
        }
    }

    fn post(&self, message: &WorkerMessage) -> Result<(), ScriptError> {
        self.inner
            .events
            .send(WorkerEvent::Message(message.encode()))
            .map_err(|e| ScriptError::new(format!("Host is gone: {e}")))
    }

    /// Call a synchronous host capability, blocking this thread until the
    /// host replies. Nothing else in the sandbox runs in the meantime.
    pub fn call_sync(&self, method: &str, params: Value) -> Result<Value, ScriptError> {
        if !self.has_sync(method) {
            return Err(ScriptError::new(format!(
                "`{method}` is not a synchronous host capability"
            )));
        }

        let mailbox = &self.inner.mailbox;
        mailbox.reset();
        self.post(&WorkerMessage::CallRequest {
            method: method.to_owned(),
            params,
            correlation_id: None,
        })?;

        match mailbox.wait() {
            Ok(bytes) => decode_sync_reply(&bytes),
            Err(MailboxError::Invalidated) => {
                Err(ScriptError::new(format!("`{method}` interrupted by sandbox restart")))
            }
            Err(e) => Err(ScriptError::new(e.to_string())),
        }
    }

    /// Call an asynchronous host capability. The request is posted right
    /// away; the returned future settles when the host answers.
    pub fn call_async(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, ScriptError>> + 'static {
        let (tx, rx) = oneshot::channel();

        let posted = if self.has_async(method) {
            let correlation_id = self.inner.next_correlation.get();
            self.inner.next_correlation.set(correlation_id + 1);
            self.inner.pending.borrow_mut().insert(correlation_id, tx);

            let posted = self.post(&WorkerMessage::CallRequest {
                method: method.to_owned(),
                params,
                correlation_id: Some(correlation_id),
            });
            if posted.is_err() {
                self.inner.pending.borrow_mut().remove(&correlation_id);
            }
            posted
        } else {
            Err(ScriptError::new(format!(
                "`{method}` is not an asynchronous host capability"
            )))
        };

        async move {
            posted?;
            rx.await
                .unwrap_or_else(|_| Err(ScriptError::new("Sandbox is shutting down")))
        }
    }

    /// Settle the pending async call `correlation_id`; unknown ids are ignored
    pub(crate) fn resolve(&self, correlation_id: u64, result: Result<Value, ScriptError>) {
        let pending = self.inner.pending.borrow_mut().remove(&correlation_id);
        match pending {
            Some(tx) => {
                if tx.send(result).is_err() {
                    log::trace!("Async call {correlation_id} was abandoned");
                }
            }
            None => log::debug!("No pending async call {correlation_id}"),
        }
    }

    pub(crate) fn pending_calls(&self) -> usize {
        self.inner.pending.borrow().len()
    }
}

/// Console bridged to the host's asynchronous `log` capability
#[derive(Clone)]
pub struct Console {
    context: CallContext,
}

impl Console {
    /// Arguments are joined with tabs and terminated by a newline
    pub fn log(&self, args: &[Value]) {
        let line = format_line(args);
        let reply = self.context.call_async("log", Value::Array(vec![line.into()]));
        drop(reply);
    }

    pub fn info(&self, _args: &[Value]) {}

    pub fn warn(&self, _args: &[Value]) {}

    pub fn error(&self, _args: &[Value]) {}

    pub fn debug(&self, _args: &[Value]) {}
}

fn format_line(args: &[Value]) -> String {
    let mut line = args
        .iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\t");
    line.push('\n');
    line
}
