//! The sandbox side: one OS thread per generation running a single-threaded
//! runtime. Executions and async host-call results are processed as they
//! arrive; a synchronous host call blocks the whole thread.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Once;
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tokio::task::LocalSet;

use crate::context::CallContext;
use crate::engine::{EngineFactory, Module, ModuleScope, ScriptEngine};
use crate::error::ScriptError;
use crate::protocol::{HostMessage, WorkerEvent, WorkerMessage};

thread_local! {
    static IN_SANDBOX: Cell<bool> = const { Cell::new(false) };
    static PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Panics on sandbox threads are reported as crashes, so record where they
/// happened and keep them off stderr. Other threads keep the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if IN_SANDBOX.get() {
                let location = info
                    .location()
                    .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
                PANIC_LOCATION.set(location);
            } else {
                previous(info);
            }
        }));
    });
}

fn crash_report(payload: &(dyn Any + Send)) -> ScriptError {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Sandbox panicked".to_owned()
    };

    let error = ScriptError::new(message);
    match PANIC_LOCATION.take() {
        Some(location) => error.at(location),
        None => error,
    }
}

pub(crate) fn spawn(
    generation: u64,
    engine: EngineFactory,
    inbox: mpsc::UnboundedReceiver<HostMessage>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("sandbox-{generation}"))
        .spawn(move || run(&engine, inbox, events))
}

fn run(
    engine: &EngineFactory,
    inbox: mpsc::UnboundedReceiver<HostMessage>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    install_panic_hook();
    IN_SANDBOX.set(true);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let error = ScriptError::new(format!("Failed to start sandbox runtime: {e}"));
            if events.send(WorkerEvent::Crashed(error)).is_err() {
                log::debug!("Executor gone before sandbox start");
            }
            return;
        }
    };

    let worker = Rc::new(Worker {
        engine: RefCell::new(engine()),
        modules: RefCell::default(),
        context: RefCell::new(None),
        events,
    });
    LocalSet::new().block_on(&runtime, worker.serve(inbox));
    log::debug!("Sandbox thread finished");
}

struct Worker {
    engine: RefCell<Box<dyn ScriptEngine>>,
    modules: RefCell<HashMap<String, Module>>,
    context: RefCell<Option<CallContext>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Worker {
    async fn serve(self: Rc<Self>, mut inbox: mpsc::UnboundedReceiver<HostMessage>) {
        while let Some(message) = inbox.recv().await {
            match message {
                HostMessage::Init {
                    mailbox,
                    props,
                    capabilities,
                } => {
                    log::debug!(
                        "Sandbox initialised with {} sync and {} async capabilities",
                        capabilities.sync.len(),
                        capabilities.asynchronous.len()
                    );
                    let context = CallContext::new(props, capabilities, mailbox, self.events.clone());
                    *self.context.borrow_mut() = Some(context);
                }
                HostMessage::Execute {
                    seq,
                    code,
                    filename,
                    run,
                } => {
                    tokio::task::spawn_local(self.clone().execute(seq, code, filename, run));
                }
                HostMessage::AsyncCallResult {
                    correlation_id,
                    result,
                } => match self.context() {
                    Some(context) => context.resolve(correlation_id, result),
                    None => log::warn!("Async call result before init"),
                },
            }
        }
    }

    fn context(&self) -> Option<CallContext> {
        self.context.borrow().clone()
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Executor gone, dropping sandbox event");
        }
    }

    /// Runs the module in its own task so a panic ends only that task and is
    /// reported as a crash.
    async fn execute(self: Rc<Self>, seq: u64, code: Option<String>, filename: String, run: bool) {
        let task = tokio::task::spawn_local(self.clone().evaluate_and_run(code, filename, run));

        match task.await {
            Ok(result) => {
                let message = WorkerMessage::ExecutionResult {
                    seq,
                    error: result.err(),
                };
                self.emit(WorkerEvent::Message(message.encode()));
            }
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                self.emit(WorkerEvent::Crashed(crash_report(payload.as_ref())));
            }
            Err(_) => log::debug!("Execution {seq} cancelled"),
        }
    }

    async fn evaluate_and_run(
        self: Rc<Self>,
        code: Option<String>,
        filename: String,
        run: bool,
    ) -> Result<(), ScriptError> {
        let context = self
            .context()
            .ok_or_else(|| ScriptError::new("Sandbox is not initialised"))?;

        let module = match code {
            Some(code) => {
                let scope = ModuleScope::new(&filename, context.console());
                let module = self.engine.borrow_mut().evaluate(&code, &scope)?;
                self.modules
                    .borrow_mut()
                    .insert(filename.clone(), module.clone());
                module
            }
            None => self
                .modules
                .borrow()
                .get(&filename)
                .cloned()
                .ok_or_else(|| ScriptError::new(format!("Module {filename} is not loaded")))?,
        };

        if !run {
            return Ok(());
        }
        let Some(entry) = module.entry() else {
            return Err(ScriptError::new(format!("{filename} has no entry function")));
        };
        entry(context).await
    }
}
