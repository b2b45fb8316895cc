//! Host side of the execution bridge
//!
//! A single driver task owns the queue, the in-flight execution and the
//! current worker generation. Executions run strictly one at a time in
//! arrival order. A crash or an undecodable worker message replaces the
//! worker before the next execution is dispatched. A timeout only does so
//! when `restart_on_timeout` is set.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::{Hash as _, Hasher as _};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::capability::{
    Capability, Convention, ExecutorBuilder, ExecutorConfig, ExecutorParts, HostCapabilities,
};
use crate::engine::{Compiler, EngineFactory};
use crate::error::{ExecutionError, MailboxError, ScriptError};
use crate::mailbox::SharedMailbox;
use crate::protocol::{HostMessage, WorkerEvent, WorkerMessage, encode_sync_reply};
use crate::worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Ready,
    Busy,
    /// Replaced after a crash; a new generation is being started
    Crashed,
}

type Reply = oneshot::Sender<Result<(), ExecutionError>>;

struct Job {
    code: String,
    filename: String,
    run: bool,
    reply: Reply,
}

enum Command {
    Execute(Job),
    Shutdown,
}

/// Runs sandboxed code and serves its host capability calls
pub struct Executor {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<WorkerState>,
}

impl Executor {
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::new()
    }

    pub(crate) fn start(parts: ExecutorParts) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (driver, state) = Driver::new(parts);
        tokio::spawn(driver.run(command_rx));

        Self { commands, state }
    }

    fn submit(
        &self,
        code: String,
        filename: String,
        run: bool,
    ) -> impl Future<Output = Result<(), ExecutionError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let queued = self
            .commands
            .send(Command::Execute(Job {
                code,
                filename,
                run,
                reply,
            }))
            .is_ok();

        async move {
            if !queued {
                return Err(ExecutionError::Shutdown);
            }
            rx.await.unwrap_or(Err(ExecutionError::Shutdown))
        }
    }

    /// Compile `code` and run its entry function in the sandbox.
    ///
    /// The execution is queued immediately, so executions dispatch in the
    /// order `execute` was called, not the order the futures are polled.
    pub fn execute(
        &self,
        code: impl Into<String>,
        filename: impl Into<String>,
    ) -> impl Future<Output = Result<(), ExecutionError>> + Send + 'static {
        self.submit(code.into(), filename.into(), true)
    }

    /// Compile and evaluate `code` without calling its entry function
    pub fn load(
        &self,
        code: impl Into<String>,
        filename: impl Into<String>,
    ) -> impl Future<Output = Result<(), ExecutionError>> + Send + 'static {
        self.submit(code.into(), filename.into(), false)
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Reject everything queued, stop the worker and end the driver
    pub fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).is_err() {
            log::debug!("Executor already shut down");
        }
    }
}

struct InFlight {
    seq: u64,
    filename: String,
    source_hash: u64,
    reply: Reply,
    deadline: Instant,
}

struct WorkerHandle {
    generation: u64,
    inbox: mpsc::UnboundedSender<HostMessage>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    mailbox: Arc<SharedMailbox>,
    /// Source hash of every module evaluated by this generation
    loaded: HashMap<String, u64>,
}

fn settle(reply: Reply, result: Result<(), ExecutionError>) {
    if reply.send(result).is_err() {
        log::trace!("Execution caller went away");
    }
}

fn source_hash(code: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    code.hash(&mut hasher);
    hasher.finish()
}

async fn next_event(worker: &mut Option<WorkerHandle>) -> Option<WorkerEvent> {
    match worker {
        Some(worker) => worker.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn invoke(handler: Option<Capability>, method: &str, params: Value) -> Result<Value, ScriptError> {
    let Some(handler) = handler else {
        return Err(ScriptError::new(format!("Unknown host capability `{method}`")));
    };
    handler(params)
        .await
        .map_err(|e| ScriptError::new(format!("{e:#}")))
}

struct Driver {
    config: ExecutorConfig,
    props: Map<String, Value>,
    capabilities: Arc<HostCapabilities>,
    compiler: Arc<dyn Compiler>,
    engine: EngineFactory,
    queue: VecDeque<Job>,
    current: Option<InFlight>,
    worker: Option<WorkerHandle>,
    generation: u64,
    next_seq: u64,
    state: watch::Sender<WorkerState>,
}

impl Driver {
    fn new(parts: ExecutorParts) -> (Self, watch::Receiver<WorkerState>) {
        let (state, state_rx) = watch::channel(WorkerState::Uninitialized);
        let driver = Self {
            config: parts.config,
            props: parts.props,
            capabilities: parts.capabilities,
            compiler: parts.compiler,
            engine: parts.engine,
            queue: VecDeque::new(),
            current: None,
            worker: None,
            generation: 0,
            next_seq: 0,
            state,
        };
        (driver, state_rx)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        if let Err(e) = self.ensure_worker() {
            log::error!("{e}");
        }

        loop {
            self.dispatch();
            let deadline = self.current.as_ref().map(|current| current.deadline);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Execute(job)) => self.queue.push_back(job),
                    Some(Command::Shutdown) | None => break,
                },
                event = next_event(&mut self.worker) => self.on_worker_event(event),
                () = sleep_until(deadline) => self.on_timeout(),
            }
        }

        self.shut_down(&mut commands);
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    fn ensure_worker(&mut self) -> Result<(), ExecutionError> {
        if self.worker.is_some() {
            return Ok(());
        }

        self.generation += 1;
        let generation = self.generation;
        let mailbox = Arc::new(SharedMailbox::new(self.config.mailbox_capacity));
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();

        worker::spawn(generation, self.engine.clone(), inbox_rx, events_tx).map_err(|e| {
            ExecutionError::Unavailable(format!("Failed to start sandbox worker: {e}"))
        })?;
        inbox
            .send(HostMessage::Init {
                mailbox: mailbox.clone(),
                props: self.props.clone(),
                capabilities: self.capabilities.names(),
            })
            .map_err(|e| ExecutionError::Unavailable(e.to_string()))?;

        log::info!("Sandbox generation {generation} started");
        self.worker = Some(WorkerHandle {
            generation,
            inbox,
            events,
            mailbox,
            loaded: HashMap::new(),
        });
        self.set_state(WorkerState::Ready);
        Ok(())
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            // wakes a sandbox thread blocked in a synchronous call
            worker.mailbox.invalidate();
            log::debug!("Sandbox generation {} stopped", worker.generation);
        }
    }

    fn restart(&mut self, error: ScriptError) {
        if let Some(current) = self.current.take() {
            settle(current.reply, Err(ExecutionError::Crashed(error)));
        }
        self.set_state(WorkerState::Crashed);
        self.stop_worker();
        if let Err(e) = self.ensure_worker() {
            log::error!("{e}");
        }
    }

    fn dispatch(&mut self) {
        while self.current.is_none() {
            let Some(job) = self.queue.pop_front() else {
                return;
            };
            if job.reply.is_closed() {
                log::debug!("Skipping abandoned execution of {}", job.filename);
                continue;
            }
            if let Err(e) = self.ensure_worker() {
                settle(job.reply, Err(e));
                continue;
            }
            let Some(worker) = self.worker.as_mut() else {
                continue;
            };

            let source_hash = source_hash(&job.code);
            let cached = worker.loaded.get(&job.filename) == Some(&source_hash);
            let code = if cached {
                None
            } else {
                match self.compiler.compile(&job.code, &job.filename) {
                    Ok(code) => Some(code),
                    Err(e) => {
                        log::debug!("Failed to compile {}: {e}", job.filename);
                        settle(job.reply, Err(ExecutionError::Compile(e)));
                        continue;
                    }
                }
            };

            self.next_seq += 1;
            let seq = self.next_seq;
            log::debug!(
                "Dispatching execution {seq} of {} (cached: {cached})",
                job.filename
            );
            let sent = worker.inbox.send(HostMessage::Execute {
                seq,
                code,
                filename: job.filename.clone(),
                run: job.run,
            });
            if sent.is_err() {
                // the closed event channel reports the crash shortly
                log::warn!("Sandbox generation {} is gone", worker.generation);
            }

            self.current = Some(InFlight {
                seq,
                filename: job.filename,
                source_hash,
                reply: job.reply,
                deadline: Instant::now() + self.config.timeout(),
            });
            self.set_state(WorkerState::Busy);
        }
    }

    fn on_worker_event(&mut self, event: Option<WorkerEvent>) {
        match event {
            Some(WorkerEvent::Message(bytes)) => match WorkerMessage::decode(&bytes) {
                Ok(message) => self.on_worker_message(message),
                Err(e) => {
                    log::warn!("Undecodable message from sandbox, restarting: {e}");
                    self.restart(ScriptError::new(format!("Undecodable message from sandbox: {e}")));
                }
            },
            Some(WorkerEvent::Crashed(error)) => {
                log::error!("Sandbox crashed: {error}");
                self.restart(error);
            }
            None => {
                log::error!("Sandbox worker exited unexpectedly");
                self.restart(ScriptError::new("Sandbox worker exited unexpectedly"));
            }
        }
    }

    fn on_worker_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::ExecutionResult { seq, error } => {
                let Some(current) = self.current.take_if(|current| current.seq == seq) else {
                    log::debug!("Ignoring result of abandoned execution {seq}");
                    return;
                };

                if let Some(worker) = self.worker.as_mut() {
                    if error.is_none() {
                        worker.loaded.insert(current.filename, current.source_hash);
                    } else {
                        worker.loaded.remove(&current.filename);
                    }
                }
                let result = match error {
                    Some(e) => Err(ExecutionError::Runtime(e)),
                    None => Ok(()),
                };
                settle(current.reply, result);
                self.set_state(WorkerState::Ready);
            }
            WorkerMessage::CallRequest {
                method,
                params,
                correlation_id,
            } => self.on_call_request(method, params, correlation_id),
        }
    }

    fn on_call_request(&self, method: String, params: Value, correlation_id: Option<u64>) {
        let Some(worker) = &self.worker else {
            return;
        };
        log::trace!("Sandbox calls {method}({params})");

        match correlation_id {
            None => {
                let handler = self.capabilities.get(Convention::Sync, &method);
                let mailbox = worker.mailbox.clone();
                tokio::spawn(async move {
                    let result = invoke(handler, &method, params).await;
                    match mailbox.write(&encode_sync_reply(result)) {
                        Ok(()) => {}
                        Err(e @ MailboxError::TooLarge { .. }) => {
                            let reply = encode_sync_reply(Err(ScriptError::new(format!(
                                "Reply to `{method}` too large: {e}"
                            ))));
                            if let Err(e) = mailbox.write(&reply) {
                                log::warn!("Failed to answer `{method}`: {e}");
                            }
                        }
                        Err(MailboxError::Invalidated) => {
                            log::debug!("Dropping reply to `{method}`, sandbox was replaced");
                        }
                    }
                });
            }
            Some(correlation_id) => {
                let handler = self.capabilities.get(Convention::Async, &method);
                let inbox = worker.inbox.clone();
                tokio::spawn(async move {
                    let result = invoke(handler, &method, params).await;
                    let message = HostMessage::AsyncCallResult {
                        correlation_id,
                        result,
                    };
                    if inbox.send(message).is_err() {
                        log::debug!("Dropping reply to `{method}`, sandbox was replaced");
                    }
                });
            }
        }
    }

    fn on_timeout(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        let timeout = self.config.timeout();
        log::warn!("Execution of {} timed out after {timeout:?}", current.filename);
        settle(current.reply, Err(ExecutionError::Timeout(timeout)));

        if self.config.restart_on_timeout {
            self.stop_worker();
            if let Err(e) = self.ensure_worker() {
                log::error!("{e}");
            }
        } else {
            // a late result for this seq is ignored
            self.set_state(WorkerState::Ready);
        }
    }

    fn shut_down(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Execute(job) = command {
                self.queue.push_back(job);
            }
        }

        if let Some(current) = self.current.take() {
            settle(current.reply, Err(ExecutionError::Shutdown));
        }
        for job in self.queue.drain(..) {
            settle(job.reply, Err(ExecutionError::Shutdown));
        }
        self.stop_worker();
        self.set_state(WorkerState::Uninitialized);
        log::info!("Executor shut down");
    }
}
