use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::engine::{Compiler, EngineFactory, PassThrough, ScriptEngine};
use crate::error::CapabilityError;
use crate::executor::Executor;
use crate::mailbox::DEFAULT_CAPACITY;
use crate::protocol::CapabilityNames;

pub type CapabilityFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// Host function reachable from the sandbox. Receives the call arguments as
/// a JSON array.
pub type Capability = Arc<dyn Fn(Value) -> CapabilityFuture + Send + Sync>;

/// How the sandbox calls a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Convention {
    /// Blocks the sandbox thread until the host replies
    Sync,
    Async,
}

/// Name of the capability backing the sandbox console
pub const LOG_CAPABILITY: &str = "log";

#[derive(Default)]
pub(crate) struct HostCapabilities {
    table: HashMap<String, (Convention, Capability)>,
}

impl HostCapabilities {
    pub fn get(&self, convention: Convention, name: &str) -> Option<Capability> {
        self.table
            .get(name)
            .filter(|(registered, _)| *registered == convention)
            .map(|(_, capability)| capability.clone())
    }

    fn names_of(&self, convention: Convention) -> Vec<String> {
        let mut names: Vec<String> = self
            .table
            .iter()
            .filter(|(_, (registered, _))| *registered == convention)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn names(&self) -> CapabilityNames {
        CapabilityNames {
            sync: self.names_of(Convention::Sync),
            asynchronous: self.names_of(Convention::Async),
        }
    }
}

fn log_line(params: Value) -> CapabilityFuture {
    Box::pin(async move {
        let line = params.get(0).and_then(Value::as_str).unwrap_or_default();
        log::info!(target: "sandbox", "{}", line.trim_end());
        Ok(Value::Null)
    })
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Deadline for a single execution, from dispatch to result
    pub timeout_ms: u64,
    /// Largest synchronous reply the mailbox can carry
    pub mailbox_capacity: usize,
    /// Replace the sandbox after a timeout. Off by default: the timed-out
    /// execution keeps running and its late result is dropped.
    pub restart_on_timeout: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            mailbox_capacity: DEFAULT_CAPACITY,
            restart_on_timeout: false,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Everything an [`Executor`] needs, assembled by [`ExecutorBuilder`]
pub(crate) struct ExecutorParts {
    pub config: ExecutorConfig,
    pub props: Map<String, Value>,
    pub capabilities: Arc<HostCapabilities>,
    pub compiler: Arc<dyn Compiler>,
    pub engine: EngineFactory,
}

pub struct ExecutorBuilder {
    config: ExecutorConfig,
    props: Map<String, Value>,
    capabilities: HostCapabilities,
    duplicate: Option<String>,
    compiler: Arc<dyn Compiler>,
    engine: Option<EngineFactory>,
}

impl Default for ExecutorBuilder {
    fn default() -> Self {
        Self {
            config: ExecutorConfig::default(),
            props: Map::new(),
            capabilities: HostCapabilities::default(),
            duplicate: None,
            compiler: Arc::new(PassThrough),
            engine: None,
        }
    }
}

impl ExecutorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// A read-only property of the sandbox call context
    pub fn prop(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(name.into(), value.into());
        self
    }

    pub fn compiler(mut self, compiler: impl Compiler + 'static) -> Self {
        self.compiler = Arc::new(compiler);
        self
    }

    pub fn engine<E, F>(mut self, factory: F) -> Self
    where
        E: ScriptEngine + 'static,
        F: Fn() -> E + Send + Sync + 'static,
    {
        self.engine = Some(Arc::new(move || Box::new(factory()) as Box<dyn ScriptEngine>));
        self
    }

    fn register<F, Fut>(mut self, convention: Convention, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let name = name.into();
        if self.capabilities.table.contains_key(&name) {
            log::warn!("Host capability `{name}` registered twice");
            self.duplicate.get_or_insert(name);
            return self;
        }

        let capability: Capability = Arc::new(move |params: Value| -> CapabilityFuture {
            Box::pin(f(params))
        });
        self.capabilities.table.insert(name, (convention, capability));
        self
    }

    /// Register a capability the sandbox calls with the blocking convention.
    /// The handler itself may still be asynchronous on the host.
    pub fn add_sync_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(Convention::Sync, name, f)
    }

    pub fn add_async_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(Convention::Async, name, f)
    }

    /// Start the executor and its first sandbox. Must be called inside a
    /// tokio runtime.
    pub fn build(self) -> Result<Executor, CapabilityError> {
        Ok(Executor::start(self.into_parts()?))
    }

    pub(crate) fn into_parts(self) -> Result<ExecutorParts, CapabilityError> {
        if let Some(name) = self.duplicate {
            return Err(CapabilityError::DuplicateName(name));
        }
        let engine = self.engine.ok_or(CapabilityError::MissingEngine)?;

        let mut capabilities = self.capabilities;
        if !capabilities.table.contains_key(LOG_CAPABILITY) {
            let log: Capability = Arc::new(log_line);
            capabilities
                .table
                .insert(LOG_CAPABILITY.to_owned(), (Convention::Async, log));
        }

        Ok(ExecutorParts {
            config: self.config,
            props: self.props,
            capabilities: Arc::new(capabilities),
            compiler: self.compiler,
            engine,
        })
    }
}
