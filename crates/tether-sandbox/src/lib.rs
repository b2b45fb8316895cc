//! Execution bridge for untrusted code
//!
//! An [`Executor`] runs sandboxed modules on a dedicated worker thread, one
//! execution at a time. Sandboxed code reaches host capabilities through its
//! [`CallContext`], either synchronously (the worker thread blocks on a
//! [`SharedMailbox`] until the host replies) or asynchronously (the call
//! returns a future settled by a correlated reply).

pub mod capability;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod mailbox;
pub mod protocol;
mod worker;

pub use capability::{Capability, CapabilityFuture, Convention, ExecutorBuilder, ExecutorConfig};
pub use context::{CallContext, Console};
pub use engine::{CommandEngine, Compiler, EntryFuture, Module, ModuleScope, PassThrough, ScriptEngine};
pub use error::{CapabilityError, ExecutionError, MailboxError, ScriptError};
pub use executor::{Executor, WorkerState};
pub use mailbox::SharedMailbox;
