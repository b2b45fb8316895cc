//! Script engines evaluate sandboxed source into a [`Module`]
//!
//! An engine lives on the worker thread and is never shared, so modules and
//! their entry functions are free to hold `Rc` state.

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value;

use crate::context::{CallContext, Console};
use crate::error::ScriptError;

pub type EntryFuture = Pin<Box<dyn Future<Output = Result<(), ScriptError>>>>;
pub type EntryPoint = Rc<dyn Fn(CallContext) -> EntryFuture>;

/// Creates one engine per sandbox generation, on the worker thread
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn ScriptEngine> + Send + Sync>;

/// Directory every sandboxed module appears to live in
pub const SANDBOX_DIR: &str = "/sandbox";

/// An evaluated module, cached by filename for the life of a generation
#[derive(Clone, Default)]
pub struct Module {
    entry: Option<EntryPoint>,
}

impl Module {
    pub fn with_entry<F>(entry: F) -> Self
    where
        F: Fn(CallContext) -> EntryFuture + 'static,
    {
        Self {
            entry: Some(Rc::new(entry)),
        }
    }

    /// The designated entry function, invoked with the call context
    pub fn entry(&self) -> Option<&EntryPoint> {
        self.entry.as_ref()
    }
}

/// Everything module code can see while it is evaluated
pub struct ModuleScope {
    filename: String,
    console: Console,
}

impl ModuleScope {
    pub(crate) fn new(filename: &str, console: Console) -> Self {
        Self {
            filename: filename.to_owned(),
            console,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn dirname(&self) -> &str {
        SANDBOX_DIR
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    /// Module loading is not available in the sandbox
    pub fn require(&self, name: &str) -> Value {
        log::trace!("{}: ignoring require({name})", self.filename);
        Value::Null
    }
}

pub trait ScriptEngine {
    /// Evaluate `code` as the body of a module. Errors thrown by the body
    /// are returned, not raised.
    fn evaluate(&mut self, code: &str, scope: &ModuleScope) -> Result<Module, ScriptError>;
}

/// Turns source text into code the engine can evaluate. Runs on the host.
pub trait Compiler: Send + Sync {
    fn compile(&self, source: &str, filename: &str) -> Result<String, ScriptError>;
}

impl<F> Compiler for F
where
    F: Fn(&str, &str) -> Result<String, ScriptError> + Send + Sync,
{
    fn compile(&self, source: &str, filename: &str) -> Result<String, ScriptError> {
        self(source, filename)
    }
}

/// Compiler for engines that evaluate source directly
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl Compiler for PassThrough {
    fn compile(&self, source: &str, _filename: &str) -> Result<String, ScriptError> {
        Ok(source.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Statement {
    Log(String),
    Call {
        name: String,
        args: Value,
        asynchronous: bool,
    },
    Print,
    Fail(String),
}

#[derive(Debug)]
struct Line {
    number: usize,
    statement: Statement,
}

/// A line-oriented command language, one statement per line:
///
/// ```text
/// # comment
/// log some text          console output
/// call name [args...]    synchronous host call, result kept
/// await name [args...]   asynchronous host call, result kept
/// print                  log the last kept result
/// fail message           throw
/// ```
///
/// Arguments are a JSON array; a single non-array value is wrapped.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandEngine;

impl CommandEngine {
    fn parse_line(line: &str) -> Result<Statement, String> {
        let (command, rest) = line
            .split_once(char::is_whitespace)
            .map(|(command, rest)| (command, rest.trim()))
            .unwrap_or((line, ""));

        let statement = match command {
            "log" => Statement::Log(rest.to_owned()),
            "print" => Statement::Print,
            "fail" => Statement::Fail(rest.to_owned()),
            "call" | "await" => {
                let (name, args) = rest
                    .split_once(char::is_whitespace)
                    .map(|(name, args)| (name, args.trim()))
                    .unwrap_or((rest, ""));
                if name.is_empty() {
                    return Err(format!("`{command}` needs a capability name"));
                }
                let args = if args.is_empty() {
                    Value::Array(Vec::new())
                } else {
                    match serde_json::from_str(args) {
                        Ok(Value::Array(args)) => Value::Array(args),
                        Ok(other) => Value::Array(vec![other]),
                        Err(e) => return Err(format!("Invalid arguments: {e}")),
                    }
                };
                Statement::Call {
                    name: name.to_owned(),
                    args,
                    asynchronous: command == "await",
                }
            }
            other => return Err(format!("Unknown command `{other}`")),
        };
        Ok(statement)
    }
}

impl ScriptEngine for CommandEngine {
    fn evaluate(&mut self, code: &str, scope: &ModuleScope) -> Result<Module, ScriptError> {
        let filename = scope.filename().to_owned();
        let mut program = Vec::new();

        for (index, raw) in code.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let number = index + 1;
            let statement = Self::parse_line(line)
                .map_err(|message| ScriptError::new(message).at(format!("{filename}:{number}")))?;
            program.push(Line { number, statement });
        }

        let program = Rc::new(program);
        Ok(Module::with_entry(move |ctx: CallContext| -> EntryFuture {
            Box::pin(run_program(program.clone(), filename.clone(), ctx))
        }))
    }
}

async fn run_program(
    program: Rc<Vec<Line>>,
    filename: String,
    ctx: CallContext,
) -> Result<(), ScriptError> {
    let console = ctx.console();
    let mut last = Value::Null;

    for line in program.iter() {
        let locate = |e: ScriptError| {
            if e.location.is_some() {
                e
            } else {
                e.at(format!("{filename}:{}", line.number))
            }
        };

        match &line.statement {
            Statement::Log(text) => console.log(&[Value::String(text.clone())]),
            Statement::Print => console.log(std::slice::from_ref(&last)),
            Statement::Call {
                name,
                args,
                asynchronous: false,
            } => last = ctx.call_sync(name, args.clone()).map_err(locate)?,
            Statement::Call {
                name,
                args,
                asynchronous: true,
            } => last = ctx.call_async(name, args.clone()).await.map_err(locate)?,
            Statement::Fail(message) => return Err(locate(ScriptError::new(message.clone()))),
        }
    }
    Ok(())
}
