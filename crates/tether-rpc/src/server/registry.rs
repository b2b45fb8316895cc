use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::stream::EventStream;
use crate::envelope::ProcedureKind;
use crate::error::RpcError;

/// What a procedure produced: one value, or a stream for subscriptions
#[derive(Debug)]
pub enum ProcedureOutput {
    Value(Value),
    Stream(EventStream),
}

impl From<Value> for ProcedureOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<EventStream> for ProcedureOutput {
    fn from(stream: EventStream) -> Self {
        Self::Stream(stream)
    }
}

pub type ProcedureFuture = Pin<Box<dyn Future<Output = Result<ProcedureOutput, RpcError>> + Send>>;

/// Collaborator the server runtime invokes procedures through
pub trait ProcedureRegistry<C>: Send + Sync + 'static {
    fn invoke(&self, path: &str, input: Value, ctx: C, kind: ProcedureKind) -> ProcedureFuture;
}

type Handler<C> = Arc<dyn Fn(Value, C) -> ProcedureFuture + Send + Sync>;

struct Procedure<C> {
    kind: ProcedureKind,
    handler: Handler<C>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Procedure path {0:?} is registered twice")]
    DuplicatePath(String),
}

/// Path-keyed procedure table, resolved once at startup
pub struct Registry<C> {
    procedures: HashMap<String, Procedure<C>>,
}

impl<C> Registry<C> {
    pub fn builder() -> RegistryBuilder<C> {
        RegistryBuilder {
            procedures: HashMap::new(),
            duplicate: None,
        }
    }

    pub fn kind_of(&self, path: &str) -> Option<ProcedureKind> {
        self.procedures.get(path).map(|procedure| procedure.kind)
    }

    pub fn paths(&self) -> impl Iterator<Item = (&str, ProcedureKind)> {
        self.procedures
            .iter()
            .map(|(path, procedure)| (path.as_str(), procedure.kind))
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}

impl<C: Send + 'static> ProcedureRegistry<C> for Registry<C> {
    fn invoke(&self, path: &str, input: Value, ctx: C, kind: ProcedureKind) -> ProcedureFuture {
        match self.procedures.get(path) {
            Some(procedure) if procedure.kind == kind => (procedure.handler)(input, ctx),
            _ => {
                let err = RpcError::not_found(format!("No \"{kind}\"-procedure on path \"{path}\""));
                Box::pin(async move { Err(err) })
            }
        }
    }
}

pub struct RegistryBuilder<C> {
    procedures: HashMap<String, Procedure<C>>,
    duplicate: Option<String>,
}

impl<C: Send + 'static> RegistryBuilder<C> {
    pub fn query<F, Fut>(self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.value_procedure(path.into(), ProcedureKind::Query, handler)
    }

    pub fn mutation<F, Fut>(self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.value_procedure(path.into(), ProcedureKind::Mutation, handler)
    }

    /// Register a subscription. The handler is expected to yield
    /// [`ProcedureOutput::Stream`]; anything else is reported to the caller
    /// as an internal error.
    pub fn subscription<F, Fut>(self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ProcedureOutput, RpcError>> + Send + 'static,
    {
        let handler: Handler<C> =
            Arc::new(move |input: Value, ctx: C| -> ProcedureFuture { Box::pin(handler(input, ctx)) });
        self.insert(path.into(), ProcedureKind::Subscription, handler)
    }

    fn value_procedure<F, Fut>(self, path: String, kind: ProcedureKind, handler: F) -> Self
    where
        F: Fn(Value, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: Handler<C> = Arc::new(move |input: Value, ctx: C| -> ProcedureFuture {
            let fut = handler(input, ctx);
            Box::pin(async move { fut.await.map(ProcedureOutput::Value) })
        });
        self.insert(path, kind, handler)
    }

    fn insert(mut self, path: String, kind: ProcedureKind, handler: Handler<C>) -> Self {
        match self.procedures.entry(path) {
            Entry::Occupied(entry) => {
                if self.duplicate.is_none() {
                    self.duplicate = Some(entry.key().clone());
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Procedure { kind, handler });
            }
        }
        self
    }

    pub fn build(self) -> Result<Registry<C>, RegistryError> {
        if let Some(path) = self.duplicate {
            return Err(RegistryError::DuplicatePath(path));
        }
        Ok(Registry {
            procedures: self.procedures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn registry() -> Registry<()> {
        Registry::builder()
            .query("echo", |input, ()| async move { Ok(input) })
            .mutation("fail", |_, ()| async { Err(RpcError::bad_request("nope")) })
            .subscription("values", |_, ()| async {
                Ok(EventStream::from_values([json!(1)]).into())
            })
            .build()
            .expect("Failed to build registry")
    }

    #[tokio::test]
    async fn test_invoke_query() {
        let output = registry()
            .invoke("echo", json!("hi"), (), ProcedureKind::Query)
            .await
            .expect("invoke");
        assert!(matches!(output, ProcedureOutput::Value(v) if v == json!("hi")));
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_not_found() {
        let err = registry()
            .invoke("echo", json!(null), (), ProcedureKind::Mutation)
            .await
            .err()
            .expect("expected error");
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.message, "No \"mutation\"-procedure on path \"echo\"");
    }

    #[tokio::test]
    async fn test_handler_errors_pass_through() {
        let err = registry()
            .invoke("fail", json!(null), (), ProcedureKind::Mutation)
            .await
            .err()
            .expect("expected error");
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[test]
    fn test_duplicate_path_is_rejected() {
        let result = Registry::<()>::builder()
            .query("a", |input, ()| async move { Ok(input) })
            .subscription("a", |_, ()| async { Ok(json!(null).into()) })
            .build();
        assert!(matches!(result, Err(RegistryError::DuplicatePath(p)) if p == "a"));
    }

    #[test]
    fn test_kind_of() {
        let registry = registry();
        assert_eq!(registry.kind_of("values"), Some(ProcedureKind::Subscription));
        assert_eq!(registry.kind_of("missing"), None);
        assert_eq!(registry.len(), 3);
    }
}
