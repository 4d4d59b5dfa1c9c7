//! Name-to-callable dispatch tables.
//!
//! Both the host and each plugin keep a [`FunctionTable`]. Incoming calls are
//! resolved by name; every outcome, including an unknown name, a failing
//! function or a panicking one, becomes a [`CallResponse`].

use crate::cancel::CancellationToken;
use crate::rpc::{error_codes, CallRequest, CallResponse, Metadata, Parameter};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error};

/// Per-call information handed to a function.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: String,
    pub metadata: Metadata,
    /// Cancelled when the owning host or plugin shuts down.
    pub cancel: CancellationToken,
}

impl CallContext {
    /// Metadata value for `key`, if present.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// A function callable over RPC.
///
/// Implemented for every `Fn(CallContext, Vec<Parameter>) -> impl Future`
/// returning `anyhow::Result<Parameter>`; implement it by hand for
/// functions that carry their own state.
#[async_trait]
pub trait Callable: Send + Sync {
    async fn call(&self, ctx: CallContext, params: Vec<Parameter>) -> anyhow::Result<Parameter>;
}

#[async_trait]
impl<F, Fut> Callable for F
where
    F: Fn(CallContext, Vec<Parameter>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Parameter>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, params: Vec<Parameter>) -> anyhow::Result<Parameter> {
        (self)(ctx, params).await
    }
}

/// Thread-safe map of function name to [`Callable`].
#[derive(Default)]
pub struct FunctionTable {
    functions: RwLock<HashMap<String, Arc<dyn Callable>>>,
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTable")
            .field("functions", &self.names())
            .finish()
    }
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async function under `name`, replacing any previous entry.
    pub fn register<F, Fut>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(CallContext, Vec<Parameter>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Parameter>> + Send + 'static,
    {
        self.register_callable(name, function);
    }

    /// Register any [`Callable`] under `name`, replacing any previous entry.
    pub fn register_callable(&self, name: impl Into<String>, function: impl Callable + 'static) {
        let name = name.into();
        debug!(function = %name, "Registered function");
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(function));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve and run `request.function_name`.
    pub async fn invoke(&self, request: CallRequest, cancel: CancellationToken) -> CallResponse {
        let function = self
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.function_name)
            .cloned();

        let Some(function) = function else {
            return CallResponse::failure(
                request.request_id,
                error_codes::FUNCTION_NOT_FOUND,
                format!("function {} not found", request.function_name),
            );
        };

        let ctx = CallContext {
            request_id: request.request_id.clone(),
            metadata: request.metadata,
            cancel,
        };

        let outcome = AssertUnwindSafe(function.call(ctx, request.parameters))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => CallResponse::ok(request.request_id, result),
            Ok(Err(e)) => CallResponse::failure(
                request.request_id,
                error_codes::FUNCTION_ERROR,
                format!("{:#}", e),
            ),
            Err(_) => {
                error!(function = %request.function_name, "Function panicked");
                CallResponse::failure(
                    request.request_id,
                    error_codes::FUNCTION_ERROR,
                    format!("function {} panicked", request.function_name),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    fn table() -> FunctionTable {
        let table = FunctionTable::new();
        table.register("Echo", |_ctx: CallContext, params: Vec<Parameter>| async move {
            let first = params.into_iter().next().unwrap_or_default();
            Ok(Parameter::string("echo", first.value))
        });
        table.register("Fail", |_ctx: CallContext, _params: Vec<Parameter>| async move {
            bail!("disk on fire")
        });
        table.register("Panic", |_ctx: CallContext, _params: Vec<Parameter>| async move {
            if true {
                panic!("boom");
            }
            Ok(Parameter::default())
        });
        table
    }

    #[tokio::test]
    async fn test_invoke_success_echoes_request_id() {
        let table = table();
        let mut request = CallRequest::new("Echo", vec![Parameter::string("a", "x")]);
        request.request_id = "req-1".into();

        let response = table.invoke(request, CancellationToken::new()).await;
        assert!(response.success);
        assert_eq!(response.request_id, "req-1");
        assert_eq!(response.value(), Some("x"));
    }

    #[tokio::test]
    async fn test_invoke_unknown_function() {
        let response = table()
            .invoke(CallRequest::new("Nope", vec![]), CancellationToken::new())
            .await;
        assert!(!response.success);
        assert_eq!(response.error_code, error_codes::FUNCTION_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invoke_function_error_carries_text() {
        let response = table()
            .invoke(CallRequest::new("Fail", vec![]), CancellationToken::new())
            .await;
        assert!(!response.success);
        assert_eq!(response.error_code, error_codes::FUNCTION_ERROR);
        assert!(response.message.contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_invoke_panic_becomes_function_error() {
        let response = table()
            .invoke(CallRequest::new("Panic", vec![]), CancellationToken::new())
            .await;
        assert!(!response.success);
        assert_eq!(response.error_code, error_codes::FUNCTION_ERROR);
    }

    #[test]
    fn test_names_sorted_and_unregister() {
        let table = table();
        assert_eq!(table.names(), vec!["Echo", "Fail", "Panic"]);
        assert!(table.unregister("Fail"));
        assert!(!table.contains("Fail"));
        assert_eq!(table.len(), 2);
    }
}
