//! User RPC handlers, looked up by function name.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use pylon_tl::{Call, Value};

use crate::context::RequestContext;
use crate::errors::HandlerError;

/// Serves one function of the user schema.
///
/// The returned value is encoded with the server's schema set and wrapped
/// in `rpc_result`. Panics are caught by the dispatcher and reported to the
/// client as `rpc_error` code 0.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &RequestContext, request: Call) -> Result<Value, HandlerError>;
}

/// A [`Handler`] backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RequestContext, Call) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn call(&self, ctx: &RequestContext, request: Call) -> Result<Value, HandlerError> {
        (self.0)(ctx.clone(), request).await
    }
}

/// Wraps an async closure as a [`Handler`].
///
/// ```ignore
/// registry.register("echo", handler_fn(|_ctx, call| async move {
///     Ok::<Value, HandlerError>(Object::new("echoed").with("text", call.str("text").unwrap_or_default()).into())
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RequestContext, Call) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    FnHandler(f)
}

#[derive(Clone, Default)]
pub struct RpcRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handler previously registered under `name`.
    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Option<Arc<dyn Handler>> {
        self.handlers.insert(name.into(), Arc::new(handler))
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for RpcRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("RpcRegistry").field("functions", &names).finish()
    }
}
