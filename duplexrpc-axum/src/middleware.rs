//! Middleware chains.
//!
//! A middleware validates or enriches a request before the handler runs.
//! Chains run in registration order and short-circuit on the first failure;
//! the failure reply is what the caller sees. One connection-wide chain runs
//! before the per-service chain of whatever the request targets.

use duplexrpc_core::{Reply, SharedContext};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub trait Middleware: Send + Sync + 'static {
    /// Returns ok to let the request pass, or an error reply to reject it.
    fn execute<'a>(&'a self, args: &'a Value, context: &'a SharedContext)
    -> BoxFuture<'a, Reply<()>>;
}

/// Adapts an async closure into a [`Middleware`].
pub fn middleware_fn<F, Fut>(f: F) -> impl Middleware
where
    F: Fn(Value, SharedContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Reply<()>> + Send + 'static,
{
    FnMiddleware(f)
}

struct FnMiddleware<F>(F);

impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Value, SharedContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Reply<()>> + Send + 'static,
{
    fn execute<'a>(
        &'a self,
        args: &'a Value,
        context: &'a SharedContext,
    ) -> BoxFuture<'a, Reply<()>> {
        (self.0)(args.clone(), context.clone()).boxed()
    }
}

/// An ordered middleware chain. Cheap to clone.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    entries: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, middleware: impl Middleware) -> Self {
        self.push(middleware);
        self
    }

    pub fn push(&mut self, middleware: impl Middleware) {
        self.entries.push(Arc::new(middleware));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs the chain in order. The first non-ok reply stops the chain and
    /// is returned; a panicking entry is converted into an error reply.
    pub async fn run(&self, args: &Value, context: &SharedContext) -> Reply<()> {
        for middleware in &self.entries {
            let outcome = AssertUnwindSafe(middleware.execute(args, context))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Reply::err(format!("Middleware panicked: {}", panic_message(&panic)))
                });
            if outcome.is_err() {
                return outcome;
            }
        }
        Reply::ok_empty()
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

// =============================================================================
// Tests
// =============================================================================
