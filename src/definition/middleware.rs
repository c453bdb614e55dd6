use futures::future::{FutureExt, LocalBoxFuture};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use crate::envelope::Event;
use crate::kernel::MiddlewareContext;
use crate::middleware::{handler, MiddlewareHandler, Next};
use crate::types::Result;

pub type MiddlewareSetupFn =
    Arc<dyn Fn(MiddlewareContext) -> LocalBoxFuture<'static, Result<MiddlewareHandler>> + Send + Sync>;

/// Middleware definition; its setup produces one handler per instance.
#[derive(Clone)]
pub struct MiddlewareDefinition {
    pub setup: MiddlewareSetupFn,
}

impl MiddlewareDefinition {
    /// Full form: per-instance setup that builds the handler, typically
    /// capturing state derived from the context options.
    pub fn new<F, Fut>(setup: F) -> Self
    where
        F: Fn(MiddlewareContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<MiddlewareHandler>> + 'static,
    {
        Self {
            setup: Arc::new(move |cx| setup(cx).boxed_local()),
        }
    }

    /// Stateless middleware given directly as its handler.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Rc<Event>, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        let f = Arc::new(f);
        Self::new(move |_cx| {
            let f = f.clone();
            async move { Ok(handler(move |event, next| f(event, next))) }
        })
    }

    /// Middleware that only delegates.
    pub fn passthrough() -> Self {
        Self::from_fn(|_event, next: Next| async move { next.run().await })
    }
}

impl fmt::Debug for MiddlewareDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareDefinition").finish_non_exhaustive()
    }
}
