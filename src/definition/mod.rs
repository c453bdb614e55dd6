//! Declarative service, component and middleware definitions.
//!
//! Definitions are immutable, shared by every worker behind `Arc`, and built
//! with chained builders taking async closures:
//!
//! ```ignore
//! let echo = ServiceDefinition::new()
//!     .handler("hello", |_cx, _event| async { Ok("world") })
//!     .on_start(|_cx, reclaimed| async move {
//!         tracing::info!(reclaimed, "echo started");
//!         Ok(())
//!     });
//! ```
//!
//! The closures themselves are `Send + Sync`; the futures they return run on
//! one worker and need not be `Send`.

mod middleware;
mod module;
mod service;

pub use middleware::{MiddlewareDefinition, MiddlewareSetupFn};
pub use module::{BootDefinition, Module, Registry, ServiceCreate};
pub use service::{
    ComponentDefinition, Hooks, ServiceDefinition, TimerDefinition, TimerSchedule,
};

use futures::future::{FutureExt, LocalBoxFuture};
use serde_json::{Map, Value};
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use crate::envelope::{Body, Event};
use crate::kernel::ServiceContext;
use crate::types::Result;

/// Free-form properties attached to services and components.
pub type Props = Map<String, Value>;

type LocalResult<T> = LocalBoxFuture<'static, Result<T>>;

/// Service setup: receives creation options, may return a runtime description.
pub type ServiceSetupFn =
    Arc<dyn Fn(ServiceContext, Value) -> LocalResult<Option<ServiceRuntime>> + Send + Sync>;
/// Component setup: receives per-instance options, may return initial props.
pub type ComponentSetupFn =
    Arc<dyn Fn(ServiceContext, Value) -> LocalResult<Option<Props>> + Send + Sync>;
pub type HandlerFn = Arc<dyn Fn(ServiceContext, Rc<Event>) -> LocalResult<Body> + Send + Sync>;
pub type MethodFn = Arc<dyn Fn(ServiceContext, Vec<Value>) -> LocalResult<Value> + Send + Sync>;
pub type EventFn = Arc<dyn Fn(ServiceContext, Vec<Value>) -> LocalResult<()> + Send + Sync>;
pub type TimerFn = Arc<dyn Fn(ServiceContext) -> LocalResult<()> + Send + Sync>;
/// `on_start`; the flag is set when the instance was reclaimed from the keep-alive cache.
pub type StartHookFn = Arc<dyn Fn(ServiceContext, bool) -> LocalResult<()> + Send + Sync>;
pub type HookFn = Arc<dyn Fn(ServiceContext) -> LocalResult<()> + Send + Sync>;

pub(crate) fn handler_fn<F, Fut, B>(f: F) -> HandlerFn
where
    F: Fn(ServiceContext, Rc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<B>> + 'static,
    B: Into<Body>,
{
    Arc::new(move |cx, event| {
        let fut = f(cx, event);
        async move { fut.await.map(Into::into) }.boxed_local()
    })
}

pub(crate) fn method_fn<F, Fut, V>(f: F) -> MethodFn
where
    F: Fn(ServiceContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + 'static,
    V: Into<Value>,
{
    Arc::new(move |cx, args| {
        let fut = f(cx, args);
        async move { fut.await.map(Into::into) }.boxed_local()
    })
}

pub(crate) fn event_fn<F, Fut>(f: F) -> EventFn
where
    F: Fn(ServiceContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    Arc::new(move |cx, args| f(cx, args).boxed_local())
}

pub(crate) fn timer_fn<F, Fut>(f: F) -> TimerFn
where
    F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    Arc::new(move |cx| f(cx).boxed_local())
}

pub(crate) fn start_hook_fn<F, Fut>(f: F) -> StartHookFn
where
    F: Fn(ServiceContext, bool) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    Arc::new(move |cx, reclaimed| f(cx, reclaimed).boxed_local())
}

pub(crate) fn hook_fn<F, Fut>(f: F) -> HookFn
where
    F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    Arc::new(move |cx| f(cx).boxed_local())
}

/// Name of a component or middleware to instantiate, with its options.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateInfo {
    pub name: String,
    pub options: Value,
}

impl CreateInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Value::Null,
        }
    }

    pub fn with_options(name: impl Into<String>, options: Value) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

impl From<&str> for CreateInfo {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for CreateInfo {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<(&str, Value)> for CreateInfo {
    fn from((name, options): (&str, Value)) -> Self {
        Self::with_options(name, options)
    }
}

/// What a service setup decided to instantiate.
///
/// A setup that returns `None` gets every declared component and middleware,
/// in declaration order, with no options.
#[derive(Debug, Clone, Default)]
pub struct ServiceRuntime {
    pub props: Props,
    pub components: Vec<CreateInfo>,
    pub middlewares: Vec<CreateInfo>,
}

impl ServiceRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    pub fn component(mut self, info: impl Into<CreateInfo>) -> Self {
        self.components.push(info.into());
        self
    }

    pub fn middleware(mut self, info: impl Into<CreateInfo>) -> Self {
        self.middlewares.push(info.into());
        self
    }

    /// Every component and middleware declared on `definition`.
    pub fn declared_by(definition: &ServiceDefinition) -> Self {
        Self {
            props: Props::new(),
            components: definition
                .components
                .iter()
                .map(|(name, _)| CreateInfo::new(name.as_str()))
                .collect(),
            middlewares: definition
                .middlewares
                .iter()
                .map(|(name, _)| CreateInfo::new(name.as_str()))
                .collect(),
        }
    }
}
