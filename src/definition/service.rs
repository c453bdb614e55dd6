use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use super::{
    event_fn, handler_fn, hook_fn, method_fn, start_hook_fn, timer_fn, ComponentSetupFn, EventFn,
    HandlerFn, HookFn, MethodFn, MiddlewareDefinition, Props, ServiceRuntime, ServiceSetupFn,
    StartHookFn, TimerFn,
};
use crate::envelope::{Body, Event};
use crate::kernel::ServiceContext;
use crate::types::Result;

/// Lifecycle callbacks shared by services and components.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_start: Option<StartHookFn>,
    pub on_stop: Option<HookFn>,
    pub on_destroy: Option<HookFn>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_start", &self.on_start.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .field("on_destroy", &self.on_destroy.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSchedule {
    /// Fire once, `Duration` after the owner starts.
    Delay(Duration),
    /// Fire every `Duration`, first tick one period after start.
    Interval(Duration),
}

/// Named timer attached to a service or component.
#[derive(Clone)]
pub struct TimerDefinition {
    pub schedule: TimerSchedule,
    pub run: TimerFn,
}

impl TimerDefinition {
    pub fn delay<F, Fut>(after: Duration, f: F) -> Self
    where
        F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        Self {
            schedule: TimerSchedule::Delay(after),
            run: timer_fn(f),
        }
    }

    pub fn interval<F, Fut>(every: Duration, f: F) -> Self
    where
        F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        Self {
            schedule: TimerSchedule::Interval(every),
            run: timer_fn(f),
        }
    }
}

impl fmt::Debug for TimerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerDefinition")
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

/// Reusable unit of state and behavior attached to a service.
#[derive(Clone, Default)]
pub struct ComponentDefinition {
    pub setup: Option<ComponentSetupFn>,
    pub hooks: Hooks,
    pub methods: HashMap<String, MethodFn>,
    pub handlers: HashMap<String, HandlerFn>,
    /// Event name to listener; a `~` prefix also opts the owning service
    /// into the global event of the unprefixed name.
    pub events: Vec<(String, EventFn)>,
    pub timers: Vec<(String, TimerDefinition)>,
}

impl ComponentDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ServiceContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Props>>> + 'static,
    {
        self.setup = Some(Arc::new(move |cx, options| f(cx, options).boxed_local()));
        self
    }

    pub fn method<F, Fut, V>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ServiceContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + 'static,
        V: Into<Value>,
    {
        self.methods.insert(name.into(), method_fn(f));
        self
    }

    pub fn handler<F, Fut, B>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ServiceContext, Rc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<B>> + 'static,
        B: Into<Body>,
    {
        self.handlers.insert(name.into(), handler_fn(f));
        self
    }

    pub fn event<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ServiceContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.events.push((name.into(), event_fn(f)));
        self
    }

    pub fn timer(mut self, name: impl Into<String>, timer: TimerDefinition) -> Self {
        self.timers.push((name.into(), timer));
        self
    }

    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ServiceContext, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.hooks.on_start = Some(start_hook_fn(f));
        self
    }

    pub fn on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.hooks.on_stop = Some(hook_fn(f));
        self
    }

    pub fn on_destroy<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.hooks.on_destroy = Some(hook_fn(f));
        self
    }
}

impl fmt::Debug for ComponentDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDefinition")
            .field("setup", &self.setup.is_some())
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("events", &self.events.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("timers", &self.timers)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Definition of a service type.
///
/// Components and middlewares declared here shadow same-named module-level
/// definitions for this service.
#[derive(Clone, Default)]
pub struct ServiceDefinition {
    pub setup: Option<ServiceSetupFn>,
    /// Service types that must be created before and stopped after this one.
    pub depends: Vec<String>,
    /// Cache stopped instances this long before destroying them.
    pub keep_alive: Option<Duration>,
    /// Create an instance on first request instead of answering 404.
    pub auto_create: bool,
    pub components: Vec<(String, Arc<ComponentDefinition>)>,
    pub middlewares: Vec<(String, Arc<MiddlewareDefinition>)>,
    pub methods: HashMap<String, MethodFn>,
    pub handlers: HashMap<String, HandlerFn>,
    pub remotes: HashMap<String, HandlerFn>,
    pub events: Vec<(String, EventFn)>,
    pub timers: Vec<(String, TimerDefinition)>,
    pub hooks: Hooks,
}

impl ServiceDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setup<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ServiceContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<ServiceRuntime>>> + 'static,
    {
        self.setup = Some(Arc::new(move |cx, options| f(cx, options).boxed_local()));
        self
    }

    pub fn depends(mut self, kind: impl Into<String>) -> Self {
        self.depends.push(kind.into());
        self
    }

    pub fn keep_alive(mut self, ttl: Duration) -> Self {
        self.keep_alive = Some(ttl);
        self
    }

    pub fn auto_create(mut self, enabled: bool) -> Self {
        self.auto_create = enabled;
        self
    }

    pub fn component(mut self, name: impl Into<String>, definition: ComponentDefinition) -> Self {
        self.components.push((name.into(), Arc::new(definition)));
        self
    }

    pub fn middleware(mut self, name: impl Into<String>, definition: MiddlewareDefinition) -> Self {
        self.middlewares.push((name.into(), Arc::new(definition)));
        self
    }

    pub fn method<F, Fut, V>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ServiceContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + 'static,
        V: Into<Value>,
    {
        self.methods.insert(name.into(), method_fn(f));
        self
    }

    /// Handler reachable at `handlers/<name>`.
    pub fn handler<F, Fut, B>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ServiceContext, Rc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<B>> + 'static,
        B: Into<Body>,
    {
        self.handlers.insert(name.into(), handler_fn(f));
        self
    }

    /// Handler reachable at `remotes/<name>`.
    pub fn remote<F, Fut, B>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ServiceContext, Rc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<B>> + 'static,
        B: Into<Body>,
    {
        self.remotes.insert(name.into(), handler_fn(f));
        self
    }

    pub fn event<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ServiceContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.events.push((name.into(), event_fn(f)));
        self
    }

    pub fn timer(mut self, name: impl Into<String>, timer: TimerDefinition) -> Self {
        self.timers.push((name.into(), timer));
        self
    }

    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ServiceContext, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.hooks.on_start = Some(start_hook_fn(f));
        self
    }

    pub fn on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.hooks.on_stop = Some(hook_fn(f));
        self
    }

    pub fn on_destroy<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.hooks.on_destroy = Some(hook_fn(f));
        self
    }

    pub fn declared_component(&self, name: &str) -> Option<&Arc<ComponentDefinition>> {
        self.components.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn declared_middleware(&self, name: &str) -> Option<&Arc<MiddlewareDefinition>> {
        self.middlewares.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("depends", &self.depends)
            .field("keep_alive", &self.keep_alive)
            .field("auto_create", &self.auto_create)
            .field("components", &self.components.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("middlewares", &self.middlewares.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("remotes", &self.remotes.keys().collect::<Vec<_>>())
            .field("timers", &self.timers)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_declarations() {
        let definition = ServiceDefinition::new()
            .depends("db")
            .keep_alive(Duration::from_millis(50))
            .auto_create(true)
            .handler("hello", |_cx, _event| async { Ok("world") })
            .remote("ping", |_cx, _event| async { Ok(()) })
            .event("~tick", |_cx, _args| async { Ok(()) })
            .timer("sec", TimerDefinition::interval(Duration::from_secs(1), |_cx| async { Ok(()) }))
            .component("cache", ComponentDefinition::new().method("size", |_cx, _args| async { Ok(3) }))
            .on_start(|_cx, _reclaimed| async { Ok(()) });

        assert_eq!(definition.depends, vec!["db"]);
        assert_eq!(definition.keep_alive, Some(Duration::from_millis(50)));
        assert!(definition.auto_create);
        assert!(definition.handlers.contains_key("hello"));
        assert!(definition.remotes.contains_key("ping"));
        assert_eq!(definition.events[0].0, "~tick");
        assert_eq!(definition.timers[0].1.schedule, TimerSchedule::Interval(Duration::from_secs(1)));
        assert!(definition.declared_component("cache").unwrap().methods.contains_key("size"));
        assert!(definition.declared_component("missing").is_none());
        assert!(definition.hooks.on_start.is_some());
        assert!(definition.hooks.on_destroy.is_none());
    }

    #[test]
    fn test_definitions_are_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServiceDefinition>();
        assert_send_sync::<ComponentDefinition>();
        assert_send_sync::<MiddlewareDefinition>();
    }
}
