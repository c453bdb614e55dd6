//! Live service and component instances.

use chrono::{DateTime, Utc};
use futures::future::{FutureExt, LocalBoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::resources::Resources;
use crate::commbus::{SubscriptionToken, Topics};
use crate::definition::{ComponentDefinition, Props, ServiceDefinition};
use crate::middleware::Pipeline;
use crate::types::{Error, InstanceId, Result, Router};

/// Local event listener.
pub type Listener = Rc<dyn Fn(Vec<Value>) -> LocalBoxFuture<'static, Result<()>>>;

/// Wrap an async closure as a [`Listener`].
pub fn listener<F, Fut>(f: F) -> Listener
where
    F: Fn(Vec<Value>) -> Fut + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    Rc::new(move |args| f(args).boxed_local())
}

/// Handle to a created instance, as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub router: Router,
    pub instance: InstanceId,
    pub worker: usize,
}

/// Where an instance currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Live,
    /// Stopped, waiting in the keep-alive cache.
    Cached,
    Absent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub router: Router,
    pub instance: InstanceId,
    pub worker: usize,
    pub created_at: DateTime<Utc>,
    pub components: Vec<String>,
}

/// Failure of a timer, event listener or notification, surfaced off-band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeError {
    pub worker: usize,
    pub router: Option<Router>,
    /// What failed, e.g. `timer:flush` or `event:tick`.
    pub origin: String,
    pub code: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Unset,
    Armed,
    Fired,
}

enum TimerSlot {
    Armed(JoinHandle<()>),
    Fired,
}

/// Named timers of one service or component.
///
/// A one-shot timer that fired stays `Fired` across restarts so it never
/// fires twice for the same instance.
#[derive(Default)]
pub(crate) struct TimerTable {
    slots: RefCell<HashMap<String, TimerSlot>>,
}

impl TimerTable {
    pub(crate) fn state(&self, name: &str) -> TimerState {
        match self.slots.borrow().get(name) {
            None => TimerState::Unset,
            Some(TimerSlot::Armed(_)) => TimerState::Armed,
            Some(TimerSlot::Fired) => TimerState::Fired,
        }
    }

    pub(crate) fn arm(&self, name: &str, handle: JoinHandle<()>) {
        if let Some(TimerSlot::Armed(old)) = self
            .slots
            .borrow_mut()
            .insert(name.to_string(), TimerSlot::Armed(handle))
        {
            old.abort();
        }
    }

    /// Mark a one-shot timer as fired; its task keeps running.
    pub(crate) fn fire(&self, name: &str) {
        self.slots.borrow_mut().insert(name.to_string(), TimerSlot::Fired);
    }

    /// Cancel armed timers. Fired markers are kept.
    pub(crate) fn disarm(&self) {
        self.slots.borrow_mut().retain(|_, slot| match slot {
            TimerSlot::Armed(handle) => {
                handle.abort();
                false
            }
            TimerSlot::Fired => true,
        });
    }
}

impl Drop for TimerTable {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl fmt::Debug for TimerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.borrow();
        f.debug_map()
            .entries(slots.iter().map(|(name, slot)| {
                let state = match slot {
                    TimerSlot::Armed(_) => TimerState::Armed,
                    TimerSlot::Fired => TimerState::Fired,
                };
                (name, state)
            }))
            .finish()
    }
}

/// Live instance of a service type, owned by exactly one worker.
pub struct Service {
    router: Router,
    instance: InstanceId,
    definition: Arc<ServiceDefinition>,
    worker: usize,
    created_at: DateTime<Utc>,
    props: RefCell<Props>,
    components: RefCell<Vec<Rc<Component>>>,
    pipeline: RefCell<Pipeline>,
    pub(crate) timers: TimerTable,
    events: RefCell<Topics<Listener>>,
    pub(crate) subscriptions: RefCell<Vec<SubscriptionToken>>,
    pub(crate) global_subscriptions: RefCell<Vec<SubscriptionToken>>,
    resources: Arc<Resources>,
    errors: broadcast::Sender<RuntimeError>,
}

impl Service {
    pub(crate) fn new(
        router: Router,
        definition: Arc<ServiceDefinition>,
        worker: usize,
        resources: Arc<Resources>,
        errors: broadcast::Sender<RuntimeError>,
    ) -> Self {
        Self {
            router,
            instance: InstanceId::new(),
            definition,
            worker,
            created_at: Utc::now(),
            props: RefCell::new(Props::new()),
            components: RefCell::new(Vec::new()),
            pipeline: RefCell::new(Pipeline::default()),
            timers: TimerTable::default(),
            events: RefCell::new(Topics::new()),
            subscriptions: RefCell::new(Vec::new()),
            global_subscriptions: RefCell::new(Vec::new()),
            resources,
            errors,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn kind(&self) -> &str {
        &self.router.kind
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn definition(&self) -> &Arc<ServiceDefinition> {
        &self.definition
    }

    /// Index of the owning worker.
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn prop(&self, key: &str) -> Option<Value> {
        self.props.borrow().get(key).cloned()
    }

    pub fn set_prop(&self, key: impl Into<String>, value: Value) {
        self.props.borrow_mut().insert(key.into(), value);
    }

    pub fn props(&self) -> Ref<'_, Props> {
        self.props.borrow()
    }

    pub fn props_mut(&self) -> RefMut<'_, Props> {
        self.props.borrow_mut()
    }

    pub(crate) fn merge_props(&self, props: Props) {
        self.props.borrow_mut().extend(props);
    }

    /// Components in instantiation order.
    pub fn components(&self) -> Vec<Rc<Component>> {
        self.components.borrow().clone()
    }

    pub fn component(&self, name: &str) -> Option<Rc<Component>> {
        self.components
            .borrow()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    pub(crate) fn push_component(&self, component: Rc<Component>) {
        self.components.borrow_mut().push(component);
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline.borrow().clone()
    }

    pub(crate) fn set_pipeline(&self, pipeline: Pipeline) {
        *self.pipeline.borrow_mut() = pipeline;
    }

    /// Drop the middleware chain and components. Called once the instance
    /// is destroyed; middleware handlers may hold the worker.
    pub(crate) fn release(&self) {
        self.set_pipeline(Pipeline::default());
        self.components.borrow_mut().clear();
    }

    pub fn resource<T: std::any::Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.resources.get(name)
    }

    pub fn timer_state(&self, name: &str) -> TimerState {
        self.timers.state(name)
    }

    /// Attach a listener to a local event.
    pub fn subscribe(&self, topic: impl Into<String>, listener: Listener) -> SubscriptionToken {
        self.events.borrow_mut().subscribe(topic, listener)
    }

    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        self.events.borrow_mut().unsubscribe(token)
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.events.borrow().subscriber_count(topic)
    }

    /// Run every listener of `topic` in subscription order. Listener failures
    /// are reported as runtime errors. Returns the number of listeners run.
    pub async fn emit(&self, topic: &str, args: Vec<Value>) -> usize {
        let listeners = self.events.borrow().subscribers(topic);
        for listener in &listeners {
            if let Err(e) = listener(args.clone()).await {
                self.report(format!("event:{}", topic), &e);
            }
        }
        listeners.len()
    }

    pub(crate) fn report(&self, origin: String, error: &Error) {
        tracing::error!(
            "service_error: router={} origin={} error={}",
            self.router,
            origin,
            error
        );
        let _ = self.errors.send(RuntimeError {
            worker: self.worker,
            router: Some(self.router.clone()),
            origin,
            code: error.code().to_string(),
            message: error.detail(),
            at: Utc::now(),
        });
    }

    pub fn to_ref(&self) -> ServiceRef {
        ServiceRef {
            router: self.router.clone(),
            instance: self.instance.clone(),
            worker: self.worker,
        }
    }

    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            router: self.router.clone(),
            instance: self.instance.clone(),
            worker: self.worker,
            created_at: self.created_at,
            components: self
                .components
                .borrow()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("router", &self.router)
            .field("instance", &self.instance)
            .field("worker", &self.worker)
            .field("props", &self.props.borrow())
            .field("components", &self.components.borrow())
            .field("timers", &self.timers)
            .finish_non_exhaustive()
    }
}

/// Component instance inside a service.
pub struct Component {
    name: String,
    definition: Arc<ComponentDefinition>,
    service: Weak<Service>,
    props: RefCell<Props>,
    pub(crate) timers: TimerTable,
    pub(crate) subscriptions: RefCell<Vec<SubscriptionToken>>,
}

impl Component {
    pub(crate) fn new(
        name: impl Into<String>,
        definition: Arc<ComponentDefinition>,
        service: Weak<Service>,
    ) -> Self {
        Self {
            name: name.into(),
            definition,
            service,
            props: RefCell::new(Props::new()),
            timers: TimerTable::default(),
            subscriptions: RefCell::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &Arc<ComponentDefinition> {
        &self.definition
    }

    /// Owning service, while it is alive.
    pub fn service(&self) -> Option<Rc<Service>> {
        self.service.upgrade()
    }

    pub fn prop(&self, key: &str) -> Option<Value> {
        self.props.borrow().get(key).cloned()
    }

    pub fn set_prop(&self, key: impl Into<String>, value: Value) {
        self.props.borrow_mut().insert(key.into(), value);
    }

    pub fn props(&self) -> Ref<'_, Props> {
        self.props.borrow()
    }

    pub(crate) fn merge_props(&self, props: Props) {
        self.props.borrow_mut().extend(props);
    }

    pub fn timer_state(&self, name: &str) -> TimerState {
        self.timers.state(name)
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("props", &self.props.borrow())
            .field("timers", &self.timers)
            .finish_non_exhaustive()
    }
}
